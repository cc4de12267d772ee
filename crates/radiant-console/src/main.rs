//! Radiant console
//!
//! Runs an editing session without a GUI and feeds command lines to the
//! command registry, either from `-c` arguments or from stdin.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use radiant_core::Editor;
use radiant_core::command::{ArgSpec, ArgType, Argument, CommandSystem};
use radiant_core::config::EditorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "radiant-console")]
#[command(about = "Runs editor commands without a GUI")]
struct Args {
    /// Editor configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command line to execute instead of reading stdin (repeatable)
    #[arg(short = 'c', long = "command")]
    commands: Vec<String>,
}

fn register_console_commands(commands: &Arc<CommandSystem>) {
    let weak = Arc::downgrade(commands);
    commands.add_command("ListCommands", &[], move |_| {
        let Some(commands) = weak.upgrade() else {
            return;
        };
        commands.foreach_command(|name, signature| {
            if signature.is_empty() {
                println!("{name}");
            } else {
                println!("{name} {signature}");
            }
        });
    });

    commands.add_command("Echo", &[ArgSpec::required(ArgType::String)], |args| {
        let text: Vec<String> = args.iter().map(Argument::as_string).collect();
        println!("{}", text.join(" "));
    });
}

fn run_line(editor: &Editor, line: &str) {
    if let Err(e) = editor.commands().execute(line) {
        eprintln!("{e}");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            EditorConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))?
        }
        None => EditorConfig::default(),
    };

    let editor = Editor::new(config).context("failed to set up modules")?;
    editor.initialise().context("failed to initialise modules")?;
    register_console_commands(editor.commands());

    if args.commands.is_empty() {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line.context("failed to read stdin")?;
            let line = line.trim();
            if line == "quit" || line == "exit" {
                break;
            }
            if !line.is_empty() {
                run_line(&editor, line);
            }
        }
    } else {
        for line in &args.commands {
            run_line(&editor, line);
        }
    }

    editor.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_collect_repeated_commands() {
        let args = Args::try_parse_from([
            "radiant-console",
            "--config",
            "editor.json",
            "-c",
            "NewMap",
            "-c",
            "CreateLayer walls",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("editor.json")));
        assert_eq!(args.commands, vec!["NewMap".to_string(), "CreateLayer walls".to_string()]);
    }

    #[test]
    fn test_args_reject_unknown_flags() {
        assert!(Args::try_parse_from(["radiant-console", "--frobnicate"]).is_err());
        let args = Args::try_parse_from(["radiant-console"]).unwrap();
        assert!(args.config.is_none());
        assert!(args.commands.is_empty());
    }
}
