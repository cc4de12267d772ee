//! Named console commands with typed argument signatures.
//!
//! A command line is a `;`-separated list of statements, each a command name
//! followed by whitespace-separated arguments. Double quotes group an argument
//! containing spaces, e.g. `OpenMap "maps/my map.map"`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::math::Vector3;
use crate::module::{ModuleContext, ModuleError, RegisterableModule};

pub const MODULE_COMMANDSYSTEM: &str = "CommandSystem";

#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Int(i64),
    Real(f64),
    String(String),
    Vector3(Vector3),
}

impl Argument {
    /// Classifies a raw token: integer, real, `"x y z"` vector, else string.
    pub fn from_token(token: &str) -> Self {
        if let Ok(value) = token.parse::<i64>() {
            Self::Int(value)
        } else if let Ok(value) = token.parse::<f64>() {
            Self::Real(value)
        } else if let Some(vector) = Vector3::parse(token) {
            Self::Vector3(vector)
        } else {
            Self::String(token.to_string())
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_vector3(&self) -> Option<Vector3> {
        match self {
            Self::Vector3(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_string(&self) -> String {
        self.to_string()
    }

    fn matches(&self, kind: ArgType) -> bool {
        match kind {
            ArgType::Int => matches!(self, Self::Int(_)),
            ArgType::Real => matches!(self, Self::Int(_) | Self::Real(_)),
            ArgType::String => true,
            ArgType::Vector3 => matches!(self, Self::Vector3(_)),
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
            Self::Vector3(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Int,
    Real,
    String,
    Vector3,
}

/// One parameter of a command signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub kind: ArgType,
    pub optional: bool,
}

impl ArgSpec {
    pub const fn required(kind: ArgType) -> Self {
        Self { kind, optional: false }
    }

    pub const fn optional(kind: ArgType) -> Self {
        Self { kind, optional: true }
    }
}

impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            ArgType::Int => "int",
            ArgType::Real => "real",
            ArgType::String => "string",
            ArgType::Vector3 => "vector3",
        };
        if self.optional {
            write!(f, "[{name}]")
        } else {
            f.write_str(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Cannot execute {command}, expected arguments: {expected}")]
    SignatureMismatch { command: String, expected: String },
    #[error("Command {0} cannot be executed right now")]
    Disabled(String),
    #[error("Unterminated quote in command line")]
    UnterminatedQuote,
}

pub type CommandFn = Arc<dyn Fn(&[Argument]) + Send + Sync>;
pub type CheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

struct Command {
    name: String,
    signature: Vec<ArgSpec>,
    function: CommandFn,
    check: Option<CheckFn>,
}

impl Command {
    fn accepts(&self, args: &[Argument]) -> bool {
        if args.len() > self.signature.len() {
            return false;
        }
        self.signature.iter().enumerate().all(|(i, spec)| match args.get(i) {
            Some(arg) => arg.matches(spec.kind),
            None => spec.optional,
        })
    }

    fn signature_text(&self) -> String {
        if self.signature.is_empty() {
            return "none".to_string();
        }
        self.signature.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
    }
}

#[derive(Default)]
pub struct CommandSystem {
    commands: RwLock<BTreeMap<String, Arc<Command>>>,
}

impl CommandSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(
        &self,
        name: &str,
        signature: &[ArgSpec],
        function: impl Fn(&[Argument]) + Send + Sync + 'static,
    ) -> bool {
        self.insert(name, signature, Arc::new(function), None)
    }

    /// Adds a command that only runs while `check` returns true.
    pub fn add_with_check(
        &self,
        name: &str,
        signature: &[ArgSpec],
        function: impl Fn(&[Argument]) + Send + Sync + 'static,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) -> bool {
        self.insert(name, signature, Arc::new(function), Some(Arc::new(check)))
    }

    fn insert(&self, name: &str, signature: &[ArgSpec], function: CommandFn, check: Option<CheckFn>) -> bool {
        let mut commands = self.commands.write();
        let key = name.to_ascii_lowercase();
        if commands.contains_key(&key) {
            tracing::warn!("[command] Cannot register command {}, it already exists", name);
            return false;
        }
        commands.insert(
            key,
            Arc::new(Command {
                name: name.to_string(),
                signature: signature.to_vec(),
                function,
                check,
            }),
        );
        true
    }

    pub fn remove_command(&self, name: &str) -> bool {
        self.commands.write().remove(&name.to_ascii_lowercase()).is_some()
    }

    pub fn command_exists(&self, name: &str) -> bool {
        self.commands.read().contains_key(&name.to_ascii_lowercase())
    }

    /// Whether the command exists and its check (if any) passes.
    pub fn can_execute(&self, name: &str) -> bool {
        self.find(name)
            .is_some_and(|command| command.check.as_ref().is_none_or(|check| check()))
    }

    /// Command names in case-insensitive order.
    pub fn foreach_command(&self, mut visitor: impl FnMut(&str, &str)) {
        let commands: Vec<_> = self.commands.read().values().cloned().collect();
        for command in commands {
            visitor(&command.name, &command.signature_text());
        }
    }

    fn find(&self, name: &str) -> Option<Arc<Command>> {
        self.commands.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn execute_command(&self, name: &str, args: &[Argument]) -> Result<(), CommandError> {
        let Some(command) = self.find(name) else {
            tracing::warn!("[command] Unknown command: {}", name);
            return Err(CommandError::UnknownCommand(name.to_string()));
        };

        if !command.accepts(args) {
            let expected = command.signature_text();
            tracing::warn!("[command] Cannot execute {}, expected arguments: {}", command.name, expected);
            return Err(CommandError::SignatureMismatch {
                command: command.name.clone(),
                expected,
            });
        }

        if let Some(check) = &command.check {
            if !check() {
                tracing::warn!("[command] Command {} cannot be executed right now", command.name);
                return Err(CommandError::Disabled(command.name.clone()));
            }
        }

        (command.function)(args);
        Ok(())
    }

    /// Runs every statement of `line`; failing statements are reported and skipped.
    /// Returns the first error encountered.
    pub fn execute(&self, line: &str) -> Result<(), CommandError> {
        let statements = split_statements(line).inspect_err(|e| tracing::warn!("[command] {}", e))?;

        let mut first_error = None;
        for statement in statements {
            let Some((name, args)) = statement.split_first() else {
                continue;
            };
            let args: Vec<Argument> = args.iter().map(|a| Argument::from_token(a)).collect();
            if let Err(e) = self.execute_command(name, &args) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Splits a command line into statements of tokens.
fn split_statements(line: &str) -> Result<Vec<Vec<String>>, CommandError> {
    let mut statements = Vec::new();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for ch in line.chars() {
        if in_quotes {
            if ch == '"' {
                in_quotes = false;
            } else {
                current.push(ch);
            }
            continue;
        }
        match ch {
            '"' => {
                in_quotes = true;
                quoted = true;
            }
            ';' => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
                if !tokens.is_empty() {
                    statements.push(std::mem::take(&mut tokens));
                }
            }
            c if c.is_whitespace() => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }

    if in_quotes {
        return Err(CommandError::UnterminatedQuote);
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }
    if !tokens.is_empty() {
        statements.push(tokens);
    }
    Ok(statements)
}

impl RegisterableModule for CommandSystem {
    fn name(&self) -> &'static str {
        MODULE_COMMANDSYSTEM
    }

    fn initialise_module(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        tracing::info!("[command] Command system ready");
        Ok(())
    }

    fn shutdown_module(&self) {
        self.commands.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    use parking_lot::Mutex;

    use super::*;

    fn setup_counter(commands: &CommandSystem) -> Arc<AtomicI64> {
        let total = Arc::new(AtomicI64::new(0));
        let t = total.clone();
        commands.add_command("Add", &[ArgSpec::required(ArgType::Int)], move |args| {
            t.fetch_add(args[0].as_int().unwrap(), Ordering::SeqCst);
        });
        total
    }

    #[test]
    fn test_execute_sequence() {
        let commands = CommandSystem::new();
        let total = setup_counter(&commands);

        commands.execute("Add 1;add 2 ;  ADD 3").unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_signature_mismatch_does_not_run() {
        let commands = CommandSystem::new();
        let total = setup_counter(&commands);

        let err = commands.execute("Add foo").unwrap_err();
        assert!(matches!(err, CommandError::SignatureMismatch { .. }));
        assert!(commands.execute_command("Add", &[]).is_err());
        assert!(commands.execute_command("Add", &[Argument::Int(1), Argument::Int(2)]).is_err());
        assert_eq!(total.load(Ordering::SeqCst), 0);

        assert_eq!(
            commands.execute("Missing 1"),
            Err(CommandError::UnknownCommand("Missing".to_string()))
        );
    }

    #[test]
    fn test_failed_statement_does_not_stop_the_rest() {
        let commands = CommandSystem::new();
        let total = setup_counter(&commands);
        assert!(commands.execute("Add x; Add 5").is_err());
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_argument_types() {
        assert_eq!(Argument::from_token("12"), Argument::Int(12));
        assert_eq!(Argument::from_token("1.5"), Argument::Real(1.5));
        assert_eq!(
            Argument::from_token("10 20 30"),
            Argument::Vector3(Vector3::new(10.0, 20.0, 30.0))
        );
        assert_eq!(Argument::from_token("maps/a.map"), Argument::String("maps/a.map".to_string()));

        let commands = CommandSystem::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        commands.add_command(
            "Place",
            &[ArgSpec::required(ArgType::Vector3), ArgSpec::optional(ArgType::String)],
            move |args| r.lock().extend(args.iter().cloned()),
        );
        commands.execute("Place \"1 2 3\" \"my name\"").unwrap();
        commands.execute("Place \"4 5 6\"").unwrap();
        assert!(commands.execute("Place 4").is_err());
        assert_eq!(received.lock().len(), 3);
        assert_eq!(received.lock()[1], Argument::String("my name".to_string()));
    }

    #[test]
    fn test_checked_command() {
        let commands = CommandSystem::new();
        let enabled = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicBool::new(false));
        let (e, r) = (enabled.clone(), ran.clone());
        commands.add_with_check("Go", &[], move |_| r.store(true, Ordering::SeqCst), move || {
            e.load(Ordering::SeqCst)
        });

        assert!(commands.command_exists("go"));
        assert!(!commands.can_execute("Go"));
        assert_eq!(commands.execute("Go"), Err(CommandError::Disabled("Go".to_string())));
        assert!(!ran.load(Ordering::SeqCst));

        enabled.store(true, Ordering::SeqCst);
        assert!(commands.can_execute("Go"));
        commands.execute("Go").unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(!commands.add_command("GO", &[], |_| {}));
    }
}
