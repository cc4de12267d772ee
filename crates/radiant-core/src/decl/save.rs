//! Save-in-place: rewrite one declaration inside a file that holds many.

use std::path::Path;

use regex::RegexBuilder;

use super::DeclError;

/// Comment written above declarations appended by the editor.
pub const GENERATED_HEADER: &str = "/*\n\tGenerated by the Radiant declaration editor.\n*/";

/// Copies `input` into `out`, leaving out the block declaring `name`.
///
/// Returns the byte offset in `input` right after the removed block, or `None`
/// when the declaration was not found (in which case all of `input` was copied).
pub fn strip_declaration(input: &str, type_name: &str, name: &str, out: &mut String) -> Option<usize> {
    let keyword = if type_name.is_empty() {
        String::new()
    } else {
        format!("(?:{}\\s+)?", regex::escape(type_name))
    };
    let pattern = format!(r"^\s*{keyword}{}\s*(\{{)?\s*$", regex::escape(name));
    let Ok(header) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
        tracing::error!("[declmgr] Invalid declaration pattern {}", pattern);
        out.push_str(input);
        return None;
    };

    let mut offset = 0;
    let mut lines = input.split_inclusive('\n');

    while let Some(line) = lines.next() {
        offset += line.len();
        let content = line.trim_end_matches(['\n', '\r']);

        let Some(captures) = header.captures(content) else {
            out.push_str(content);
            out.push('\n');
            continue;
        };

        let mut depth: i32 = i32::from(captures.get(1).is_some());
        let mut opened = depth > 0;

        for line in lines.by_ref() {
            offset += line.len();
            for c in strip_line_comment(line).chars() {
                match c {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            if opened && depth <= 0 {
                break;
            }
        }
        return Some(offset);
    }
    None
}

fn strip_line_comment(line: &str) -> &str {
    line.find("//").map_or(line, |pos| &line[..pos])
}

/// Writes the generated header unless the text already ends with one.
fn push_header(out: &mut String) {
    if out.trim_end().ends_with(GENERATED_HEADER) {
        return;
    }
    out.push_str(GENERATED_HEADER);
    out.push('\n');
}

/// Full text of a declaration: header line plus braced body.
pub(super) fn format_declaration(type_name: &str, name: &str, body: &str) -> String {
    let head = if type_name.is_empty() {
        name.to_string()
    } else {
        format!("{type_name} {name}")
    };
    let mut text = format!("{head}\n{{\n{body}");
    if !body.is_empty() && !body.ends_with('\n') {
        text.push('\n');
    }
    text.push_str("}\n");
    text
}

/// Writes `decl_text` into `target`, replacing the named block or appending it.
///
/// `inherited` seeds a missing target with the contents of the file as seen
/// through the VFS, so sibling declarations survive the copy.
pub(super) fn save_in_place(
    target: &Path,
    inherited: Option<&str>,
    type_name: &str,
    name: &str,
    decl_text: &str,
) -> Result<(), DeclError> {
    let io_err = |path: &Path| {
        let path = path.display().to_string();
        move |source: std::io::Error| DeclError::Io { path, source }
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    if !target.exists() {
        if let Some(contents) = inherited {
            tracing::info!("[declmgr] Inheriting {} from the VFS", target.display());
            std::fs::write(target, contents).map_err(io_err(target))?;
        }
    }

    let mut out = String::new();
    if target.exists() {
        let existing = std::fs::read_to_string(target).map_err(io_err(target))?;
        match strip_declaration(&existing, type_name, name, &mut out) {
            Some(rest) => {
                push_header(&mut out);
                out.push_str(decl_text);
                out.push_str(&existing[rest..]);
            }
            None => {
                out.push('\n');
                push_header(&mut out);
                out.push_str(decl_text);
            }
        }
    } else {
        push_header(&mut out);
        out.push_str(decl_text);
    }

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = target.with_file_name(format!("_{file_name}"));
    std::fs::write(&temp, out).map_err(io_err(&temp))?;

    if target.exists() && std::fs::remove_file(target).is_err() {
        return Err(DeclError::Remove(target.display().to_string()));
    }
    if std::fs::rename(&temp, target).is_err() {
        return Err(DeclError::Rename(temp.display().to_string()));
    }
    Ok(())
}
