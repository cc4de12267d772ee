//! Tokeniser shared by declaration, map and info-file parsers.
//!
//! Whitespace separates tokens, each delimiter character is a token of its own,
//! double-quoted strings are returned without their quotes (backslashes are
//! kept literally), and `//` / `/* */` comments are skipped.

/// Delimiters used for declaration bodies.
pub const DECL_DELIMITERS: &str = "{}(),";

/// Delimiters used for map files.
pub const MAP_DELIMITERS: &str = "{}()";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: expected '{expected}', found '{found}'")]
    UnexpectedToken {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("Unexpected end of input")]
    EndOfInput,
}

pub struct DefTokeniser<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
    delimiters: &'static str,
    pushback: Vec<String>,
}

impl<'a> DefTokeniser<'a> {
    pub fn new(text: &'a str) -> Self {
        Self::with_delimiters(text, DECL_DELIMITERS)
    }

    pub fn with_delimiters(text: &'a str, delimiters: &'static str) -> Self {
        Self {
            text,
            pos: 0,
            line: 1,
            delimiters,
            pushback: Vec::new(),
        }
    }

    /// Current line number (1-based).
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn has_more_tokens(&mut self) -> bool {
        if !self.pushback.is_empty() {
            return true;
        }
        self.skip_whitespace_and_comments();
        self.pos < self.text.len()
    }

    pub fn next_token(&mut self) -> Option<String> {
        if let Some(token) = self.pushback.pop() {
            return Some(token);
        }
        self.skip_whitespace_and_comments();

        let rest = &self.text[self.pos..];
        let first = rest.chars().next()?;

        if first == '"' {
            let body = &rest[1..];
            let end = body.find('"').unwrap_or(body.len());
            let token = body[..end].to_string();
            self.line += token.matches('\n').count();
            self.pos += 1 + end + usize::from(end < body.len());
            return Some(token);
        }

        if self.delimiters.contains(first) {
            self.pos += first.len_utf8();
            return Some(first.to_string());
        }

        let end = rest
            .char_indices()
            .find(|&(i, c)| {
                c.is_whitespace()
                    || c == '"'
                    || self.delimiters.contains(c)
                    || rest[i..].starts_with("//")
                    || rest[i..].starts_with("/*")
            })
            .map_or(rest.len(), |(i, _)| i);
        let token = rest[..end].to_string();
        self.pos += end;
        Some(token)
    }

    pub fn peek(&mut self) -> Option<String> {
        let token = self.next_token()?;
        self.pushback.push(token.clone());
        Some(token)
    }

    pub fn push_back(&mut self, token: String) {
        self.pushback.push(token);
    }

    pub fn require_token(&mut self) -> Result<String, ParseError> {
        self.next_token().ok_or(ParseError::EndOfInput)
    }

    pub fn assert_next(&mut self, expected: &str) -> Result<(), ParseError> {
        let found = self.require_token()?;
        if found == expected {
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                line: self.line,
                expected: expected.to_string(),
                found,
            })
        }
    }

    pub fn next_f64(&mut self) -> Result<f64, ParseError> {
        let token = self.require_token()?;
        token.parse().map_err(|_| self.syntax_error(format!("expected number, found '{token}'")))
    }

    pub fn next_i64(&mut self) -> Result<i64, ParseError> {
        let token = self.require_token()?;
        token.parse().map_err(|_| self.syntax_error(format!("expected integer, found '{token}'")))
    }

    /// Raw text up to the end of the current line, stopping before any brace.
    ///
    /// Pushed-back tokens are prepended. Comments are removed.
    pub fn rest_of_line(&mut self) -> String {
        let mut result: Vec<String> = self.pushback.drain(..).rev().collect();

        let rest = &self.text[self.pos..];
        let mut end = rest.len();
        let mut in_quotes = false;
        for (i, c) in rest.char_indices() {
            if c == '"' {
                in_quotes = !in_quotes;
            } else if !in_quotes && (c == '\n' || c == '{' || c == '}' || rest[i..].starts_with("//")) {
                end = i;
                break;
            }
        }

        let segment = rest[..end].trim();
        if !segment.is_empty() {
            result.push(segment.to_string());
        }
        self.pos += end;
        result.join(" ")
    }

    pub fn syntax_error(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            let rest = &self.text[self.pos..];
            let trimmed = rest.trim_start();
            let skipped = &rest[..rest.len() - trimmed.len()];
            self.line += skipped.matches('\n').count();
            self.pos += skipped.len();

            if trimmed.starts_with("//") {
                let end = trimmed.find('\n').unwrap_or(trimmed.len());
                self.pos += end;
            } else if let Some(body) = trimmed.strip_prefix("/*") {
                let end = body.find("*/").map_or(trimmed.len(), |e| e + 4);
                self.line += trimmed[..end].matches('\n').count();
                self.pos += end;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(text: &str) -> Vec<String> {
        let mut tok = DefTokeniser::new(text);
        let mut out = Vec::new();
        while let Some(t) = tok.next_token() {
            out.push(t);
        }
        out
    }

    #[test]
    fn test_tokens_delimiters_and_comments() {
        assert_eq!(
            tokens("table foo { snap { 0, 1 } } // trailing\n/* block\ncomment */ bar"),
            vec!["table", "foo", "{", "snap", "{", "0", ",", "1", "}", "}", "bar"]
        );
    }

    #[test]
    fn test_quoted_strings_keep_backslashes() {
        assert_eq!(tokens(r#""textures\n\x" "a b""#), vec![r"textures\n\x", "a b"]);
    }

    #[test]
    fn test_peek_and_rest_of_line() {
        let mut tok = DefTokeniser::new("rgb 0.5 * sinTable[time]\nmap foo\n{ blend add }");
        assert_eq!(tok.peek().as_deref(), Some("rgb"));
        assert_eq!(tok.next_token().as_deref(), Some("rgb"));
        assert_eq!(tok.rest_of_line(), "0.5 * sinTable[time]");
        assert_eq!(tok.next_token().as_deref(), Some("map"));
        assert_eq!(tok.rest_of_line(), "foo");
        assert_eq!(tok.next_token().as_deref(), Some("{"));
        assert_eq!(tok.next_token().as_deref(), Some("blend"));
        assert_eq!(tok.rest_of_line(), "add");
        assert_eq!(tok.next_token().as_deref(), Some("}"));
        assert!(!tok.has_more_tokens());
    }

    #[test]
    fn test_line_tracking_and_errors() {
        let mut tok = DefTokeniser::with_delimiters("Version 2\n{\n}", MAP_DELIMITERS);
        tok.assert_next("Version").unwrap();
        assert_eq!(tok.next_f64().unwrap(), 2.0);
        let err = tok.assert_next("}").unwrap_err();
        assert_eq!(
            err,
            ParseError::UnexpectedToken {
                line: 2,
                expected: "}".to_string(),
                found: "{".to_string()
            }
        );
    }
}
