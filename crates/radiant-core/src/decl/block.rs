//! Splits a declaration file into `[keyword] name { ... }` blocks.

use super::DeclarationBlockSyntax;
use crate::vfs::FileInfo;

/// Iterator over the top-level blocks of a declaration file.
pub struct DeclarationBlockReader<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> DeclarationBlockReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn skip_whitespace_and_comments(&mut self) {
        self.pos = skip_trivia(self.text, self.pos);
    }

    fn read_word(&mut self) -> String {
        let rest = &self.text[self.pos..];
        if let Some(body) = rest.strip_prefix('"') {
            let end = body.find('"').unwrap_or(body.len());
            self.pos += 1 + end + usize::from(end < body.len());
            return body[..end].to_string();
        }
        let end = rest
            .char_indices()
            .find(|&(i, c)| {
                c.is_whitespace() || c == '{' || c == '}' || c == '"' || rest[i..].starts_with("//") || rest[i..].starts_with("/*")
            })
            .map_or(rest.len(), |(i, _)| i);
        self.pos += end;
        rest[..end].to_string()
    }
}

impl Iterator for DeclarationBlockReader<'_> {
    type Item = DeclarationBlockSyntax;

    fn next(&mut self) -> Option<DeclarationBlockSyntax> {
        let mut header: Vec<String> = Vec::new();
        let mut start = None;

        loop {
            self.skip_whitespace_and_comments();
            let c = self.text[self.pos..].chars().next()?;

            match c {
                '{' => {
                    let open = self.pos;
                    let close = find_matching_brace(self.text, open);
                    let content_end = close.unwrap_or(self.text.len());
                    let contents = &self.text[open + 1..content_end];
                    self.pos = close.map_or(self.text.len(), |c| c + 1);

                    if close.is_none() {
                        tracing::warn!("[declmgr] Missing closing brace for block {:?}", header.last());
                    }

                    let (type_name, name) = match header.len() {
                        0 => {
                            tracing::warn!("[declmgr] Skipping block without a name");
                            start = None;
                            continue;
                        }
                        1 => (String::new(), header.remove(0)),
                        n => {
                            if n > 2 {
                                tracing::warn!("[declmgr] Ignoring stray tokens before {}", header[n - 1]);
                            }
                            (header[n - 2].clone(), header[n - 1].clone())
                        }
                    };

                    return Some(DeclarationBlockSyntax {
                        type_name,
                        name,
                        contents: contents.to_string(),
                        file_info: None,
                        span: Some(start.unwrap_or(open)..self.pos),
                    });
                }
                '}' => {
                    tracing::warn!("[declmgr] Stray closing brace at offset {}", self.pos);
                    self.pos += 1;
                    header.clear();
                    start = None;
                }
                _ => {
                    if start.is_none() {
                        start = Some(self.pos);
                    }
                    header.push(self.read_word());
                }
            }
        }
    }
}

/// Reads every block of `text`, stamping each with the file it came from.
pub fn parse_blocks(text: &str, file_info: Option<&FileInfo>) -> Vec<DeclarationBlockSyntax> {
    DeclarationBlockReader::new(text)
        .map(|mut block| {
            block.file_info = file_info.cloned();
            block
        })
        .collect()
}

fn skip_trivia(text: &str, mut pos: usize) -> usize {
    loop {
        let rest = &text[pos..];
        let trimmed = rest.trim_start();
        pos += rest.len() - trimmed.len();

        if trimmed.starts_with("//") {
            pos += trimmed.find('\n').unwrap_or(trimmed.len());
        } else if let Some(body) = trimmed.strip_prefix("/*") {
            pos += body.find("*/").map_or(trimmed.len(), |e| e + 4);
        } else {
            return pos;
        }
    }
}

/// Byte index of the brace closing the one at `open`, skipping comments and strings.
fn find_matching_brace(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;

    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_typed_and_untyped_blocks() {
        let text = "// header\ntable sinTable { { 0, 1 } }\n\ntextures/base/floor\n{\n\tdiffusemap x // }\n}\nmaterial \"textures/q\" { }";
        let blocks: Vec<_> = DeclarationBlockReader::new(text).collect();

        assert_eq!(blocks.len(), 3);
        assert_eq!((blocks[0].type_name.as_str(), blocks[0].name.as_str()), ("table", "sinTable"));
        assert_eq!(blocks[0].contents, " { 0, 1 } ");
        assert_eq!((blocks[1].type_name.as_str(), blocks[1].name.as_str()), ("", "textures/base/floor"));
        assert_eq!(blocks[1].contents, "\n\tdiffusemap x // }\n");
        assert_eq!((blocks[2].type_name.as_str(), blocks[2].name.as_str()), ("material", "textures/q"));

        let span = blocks[0].span.clone().unwrap();
        assert_eq!(&text[span], "table sinTable { { 0, 1 } }");
    }

    #[test]
    fn test_unterminated_block_takes_rest() {
        let blocks: Vec<_> = DeclarationBlockReader::new("particle smoke { depthHack 0.1").collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].contents, " depthHack 0.1");
    }
}
