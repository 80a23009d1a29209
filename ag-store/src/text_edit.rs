//! Translation of positional text edits into new file content.
//!
//! Lines and characters are zero-based; characters count Unicode scalar values within a
//! line, not bytes.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub character: usize,
}

impl Position {
    pub fn new(line: usize, character: usize) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Where an edit lands: replace a range, insert at a position, or replace a whole line
/// (its terminator is kept).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditTarget {
    Range(Range),
    Position(Position),
    Line(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    #[serde(flatten)]
    pub target: EditTarget,
    pub text: String,
}

impl TextEdit {
    pub fn replace(start: Position, end: Position, text: impl Into<String>) -> Self {
        Self {
            target: EditTarget::Range(Range { start, end }),
            text: text.into(),
        }
    }

    pub fn insert(at: Position, text: impl Into<String>) -> Self {
        Self {
            target: EditTarget::Position(at),
            text: text.into(),
        }
    }

    pub fn replace_line(line: usize, text: impl Into<String>) -> Self {
        Self {
            target: EditTarget::Line(line),
            text: text.into(),
        }
    }
}

struct LineIndex<'a> {
    content: &'a str,
    /// (start, end) byte offsets of each line, excluding the terminator.
    lines: Vec<(usize, usize)>,
}

impl<'a> LineIndex<'a> {
    fn new(content: &'a str) -> Self {
        let mut lines = Vec::new();
        let mut start = 0usize;
        for (idx, byte) in content.bytes().enumerate() {
            if byte == b'\n' {
                let end = if idx > start && content.as_bytes()[idx - 1] == b'\r' {
                    idx - 1
                } else {
                    idx
                };
                lines.push((start, end));
                start = idx + 1;
            }
        }
        lines.push((start, content.len()));
        Self { content, lines }
    }

    fn line_bounds(&self, line: usize) -> Result<(usize, usize)> {
        self.lines.get(line).copied().ok_or_else(|| {
            StoreError::Validation(format!(
                "line {line} is out of range ({} lines)",
                self.lines.len()
            ))
        })
    }

    fn offset(&self, pos: Position) -> Result<usize> {
        let (start, end) = self.line_bounds(pos.line)?;
        let text = &self.content[start..end];
        if pos.character == 0 {
            return Ok(start);
        }
        let mut chars = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len()));
        chars.nth(pos.character).map(|i| start + i).ok_or_else(|| {
            StoreError::Validation(format!(
                "character {} is out of range on line {}",
                pos.character, pos.line
            ))
        })
    }
}

/// Applies `edits` to `content`. Edits address the original content, must not overlap,
/// and inserts at the same position keep their relative order.
pub fn apply_edits(content: &str, edits: &[TextEdit]) -> Result<String> {
    let index = LineIndex::new(content);
    let mut spans = Vec::with_capacity(edits.len());
    for edit in edits {
        let (start, end) = match edit.target {
            EditTarget::Range(range) => (index.offset(range.start)?, index.offset(range.end)?),
            EditTarget::Position(pos) => {
                let at = index.offset(pos)?;
                (at, at)
            }
            EditTarget::Line(line) => index.line_bounds(line)?,
        };
        if start > end {
            return Err(StoreError::Validation(
                "edit range ends before it starts".to_string(),
            ));
        }
        spans.push((start, end, edit.text.as_str()));
    }

    spans.sort_by_key(|(start, end, _)| (*start, *end));
    for pair in spans.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(StoreError::Validation("edits overlap".to_string()));
        }
    }

    let mut out = content.to_string();
    for (start, end, text) in spans.into_iter().rev() {
        out.replace_range(start..end, text);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_replacement_uses_line_and_character() {
        let out = apply_edits(
            "fn main() {\n    old();\n}\n",
            &[TextEdit::replace(
                Position::new(1, 4),
                Position::new(1, 7),
                "new",
            )],
        )
        .unwrap();
        assert_eq!(out, "fn main() {\n    new();\n}\n");
    }

    #[test]
    fn line_replacement_keeps_crlf_terminator() {
        let out = apply_edits("a\r\nb\r\nc", &[TextEdit::replace_line(1, "B")]).unwrap();
        assert_eq!(out, "a\r\nB\r\nc");
    }

    #[test]
    fn multiple_edits_address_original_content() {
        let out = apply_edits(
            "one\ntwo\nthree",
            &[
                TextEdit::replace_line(2, "THREE"),
                TextEdit::insert(Position::new(0, 0), "// "),
                TextEdit::replace_line(1, "2"),
            ],
        )
        .unwrap();
        assert_eq!(out, "// one\n2\nTHREE");
    }

    #[test]
    fn inserts_at_same_position_keep_order() {
        let out = apply_edits(
            "x",
            &[
                TextEdit::insert(Position::new(0, 1), "a"),
                TextEdit::insert(Position::new(0, 1), "b"),
            ],
        )
        .unwrap();
        assert_eq!(out, "xab");
    }

    #[test]
    fn characters_are_counted_as_scalar_values() {
        let out = apply_edits("héllo", &[TextEdit::insert(Position::new(0, 2), "-")]).unwrap();
        assert_eq!(out, "hé-llo");
    }

    #[test]
    fn out_of_range_and_overlapping_edits_are_rejected() {
        let err = apply_edits("a\nb", &[TextEdit::replace_line(5, "x")]).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = apply_edits("abc", &[TextEdit::insert(Position::new(0, 9), "x")]).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = apply_edits(
            "abcdef",
            &[
                TextEdit::replace(Position::new(0, 0), Position::new(0, 3), "x"),
                TextEdit::replace(Position::new(0, 2), Position::new(0, 5), "y"),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn edits_deserialize_from_tagged_json() {
        let edits: Vec<TextEdit> = serde_json::from_value(serde_json::json!([
            { "line": 0, "text": "x" },
            { "position": { "line": 0, "character": 1 }, "text": "y" },
            {
                "range": {
                    "start": { "line": 0, "character": 0 },
                    "end": { "line": 0, "character": 1 }
                },
                "text": "z"
            }
        ]))
        .unwrap();
        assert_eq!(edits[0].target, EditTarget::Line(0));
        assert_eq!(edits[1].target, EditTarget::Position(Position::new(0, 1)));
        assert!(matches!(edits[2].target, EditTarget::Range(_)));
    }
}
