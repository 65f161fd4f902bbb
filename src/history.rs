//! Interaction history, the saved-history file format and replayable scripts.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub const HISTORY_HEADER: &str = "// workbench-repl saved history v2";
const SENTINEL_PREFIX: &str = "//";
/// Multi-line entries, and entries that would not survive a plain line, are written between
/// these markers with every line prefixed by [`BLOCK_LINE_PREFIX`].
const BLOCK_START: &str = "//{";
const BLOCK_END: &str = "//}";
const BLOCK_LINE_PREFIX: char = '|';

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("malformed history at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file selection canceled")]
    Canceled,
}

/// Raised by a selector when the user backs out of choosing a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation canceled")]
pub struct OperationCanceled;

impl From<OperationCanceled> for HistoryError {
    fn from(_: OperationCanceled) -> Self {
        HistoryError::Canceled
    }
}

pub trait FileOpenSelector {
    fn file(&self) -> Result<PathBuf, OperationCanceled>;
}

pub trait FileSaveSelector {
    fn file(&self) -> Result<PathBuf, OperationCanceled>;
}

impl FileOpenSelector for PathBuf {
    fn file(&self) -> Result<PathBuf, OperationCanceled> {
        Ok(self.clone())
    }
}

impl FileSaveSelector for PathBuf {
    fn file(&self) -> Result<PathBuf, OperationCanceled> {
        Ok(self.clone())
    }
}

impl FileOpenSelector for &Path {
    fn file(&self) -> Result<PathBuf, OperationCanceled> {
        Ok(self.to_path_buf())
    }
}

impl FileSaveSelector for &Path {
    fn file(&self) -> Result<PathBuf, OperationCanceled> {
        Ok(self.to_path_buf())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    text: String,
    edited: bool,
}

impl HistoryEntry {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True when the entry came from a replayed or edited script rather than typed input.
    pub fn edited(&self) -> bool {
        self.edited
    }
}

/// Append-only record of executed interactions. Entries are never modified after append.
#[derive(Debug, Clone, Default)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, text: impl Into<String>, edited: bool) {
        self.entries.push(HistoryEntry {
            text: text.into(),
            edited,
        });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn as_string(&self) -> String {
        join_lines(self.entries.iter().map(|entry| entry.text.as_str()))
    }

    pub fn as_string_with_semicolons(&self) -> String {
        let lines: Vec<String> = self
            .entries
            .iter()
            .map(|entry| with_semicolon(&entry.text))
            .collect();
        join_lines(lines.iter().map(String::as_str))
    }

    /// Renders the saved-history file. `edited_version` replaces the recorded entries but still
    /// gets the header that marks the file as saved history.
    pub fn save_text(&self, edited_version: Option<&str>) -> String {
        let body = match edited_version {
            Some(edited) => {
                let lines: Vec<&str> = edited
                    .lines()
                    .map(str::trim_end)
                    .filter(|line| !line.is_empty())
                    .collect();
                join_lines(lines.into_iter())
            }
            None => {
                let mut body = String::new();
                for entry in &self.entries {
                    encode_entry(&entry.text, &mut body);
                }
                body
            }
        };
        format!("{HISTORY_HEADER}\n{body}")
    }

    pub fn save(
        &self,
        selector: &dyn FileSaveSelector,
        edited_version: Option<&str>,
    ) -> Result<PathBuf, HistoryError> {
        let path = selector.file()?;
        std::fs::write(&path, self.save_text(edited_version))?;
        Ok(path)
    }
}

fn join_lines<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn encode_entry(text: &str, out: &mut String) {
    let plain = !text.contains('\n')
        && !text.trim_start().starts_with(SENTINEL_PREFIX)
        && text.trim() == text;
    if plain {
        out.push_str(text);
        out.push('\n');
        return;
    }
    out.push_str(BLOCK_START);
    out.push('\n');
    for line in text.split('\n') {
        out.push(BLOCK_LINE_PREFIX);
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(BLOCK_END);
    out.push('\n');
}

fn with_semicolon(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.ends_with(';') || trimmed.ends_with('}') {
        trimmed.to_string()
    } else {
        format!("{trimmed};")
    }
}

/// A parsed history file ready to replay, with a cursor for stepping through it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractionsScript {
    interactions: Vec<String>,
    sentinels: Vec<String>,
    cursor: usize,
}

impl InteractionsScript {
    pub fn new(interactions: Vec<String>) -> Self {
        Self {
            interactions,
            sentinels: Vec::new(),
            cursor: 0,
        }
    }

    pub fn interactions(&self) -> &[String] {
        &self.interactions
    }

    /// Comment lines (`//`) found in the source, in order. Never replayed.
    pub fn sentinels(&self) -> &[String] {
        &self.sentinels
    }

    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    pub fn current(&self) -> Option<&str> {
        self.interactions.get(self.cursor).map(String::as_str)
    }

    pub fn has_next(&self) -> bool {
        self.cursor + 1 < self.interactions.len()
    }

    pub fn has_prev(&self) -> bool {
        self.cursor > 0 && !self.interactions.is_empty()
    }

    pub fn next(&mut self) -> Option<&str> {
        if !self.has_next() {
            return None;
        }
        self.cursor += 1;
        self.current()
    }

    pub fn prev(&mut self) -> Option<&str> {
        if !self.has_prev() {
            return None;
        }
        self.cursor -= 1;
        self.current()
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    pub fn into_interactions(self) -> Vec<String> {
        self.interactions
    }
}

pub fn parse_script_bytes(bytes: &[u8]) -> Result<InteractionsScript, HistoryError> {
    let source = std::str::from_utf8(bytes).map_err(|err| {
        let line = bytes[..err.valid_up_to()]
            .iter()
            .filter(|byte| **byte == b'\n')
            .count()
            + 1;
        HistoryError::Malformed {
            line,
            reason: "invalid UTF-8".to_string(),
        }
    })?;
    parse_script(source)
}

pub fn parse_script(source: &str) -> Result<InteractionsScript, HistoryError> {
    let mut script = InteractionsScript::default();
    // Start line and lines collected so far for an open `//{` block.
    let mut block: Option<(usize, Vec<&str>)> = None;
    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        if let Some(ch) = raw.chars().find(|ch| ch.is_control() && *ch != '\t') {
            return Err(HistoryError::Malformed {
                line: line_no,
                reason: format!("unexpected control character U+{:04X}", ch as u32),
            });
        }
        if let Some((_, lines)) = block.as_mut() {
            if raw.trim_end() == BLOCK_END {
                if let Some((_, lines)) = block.take() {
                    script.interactions.push(lines.join("\n"));
                }
            } else if let Some(content) = raw.strip_prefix(BLOCK_LINE_PREFIX) {
                lines.push(content);
            } else {
                return Err(HistoryError::Malformed {
                    line: line_no,
                    reason: format!("interaction line must start with `{BLOCK_LINE_PREFIX}`"),
                });
            }
            continue;
        }
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        match line.trim_start() {
            BLOCK_START => block = Some((line_no, Vec::new())),
            BLOCK_END => {
                return Err(HistoryError::Malformed {
                    line: line_no,
                    reason: format!("`{BLOCK_END}` without a matching `{BLOCK_START}`"),
                });
            }
            trimmed if trimmed.starts_with(SENTINEL_PREFIX) => {
                script.sentinels.push(line.to_string());
            }
            _ => script.interactions.push(line.to_string()),
        }
    }
    if let Some((start, _)) = block {
        return Err(HistoryError::Malformed {
            line: start,
            reason: format!("interaction opened here is never closed with `{BLOCK_END}`"),
        });
    }
    Ok(script)
}

pub fn load_script(selector: &dyn FileOpenSelector) -> Result<InteractionsScript, HistoryError> {
    let path = selector.file()?;
    let bytes = std::fs::read(&path)?;
    parse_script_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(lines: &[&str]) -> History {
        let mut history = History::new();
        for line in lines {
            history.append(*line, false);
        }
        history
    }

    #[test]
    fn semicolons_added_only_where_missing() {
        let history = history(&["let x = 1", "x;", "fn f() { 2 }", "f()"]);
        assert_eq!(
            history.as_string_with_semicolons(),
            "let x = 1;\nx;\nfn f() { 2 }\nf();\n"
        );
        assert_eq!(history.as_string(), "let x = 1\nx;\nfn f() { 2 }\nf()\n");
    }

    #[test]
    fn saved_history_parses_back_to_same_texts() {
        let history = history(&["1+1", "let y = \"a\tb\";", "print(y)"]);
        let saved = history.save_text(None);
        assert!(saved.starts_with(HISTORY_HEADER));
        let script = parse_script(&saved).expect("parse");
        let texts: Vec<&str> = history.entries().iter().map(HistoryEntry::text).collect();
        assert_eq!(script.interactions(), texts.as_slice());
        assert_eq!(script.sentinels(), [HISTORY_HEADER.to_string()]);
    }

    #[test]
    fn multi_line_and_comment_like_entries_round_trip() {
        let history = history(&[
            "fn f() {\n  1\n}",
            "f()",
            "// note to self",
            "  indented",
            "line ending in pipe |\n|",
            "1+1",
        ]);
        let saved = history.save_text(None);
        assert!(saved.contains("//{\n|fn f() {\n|  1\n|}\n//}\n"));
        let script = parse_script(&saved).expect("parse");
        let texts: Vec<&str> = history.entries().iter().map(HistoryEntry::text).collect();
        assert_eq!(script.interactions(), texts.as_slice());
        assert_eq!(script.sentinels(), [HISTORY_HEADER.to_string()]);
    }

    #[test]
    fn unterminated_block_is_malformed() {
        let err = parse_script("1\n//{\n|a\n|b\n").expect_err("malformed");
        match err {
            HistoryError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse_script("//{\nmissing prefix\n//}\n").is_err());
        assert!(parse_script("//}\n").is_err());
    }

    #[test]
    fn edited_version_replaces_entries_but_keeps_header() {
        let history = history(&["1+1"]);
        let saved = history.save_text(Some("let a = 3;  \n\na * 2\n"));
        assert_eq!(saved, format!("{HISTORY_HEADER}\nlet a = 3;\na * 2\n"));
    }

    #[test]
    fn parse_skips_blank_lines_and_trims_trailing_whitespace() {
        let script = parse_script("// note\n\n1+1   \n   \n2+2\n").expect("parse");
        assert_eq!(script.interactions(), ["1+1", "2+2"]);
        assert_eq!(script.sentinels(), ["// note"]);
    }

    #[test]
    fn control_characters_are_malformed() {
        let err = parse_script("1+1\nbad\u{7}line\n").expect_err("malformed");
        match err {
            HistoryError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_utf8_reports_line() {
        let err = parse_script_bytes(b"1+1\n2+2\n\xff\xfe\n").expect_err("malformed");
        match err {
            HistoryError::Malformed { line, reason } => {
                assert_eq!(line, 3);
                assert!(reason.contains("UTF-8"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn script_cursor_steps_both_ways() {
        let mut script = InteractionsScript::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(script.current(), Some("a"));
        assert!(!script.has_prev());
        assert_eq!(script.next(), Some("b"));
        assert_eq!(script.next(), Some("c"));
        assert!(!script.has_next());
        assert_eq!(script.next(), None);
        assert_eq!(script.prev(), Some("b"));
        script.reset_cursor();
        assert_eq!(script.current(), Some("a"));
    }

    #[test]
    fn save_and_load_through_selectors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.hist");
        let history = history(&["let x = 2", "x * 21"]);
        history.save(&path, None).expect("save");
        let script = load_script(&path).expect("load");
        assert_eq!(script.interactions(), ["let x = 2", "x * 21"]);
    }

    struct CanceledSelector;

    impl FileOpenSelector for CanceledSelector {
        fn file(&self) -> Result<PathBuf, OperationCanceled> {
            Err(OperationCanceled)
        }
    }

    #[test]
    fn canceled_selector_maps_to_canceled() {
        assert!(matches!(
            load_script(&CanceledSelector),
            Err(HistoryError::Canceled)
        ));
    }

    #[test]
    fn clear_empties_history() {
        let mut history = history(&["1"]);
        history.append("2", true);
        assert!(history.entries()[1].edited());
        history.clear();
        assert!(history.is_empty());
    }
}
