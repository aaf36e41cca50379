//! Tool-call parser: model text → ordered list of [`ToolCall`]s.
//!
//! The model is instructed to answer in labeled blocks:
//!
//! ```text
//! THINKING: I should look at the project root first.
//! ACTION: list_directory
//! PARAMETERS: {"path": "."}
//! MESSAGE: Let me check what's here.
//! ```
//!
//! Labels are recognized at the start of a line (after leading whitespace).
//! A labeled span runs until the next label line or the end of the text, so
//! `PARAMETERS` and `MESSAGE` may cover several lines. A new block begins at
//! every `THINKING:` line, and at every `ACTION:` line once the current block
//! already has an action.
//!
//! Parsing never fails. A block whose action or parameters cannot be
//! recovered is dropped with a warning and scanning continues; a reply with
//! no recognized block is a final answer.

use ferrule_core::tool::ToolCall;
use serde_json::{Map, Value};
use tracing::warn;

/// Why a block was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("block has an ACTION but no PARAMETERS")]
    MissingParameters,

    #[error("'{0}' is not a valid action identifier")]
    InvalidAction(String),

    #[error("parameters are not valid JSON: {0}")]
    InvalidParameters(String),

    #[error("parameters must be a JSON object")]
    NotAnObject,
}

/// A block that looked like a tool call but could not be used.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedBlock {
    /// The block text as it appeared in the reply
    pub raw: String,
    pub reason: ParseError,
}

/// Result of [`parse_detailed`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub calls: Vec<ToolCall>,
    pub rejected: Vec<RejectedBlock>,
}

/// Extract tool calls from a model reply, in order.
pub fn parse(text: &str) -> Vec<ToolCall> {
    parse_detailed(text).calls
}

/// Like [`parse`], but also reports the blocks that were dropped and why.
pub fn parse_detailed(text: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();

    for block in scan_blocks(text) {
        // Blocks without an action are commentary, not rejected calls
        if block.action.is_none() {
            continue;
        }

        match block.to_call() {
            Ok(call) => outcome.calls.push(call),
            Err(reason) => {
                let raw = block.raw.join("\n");
                warn!(reason = %reason, block = %raw, "Dropping malformed tool-call block");
                outcome.rejected.push(RejectedBlock { raw, reason });
            }
        }
    }

    outcome
}

/// Parse a `PARAMETERS` span into a JSON object.
///
/// Strips an enclosing code fence, treats empty text as `{}`, tries strict
/// JSON and then one normalized retry (see [`normalize_quotes`]).
pub fn parse_parameters(raw: &str) -> Result<Map<String, Value>, ParseError> {
    let body = strip_code_fence(raw.trim());
    if body.is_empty() {
        return Ok(Map::new());
    }

    let value = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(strict_err) => serde_json::from_str::<Value>(&normalize_quotes(body))
            .map_err(|_| ParseError::InvalidParameters(strict_err.to_string()))?,
    };

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::NotAnObject),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Thinking,
    Action,
    Parameters,
    Message,
}

const LABELS: [(&str, Label); 4] = [
    ("THINKING:", Label::Thinking),
    ("ACTION:", Label::Action),
    ("PARAMETERS:", Label::Parameters),
    ("MESSAGE:", Label::Message),
];

fn label_of(line: &str) -> Option<(Label, &str)> {
    let trimmed = line.trim_start();
    LABELS
        .iter()
        .find_map(|(prefix, label)| trimmed.strip_prefix(prefix).map(|rest| (*label, rest)))
}

#[derive(Debug, Default)]
struct RawBlock {
    thinking: Option<String>,
    action: Option<String>,
    parameters: Option<String>,
    message: Option<String>,
    raw: Vec<String>,
}

impl RawBlock {
    fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn slot(&mut self, label: Label) -> &mut Option<String> {
        match label {
            Label::Thinking => &mut self.thinking,
            Label::Action => &mut self.action,
            Label::Parameters => &mut self.parameters,
            Label::Message => &mut self.message,
        }
    }

    fn open(&mut self, label: Label, rest: &str, line: &str) {
        *self.slot(label) = Some(rest.to_string());
        self.raw.push(line.to_string());
    }

    fn continue_span(&mut self, label: Label, line: &str) {
        if let Some(span) = self.slot(label) {
            span.push('\n');
            span.push_str(line);
        }
        self.raw.push(line.to_string());
    }

    fn to_call(&self) -> Result<ToolCall, ParseError> {
        let action = self
            .action
            .as_deref()
            .map(clean_action)
            .unwrap_or_default();
        if !is_identifier(&action) {
            return Err(ParseError::InvalidAction(action));
        }

        let raw_parameters = self
            .parameters
            .as_deref()
            .ok_or(ParseError::MissingParameters)?
            .trim()
            .to_string();
        let parameters = parse_parameters(&raw_parameters)?;

        Ok(ToolCall {
            thinking: non_empty(self.thinking.as_deref()),
            action,
            parameters,
            message: non_empty(self.message.as_deref()),
            raw_parameters,
        })
    }
}

fn scan_blocks(text: &str) -> Vec<RawBlock> {
    let mut blocks = Vec::new();
    let mut current = RawBlock::default();
    let mut open_label: Option<Label> = None;

    for line in text.lines() {
        if let Some((label, rest)) = label_of(line) {
            let starts_block = match label {
                Label::Thinking => !current.is_empty(),
                Label::Action => current.action.is_some(),
                _ => false,
            };
            if starts_block {
                blocks.push(std::mem::take(&mut current));
            }
            current.open(label, rest, line);
            open_label = Some(label);
        } else if let Some(label) = open_label {
            current.continue_span(label, line);
        }
        // Text before the first label is prose and ignored
    }

    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn clean_action(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '*'))
        .trim()
        .to_string()
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };

    let inner = match inner.find("```") {
        Some(end) => &inner[..end],
        None => inner,
    };

    // Optional language tag directly after the opening fence
    let tag_len = inner
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(inner.len());
    let after_tag = &inner[tag_len..];
    if tag_len > 0 && after_tag.starts_with(char::is_whitespace) {
        return after_tag.trim();
    }
    inner.trim()
}

/// Rewrite the common almost-JSON that models produce into JSON.
///
/// Outside double-quoted strings, a run of one to three backticks or a single
/// quote opens a value that closes at the next identical delimiter; it is
/// re-emitted as an escaped JSON string. Inside double-quoted strings, raw
/// newline, carriage return and tab characters are escaped. Everything else is
/// copied through untouched.
pub fn normalize_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            match c {
                '\\' if !escaped => {
                    escaped = true;
                    out.push(c);
                    i += 1;
                    continue;
                }
                '"' if !escaped => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
            escaped = false;
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '`' | '\'' => {
                let run = if c == '`' {
                    chars[i..].iter().take_while(|&&ch| ch == '`').count()
                } else {
                    1
                };
                if run > 3 {
                    out.extend(&chars[i..i + run]);
                    i += run;
                    continue;
                }

                let start = i + run;
                match find_delimiter(&chars, start, c, run) {
                    Some(end) => {
                        let value: String = chars[start..end].iter().collect();
                        out.push_str(&Value::String(value).to_string());
                        i = end + run;
                    }
                    None => {
                        out.extend(&chars[i..start]);
                        i = start;
                    }
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Index of the next run of exactly `run` copies of `delim` at or after `from`.
fn find_delimiter(chars: &[char], from: usize, delim: char, run: usize) -> Option<usize> {
    let mut i = from;
    while i + run <= chars.len() {
        if chars[i..i + run].iter().all(|&ch| ch == delim) {
            return Some(i);
        }
        i += 1;
    }
    None
}
