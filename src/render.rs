//! Plain-text rendering of messages and sessions into width-bounded lines.
//!
//! Output is unstyled text tagged with a [`LineStyle`]; the terminal layer
//! decides how each style looks under the active theme.

use time::macros::format_description;
use time::OffsetDateTime;
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthChar;

use opencode_api::{MessageWithParts, Part, PartKind, Role, Session, ToolStatus};

use crate::store::MessageStatus;

const TAB_WIDTH: usize = 3;
const ELLIPSIS: &str = "…";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Header,
    Body,
    Muted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledLine {
    pub style: LineStyle,
    pub text: String,
}

impl StyledLine {
    fn new(style: LineStyle, text: impl Into<String>) -> Self {
        Self {
            style,
            text: text.into(),
        }
    }
}

pub fn grapheme_width(grapheme: &str) -> usize {
    grapheme
        .chars()
        .map(|ch| {
            if ch == '\t' {
                TAB_WIDTH
            } else {
                UnicodeWidthChar::width(ch).unwrap_or(0)
            }
        })
        .sum()
}

pub fn visible_width(text: &str) -> usize {
    text.graphemes(true).map(grapheme_width).sum()
}

/// Cut `text` to `max_width` columns, ending in an ellipsis when shortened.
pub fn truncate_to_width(text: &str, max_width: usize) -> String {
    if visible_width(text) <= max_width {
        return text.to_string();
    }
    if max_width == 0 {
        return String::new();
    }

    let target = max_width - visible_width(ELLIPSIS).min(max_width);
    let mut out = String::new();
    let mut used = 0;
    for grapheme in text.graphemes(true) {
        let width = grapheme_width(grapheme);
        if used + width > target {
            break;
        }
        out.push_str(grapheme);
        used += width;
    }
    out.push_str(ELLIPSIS);
    out
}

/// Word-wrap `text` to `width` columns. Hard newlines are kept; words longer
/// than a line are broken at grapheme boundaries.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![String::new()];
    }

    let mut lines = Vec::new();
    for input_line in text.split('\n') {
        wrap_line(input_line.trim_end_matches('\r'), width, &mut lines);
    }
    lines
}

fn wrap_line(line: &str, width: usize, out: &mut Vec<String>) {
    if visible_width(line) <= width {
        out.push(line.trim_end().to_string());
        return;
    }

    let mut current = String::new();
    let mut current_width = 0;
    for token in split_words(line) {
        let token_width = visible_width(token);
        let is_space = token.starts_with(' ');

        if token_width > width && !is_space {
            if current_width > 0 {
                out.push(current.trim_end().to_string());
                current.clear();
                current_width = 0;
            }
            for grapheme in token.graphemes(true) {
                let g_width = grapheme_width(grapheme);
                if current_width + g_width > width && current_width > 0 {
                    out.push(std::mem::take(&mut current));
                    current_width = 0;
                }
                current.push_str(grapheme);
                current_width += g_width;
            }
            continue;
        }

        if current_width + token_width > width && current_width > 0 {
            out.push(current.trim_end().to_string());
            current.clear();
            current_width = 0;
            if is_space {
                continue;
            }
        }
        current.push_str(token);
        current_width += token_width;
    }

    if !current.is_empty() {
        out.push(current.trim_end().to_string());
    }
}

fn split_words(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space = None;
    for (idx, ch) in line.char_indices() {
        let is_space = ch == ' ';
        if in_space.is_some_and(|previous| previous != is_space) {
            tokens.push(&line[start..idx]);
            start = idx;
        }
        in_space = Some(is_space);
    }
    if start < line.len() {
        tokens.push(&line[start..]);
    }
    tokens
}

/// `YYYY-MM-DD HH:MM` in UTC for an epoch-millisecond timestamp.
pub fn format_timestamp(epoch_ms: i64) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]");
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(epoch_ms) * 1_000_000)
        .ok()
        .and_then(|moment| moment.format(&format).ok())
        .unwrap_or_else(|| "-".to_string())
}

pub fn session_line(session: &Session, selected: bool, width: usize) -> String {
    let marker = if selected { "▸" } else { " " };
    let title = if session.title.trim().is_empty() {
        session.id.as_str()
    } else {
        session.title.as_str()
    };
    let stamp = format_timestamp(session.time.updated);
    let line = format!("{marker} {title}  {stamp}");
    truncate_to_width(&line, width)
}

fn status_label(message: &MessageWithParts) -> &'static str {
    match MessageStatus::of(&message.info) {
        MessageStatus::Streaming => "streaming",
        MessageStatus::Completed => "done",
        MessageStatus::Failed => "failed",
    }
}

fn tool_status_label(status: ToolStatus) -> &'static str {
    match status {
        ToolStatus::Pending => "pending",
        ToolStatus::Running => "running",
        ToolStatus::Completed => "completed",
        ToolStatus::Error => "error",
        ToolStatus::Unknown => "unknown",
    }
}

fn push_wrapped(lines: &mut Vec<StyledLine>, style: LineStyle, prefix: &str, text: &str, width: usize) {
    let prefix_width = visible_width(prefix);
    let body_width = width.saturating_sub(prefix_width).max(1);
    for line in wrap_text(text, body_width) {
        lines.push(StyledLine::new(style, format!("{prefix}{line}")));
    }
}

fn render_part(part: &Part, width: usize, lines: &mut Vec<StyledLine>) {
    match &part.kind {
        PartKind::Text { text, synthetic } => {
            if !synthetic && !text.is_empty() {
                push_wrapped(lines, LineStyle::Body, "", text, width);
            }
        }
        PartKind::Reasoning { text } => {
            if !text.is_empty() {
                push_wrapped(lines, LineStyle::Muted, "│ ", text, width);
            }
        }
        PartKind::Tool { tool, state, .. } => {
            let mut summary = format!("⚙ {tool} [{}]", tool_status_label(state.status));
            if let Some(title) = state.title.as_deref().filter(|title| !title.is_empty()) {
                summary.push(' ');
                summary.push_str(title);
            }
            let style = if state.status == ToolStatus::Error {
                LineStyle::Error
            } else {
                LineStyle::Muted
            };
            lines.push(StyledLine::new(style, truncate_to_width(&summary, width)));
            if let Some(error) = state.error.as_deref() {
                push_wrapped(lines, LineStyle::Error, "  ", error, width);
            }
        }
        PartKind::File { filename, url, mime } => {
            let name = filename.as_deref().unwrap_or(url.as_str());
            let label = format!("📎 {name} ({mime})");
            lines.push(StyledLine::new(LineStyle::Muted, truncate_to_width(&label, width)));
        }
        PartKind::Patch { files, .. } => {
            let label = format!("± patch touching {} file(s)", files.len());
            lines.push(StyledLine::new(LineStyle::Muted, truncate_to_width(&label, width)));
        }
        PartKind::Agent { name } => {
            let label = format!("@{name}");
            lines.push(StyledLine::new(LineStyle::Muted, truncate_to_width(&label, width)));
        }
        PartKind::StepStart
        | PartKind::StepFinish { .. }
        | PartKind::Snapshot { .. }
        | PartKind::Other => {}
    }
}

/// Lines for one message: a header, its parts, and a blank separator.
pub fn render_message(message: &MessageWithParts, width: usize) -> Vec<StyledLine> {
    let width = width.max(1);
    let mut lines = Vec::new();

    let role = match message.info.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    let header = format!("{role} · {}", status_label(message));
    lines.push(StyledLine::new(LineStyle::Header, truncate_to_width(&header, width)));

    for part in &message.parts {
        render_part(part, width, &mut lines);
    }

    if let Some(error) = &message.info.error {
        let detail = error
            .get("data")
            .and_then(|data| data.get("message"))
            .or_else(|| error.get("message"))
            .and_then(|value| value.as_str())
            .or_else(|| error.get("name").and_then(|value| value.as_str()))
            .unwrap_or("message failed");
        push_wrapped(&mut lines, LineStyle::Error, "! ", detail, width);
    }

    lines.push(StyledLine::new(LineStyle::Body, ""));
    lines
}
