//! Terminal front end helpers: window size, theme colors and frame assembly.
//!
//! [`ChatView`] is the bridge between the store and the virtual list. It
//! feeds row keys to the list, renders a message only once the list lays its
//! row out, and reports line counts back as measurements after the frame is
//! written.

use std::collections::{HashMap, HashSet};

use opencode_api::{MessageWithParts, Session};

use crate::config::Theme;
use crate::render::{render_message, session_line, truncate_to_width, LineStyle, StyledLine};
use crate::store::Store;
use crate::viewport::{PaintOutcome, VirtualList, VirtualListOptions};

pub const DEFAULT_COLUMNS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
const RESET: &str = "\x1b[0m";

/// Row geometry used by the terminal: sizes are lines.
pub const TERMINAL_LIST_OPTIONS: VirtualListOptions = VirtualListOptions {
    estimate_size: 4,
    overscan: 5,
    follow_threshold: 1,
};

#[cfg(unix)]
pub fn terminal_size() -> Option<(u16, u16)> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let result = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut size) };
    if result == 0 && size.ws_col > 0 && size.ws_row > 0 {
        Some((size.ws_col, size.ws_row))
    } else {
        None
    }
}

#[cfg(not(unix))]
pub fn terminal_size() -> Option<(u16, u16)> {
    None
}

pub fn terminal_size_or_default() -> (u16, u16) {
    terminal_size().unwrap_or((DEFAULT_COLUMNS, DEFAULT_ROWS))
}

/// ANSI SGR parameters for each line style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub header: &'static str,
    pub body: &'static str,
    pub muted: &'static str,
    pub error: &'static str,
    pub accent: &'static str,
}

impl Palette {
    pub fn for_theme(theme: Theme) -> Self {
        match theme {
            Theme::Light => Self {
                header: "1;34",
                body: "30",
                muted: "90",
                error: "31",
                accent: "35",
            },
            Theme::Dark => Self {
                header: "1;36",
                body: "37",
                muted: "90",
                error: "91",
                accent: "96",
            },
            Theme::Cupcake => Self {
                header: "1;38;5;175",
                body: "38;5;239",
                muted: "38;5;246",
                error: "38;5;167",
                accent: "38;5;80",
            },
            Theme::Dracula => Self {
                header: "1;38;5;141",
                body: "38;5;255",
                muted: "38;5;61",
                error: "38;5;203",
                accent: "38;5;212",
            },
            Theme::Nord => Self {
                header: "1;38;5;110",
                body: "38;5;254",
                muted: "38;5;60",
                error: "38;5;174",
                accent: "38;5;109",
            },
            Theme::Sunset => Self {
                header: "1;38;5;209",
                body: "38;5;223",
                muted: "38;5;95",
                error: "38;5;197",
                accent: "38;5;215",
            },
        }
    }

    pub fn code(&self, style: LineStyle) -> &'static str {
        match style {
            LineStyle::Header => self.header,
            LineStyle::Body => self.body,
            LineStyle::Muted => self.muted,
            LineStyle::Error => self.error,
        }
    }

    pub fn paint(&self, style: LineStyle, text: &str) -> String {
        format!("\x1b[{}m{text}{RESET}", self.code(style))
    }
}

#[derive(Debug, Clone)]
struct CachedMessage {
    message: MessageWithParts,
    lines: Vec<StyledLine>,
}

/// Message pane of the terminal client.
#[derive(Debug)]
pub struct ChatView {
    list: VirtualList,
    cache: HashMap<String, CachedMessage>,
    session_id: Option<String>,
    width: usize,
    revision: Option<u64>,
}

impl Default for ChatView {
    fn default() -> Self {
        Self::new(TERMINAL_LIST_OPTIONS)
    }
}

impl ChatView {
    pub fn new(options: VirtualListOptions) -> Self {
        Self {
            list: VirtualList::new(options),
            cache: HashMap::new(),
            session_id: None,
            width: 0,
            revision: None,
        }
    }

    pub fn list(&self) -> &VirtualList {
        &self.list
    }

    pub fn list_mut(&mut self) -> &mut VirtualList {
        &mut self.list
    }

    /// Bring rows in line with the store for a pane of `width` x `height`.
    /// Only rows rendered by an earlier frame are compared against the store.
    pub fn refresh(&mut self, store: &Store, width: usize, height: usize) {
        let width = width.max(1);
        let session_id = store.current_session_id().map(str::to_string);
        if session_id != self.session_id || width != self.width {
            self.list.reset();
            self.cache.clear();
            self.session_id = session_id;
            self.width = width;
            self.revision = None;
        }

        if self.revision != Some(store.revision()) {
            self.revision = Some(store.revision());
            let session_id = self.session_id.as_deref().unwrap_or_default();
            let keys = store.message_ids(session_id);
            let present: HashSet<&str> = keys.iter().map(String::as_str).collect();
            self.cache.retain(|key, _| present.contains(key.as_str()));

            let mut stale = Vec::new();
            for (key, cached) in &self.cache {
                if let Some(message) = store.message(session_id, key) {
                    if message != cached.message {
                        stale.push((key.clone(), message));
                    }
                }
            }
            for (key, message) in stale {
                if self.list.is_mounted(&key) {
                    let lines = render_message(&message, width);
                    self.list.resize_observed(&key, line_count(&lines));
                    self.cache.insert(key, CachedMessage { message, lines });
                } else {
                    self.cache.remove(&key);
                    self.list.invalidate_size(&key);
                }
            }
            self.list.sync_rows(keys);
        }

        self.list
            .set_viewport_height(u32::try_from(height).unwrap_or(u32::MAX));
    }

    /// Stage one of a frame: the visible lines of the message pane, exactly
    /// `height` entries long. Rows are rendered the first time they are laid out.
    pub fn visible_lines(&mut self, store: &Store, height: usize) -> Vec<StyledLine> {
        let offset = i64::from(self.list.scroll_offset());
        let session_id = self.session_id.as_deref().unwrap_or_default();
        let mut screen = vec![StyledLine { style: LineStyle::Body, text: String::new() }; height];

        for row in self.list.layout() {
            if !self.cache.contains_key(&row.key) {
                let Some(message) = store.message(session_id, &row.key) else {
                    continue;
                };
                let lines = render_message(&message, self.width);
                self.cache
                    .insert(row.key.clone(), CachedMessage { message, lines });
            }
            let Some(cached) = self.cache.get(&row.key) else {
                continue;
            };
            let top = i64::from(row.start) - offset;
            for (line_index, line) in cached.lines.iter().enumerate() {
                let y = top + line_index as i64;
                if y < 0 {
                    continue;
                }
                let Ok(y) = usize::try_from(y) else { continue };
                if y >= height {
                    break;
                }
                screen[y] = line.clone();
            }
        }
        screen
    }

    /// Number of messages rendered and kept for measurement.
    pub fn rendered_count(&self) -> usize {
        self.cache.len()
    }

    /// Stage two: the frame is on screen, report rendered sizes.
    pub fn after_paint(&mut self) -> PaintOutcome {
        let cache = &self.cache;
        self.list
            .on_paint(|key| cache.get(key).map(|cached| line_count(&cached.lines)))
    }
}

fn line_count(lines: &[StyledLine]) -> u32 {
    u32::try_from(lines.len()).unwrap_or(u32::MAX)
}

/// Everything the chat screen shows besides the message pane.
#[derive(Debug, Clone, Copy)]
pub struct ChatChrome<'a> {
    pub sessions: &'a [Session],
    pub current: Option<&'a str>,
    pub status: &'a str,
    pub alert: Option<&'a str>,
}

/// Assemble a full-screen chat frame as one ANSI string.
pub fn compose_chat_frame(
    palette: &Palette,
    chrome: ChatChrome<'_>,
    pane: &[StyledLine],
    width: usize,
) -> String {
    let mut out = String::from(CLEAR_SCREEN);

    let title = chrome
        .current
        .and_then(|id| chrome.sessions.iter().find(|session| session.id == id))
        .map(|session| session_line(session, true, width))
        .unwrap_or_else(|| truncate_to_width("  no session selected", width));
    out.push_str(&palette.paint(LineStyle::Header, &title));
    out.push_str("\r\n");

    for line in pane {
        out.push_str(&palette.paint(line.style, &line.text));
        out.push_str("\r\n");
    }

    if let Some(alert) = chrome.alert {
        out.push_str(&palette.paint(LineStyle::Error, &truncate_to_width(alert, width)));
        out.push_str("\r\n");
    }
    let status = truncate_to_width(chrome.status, width);
    out.push_str(&format!("\x1b[{}m{status}{RESET}\r\n", palette.accent));
    out.push_str("> ");
    out
}

/// Assemble the settings screen frame.
pub fn compose_settings_frame(
    palette: &Palette,
    endpoint: Option<&str>,
    hint: &str,
    theme: Theme,
    alert: Option<&str>,
    width: usize,
) -> String {
    let mut out = String::from(CLEAR_SCREEN);
    out.push_str(&palette.paint(LineStyle::Header, "OpenCode settings"));
    out.push_str("\r\n\r\n");
    let current = endpoint.unwrap_or("(not set)");
    for line in [
        format!("API endpoint: {current}"),
        format!("Theme: {}", theme.label()),
    ] {
        out.push_str(&palette.paint(LineStyle::Body, &truncate_to_width(&line, width)));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    if let Some(alert) = alert {
        out.push_str(&palette.paint(LineStyle::Error, &truncate_to_width(alert, width)));
        out.push_str("\r\n");
    }
    let prompt = format!("Enter API endpoint (e.g. {hint}): ");
    out.push_str(&palette.paint(LineStyle::Muted, &truncate_to_width(&prompt, width)));
    out
}
