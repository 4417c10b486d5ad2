//! Placement and formatting rules applied to a prompt before delivery.
//!
//! Pure transformation, no I/O. Transforms always run in the same order
//! (timestamp, header, quote, code fence, trailing newline) no matter how the
//! set was built, and always before placement assembly.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, SecondsFormat};
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

static TIMESTAMP_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*timestamp\s*\}\}").expect("valid timestamp token regex"));
static SELECTION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*selection\s*\}\}").expect("valid selection token regex"));

const QUOTE_MARKER: &str = ">";
const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Placement {
    /// Insert at the caret; never needs the target's content.
    #[default]
    Cursor,
    Top,
    Bottom,
    Wrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transform {
    EnsureTrailingNewline,
    CodeFence,
    Quote,
    Header,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimestampFormat {
    #[default]
    Iso8601,
    Short,
    Medium,
    Long,
    /// A chrono strftime pattern. Invalid patterns fall back to ISO-8601.
    Custom(String),
}

impl TimestampFormat {
    pub fn render(&self, now: &DateTime<Local>) -> String {
        let pattern = match self {
            TimestampFormat::Iso8601 => return now.to_rfc3339_opts(SecondsFormat::Secs, false),
            TimestampFormat::Short => "%-m/%-d/%y, %-I:%M %p",
            TimestampFormat::Medium => "%b %-d, %Y at %-I:%M:%S %p",
            TimestampFormat::Long => "%B %-d, %Y at %-I:%M:%S %p",
            TimestampFormat::Custom(pattern) => pattern.as_str(),
        };

        let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            log::warn!("Invalid timestamp pattern '{}', using ISO-8601", pattern);
            return now.to_rfc3339_opts(SecondsFormat::Secs, false);
        }
        now.format_with_items(items.into_iter()).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Enhancement {
    pub placement: Placement,
    pub newline_before: bool,
    pub newline_after: bool,
    pub blank_line_before: bool,
    pub blank_line_after: bool,
    pub wrap_prefix: String,
    pub wrap_suffix: String,
    pub transforms: BTreeSet<Transform>,
    pub header_level: u8,
    pub timestamp_format: TimestampFormat,
    pub fence_language: Option<String>,
}

impl Default for Enhancement {
    fn default() -> Self {
        Self {
            placement: Placement::Cursor,
            newline_before: false,
            newline_after: false,
            blank_line_before: false,
            blank_line_after: false,
            wrap_prefix: String::new(),
            wrap_suffix: String::new(),
            transforms: BTreeSet::new(),
            header_level: 1,
            timestamp_format: TimestampFormat::Iso8601,
            fence_language: None,
        }
    }
}

impl Enhancement {
    pub fn with_placement(placement: Placement) -> Self {
        Self {
            placement,
            ..Self::default()
        }
    }

    pub fn has(&self, transform: Transform) -> bool {
        self.transforms.contains(&transform)
    }

    /// Whether delivery needs the target's existing text or selection.
    pub fn requires_context(&self) -> bool {
        self.placement != Placement::Cursor
    }

    pub fn requires_selection(&self) -> bool {
        self.placement == Placement::Wrap
    }

    /// Applies the enhancement using the local wall clock for timestamps.
    pub fn apply(&self, content: &str, selection: Option<&str>, existing_content: &str) -> String {
        self.apply_at(content, selection, existing_content, &Local::now())
    }

    /// Deterministic form of [`Enhancement::apply`].
    pub fn apply_at(
        &self,
        content: &str,
        selection: Option<&str>,
        existing_content: &str,
        now: &DateTime<Local>,
    ) -> String {
        let transformed = self.transform_content(content, now);

        match self.placement {
            Placement::Cursor => transformed,
            Placement::Top => self.assemble_top(&transformed, existing_content),
            Placement::Bottom => self.assemble_bottom(&transformed, existing_content),
            Placement::Wrap => match selection.filter(|s| !s.is_empty()) {
                Some(selected) => self.wrap_selection(&transformed, selected),
                None => transformed,
            },
        }
    }

    fn transform_content(&self, content: &str, now: &DateTime<Local>) -> String {
        let mut text = content.to_string();

        if self.has(Transform::Timestamp) {
            let stamp = self.timestamp_format.render(now);
            text = TIMESTAMP_TOKEN
                .replace_all(&text, NoExpand(&stamp))
                .into_owned();
        }

        if self.has(Transform::Header) {
            let level = self.header_level.clamp(1, 6) as usize;
            text = format!("{} {}", "#".repeat(level), text);
        }

        if self.has(Transform::Quote) {
            text = quote_lines(&text);
        }

        // In wrap placement the fence belongs to the selection, not the prompt.
        if self.has(Transform::CodeFence) && self.placement != Placement::Wrap {
            text = fence(&text, self.fence_language.as_deref().unwrap_or(""));
        }

        if self.has(Transform::EnsureTrailingNewline) && !text.ends_with('\n') {
            text.push('\n');
        }

        text
    }

    fn assemble_top(&self, content: &str, existing: &str) -> String {
        let mut out = String::with_capacity(content.len() + existing.len() + 4);
        out.push_str(edge_padding(self.newline_before, self.blank_line_before));
        out.push_str(content);
        if !existing.is_empty() {
            out.push_str(separator(self.blank_line_after));
            out.push_str(existing);
        }
        out
    }

    fn assemble_bottom(&self, content: &str, existing: &str) -> String {
        let mut out = String::with_capacity(content.len() + existing.len() + 4);
        if !existing.is_empty() {
            out.push_str(existing);
            out.push_str(separator(self.blank_line_before));
        }
        out.push_str(content);
        out.push_str(edge_padding(self.newline_after, self.blank_line_after));
        out
    }

    fn wrap_selection(&self, content: &str, selected: &str) -> String {
        let language = self.fence_language.as_deref().unwrap_or("").trim();
        let wrapped = if self.has(Transform::CodeFence) && !language.is_empty() {
            fence(selected, language)
        } else {
            format!("{}{}{}", self.wrap_prefix, selected, self.wrap_suffix)
        };

        if SELECTION_TOKEN.is_match(content) {
            return SELECTION_TOKEN
                .replace_all(content, NoExpand(&wrapped))
                .into_owned();
        }

        if content.is_empty() || content.ends_with('\n') {
            format!("{}{}", content, wrapped)
        } else {
            format!("{}\n{}", content, wrapped)
        }
    }
}

/// Separator between inserted and existing text. Lines never fuse.
fn separator(blank_line: bool) -> &'static str {
    if blank_line {
        "\n\n"
    } else {
        "\n"
    }
}

/// Padding on the outer edge of the field (top of `top`, end of `bottom`).
fn edge_padding(newline: bool, blank_line: bool) -> &'static str {
    if blank_line {
        "\n\n"
    } else if newline {
        "\n"
    } else {
        ""
    }
}

fn quote_lines(text: &str) -> String {
    // A trailing newline ends the last line; it does not start a new one.
    let (body, trailing) = match text.strip_suffix('\n') {
        Some(body) => (body, "\n"),
        None => (text, ""),
    };
    let quoted = body
        .split('\n')
        .map(|line| {
            if line.is_empty() {
                QUOTE_MARKER.to_string()
            } else {
                format!("{} {}", QUOTE_MARKER, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    quoted + trailing
}

fn fence(text: &str, language: &str) -> String {
    let body = text.strip_suffix('\n').unwrap_or(text);
    format!("{}{}\n{}\n{}", FENCE, language, body, FENCE)
}
