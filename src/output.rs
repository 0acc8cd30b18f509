//! Per-item status messages, rendered as colorized text or JSON.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write as _;

/// A completed copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorMessage {
    pub status: &'static str,
    pub source: String,
    pub target: String,
    pub size: u64,
    #[serde(rename = "totalCount")]
    pub total_count: u64,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
}

/// A completed deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveMessage {
    pub status: &'static str,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorMessage {
    pub status: &'static str,
    /// What was being attempted, e.g. "Failed to copy 'a/1.txt'"
    pub message: String,
    pub cause: String,
}

impl MirrorMessage {
    pub fn new(source: String, target: String, size: u64, total_count: u64, total_size: u64) -> Self {
        Self {
            status: "success",
            source,
            target,
            size,
            total_count,
            total_size,
        }
    }
}

impl RemoveMessage {
    pub fn new(key: String) -> Self {
        Self {
            status: "success",
            key,
        }
    }
}

impl ErrorMessage {
    pub fn new(message: String, cause: String) -> Self {
        Self {
            status: "error",
            message,
            cause,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    Mirror(MirrorMessage),
    Remove(RemoveMessage),
    Error(ErrorMessage),
}

impl StatusMessage {
    pub fn is_error(&self) -> bool {
        matches!(self, StatusMessage::Error(_))
    }

    pub fn json(&self) -> String {
        let rendered = match self {
            StatusMessage::Mirror(m) => serde_json::to_string(m),
            StatusMessage::Remove(m) => serde_json::to_string(m),
            StatusMessage::Error(m) => serde_json::to_string(m),
        };
        rendered.unwrap_or_default()
    }

    /// One human-readable line.
    pub fn render(&self, color: bool) -> String {
        let mut line = String::new();
        match self {
            StatusMessage::Mirror(m) => {
                let source = format!("'{}'", m.source);
                let target = format!("'{}'", m.target);
                if color {
                    let _ = write!(line, "{} -> {}", source.green(), target.green());
                } else {
                    let _ = write!(line, "{} -> {}", source, target);
                }
            }
            StatusMessage::Remove(m) => {
                let key = format!("'{}'", m.key);
                if color {
                    let _ = write!(line, "Removed {}.", key.red().bold());
                } else {
                    let _ = write!(line, "Removed {}.", key);
                }
            }
            StatusMessage::Error(m) => {
                if color {
                    let _ = write!(line, "{} {}. {}", "mirror: <ERROR>".red().bold(), m.message, m.cause);
                } else {
                    let _ = write!(line, "mirror: <ERROR> {}. {}", m.message, m.cause);
                }
            }
        }
        line
    }
}
