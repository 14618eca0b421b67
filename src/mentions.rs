//! Mass-mention detection.
//!
//! Classifies text for mention syntax that could ping a large audience:
//! the broadcast tokens (`@everyone`, `@here`) and role-mention tokens
//! (`<@&id>`). Pure and total: any input yields a scan, never a panic.

use regex::Regex;

/// Result of scanning a piece of text for mass-mention syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MentionScan {
    /// Text contains the broadcast-all token (`@everyone`).
    pub broadcast_all: bool,
    /// Text contains the broadcast-online token (`@here`).
    pub broadcast_online: bool,
    /// Role ids referenced by role-mention tokens, in source order.
    /// Duplicates are preserved; callers must not assume uniqueness.
    pub role_ids: Vec<String>,
}

impl MentionScan {
    /// True iff any mention class that pings an audience is present.
    pub fn dangerous(&self) -> bool {
        self.broadcast_all || self.broadcast_online || !self.role_ids.is_empty()
    }
}

/// Detector holding the compiled role-mention pattern.
pub struct MentionDetector {
    role_token: Regex,
}

impl MentionDetector {
    pub fn new() -> Self {
        Self {
            role_token: Regex::new(r"<@&(\d+)>").unwrap(),
        }
    }

    /// Scan arbitrary text for mass-mention syntax.
    pub fn scan(&self, text: &str) -> MentionScan {
        MentionScan {
            broadcast_all: text.contains("@everyone"),
            broadcast_online: text.contains("@here"),
            role_ids: self
                .role_token
                .captures_iter(text)
                .map(|c| c[1].to_string())
                .collect(),
        }
    }
}

impl Default for MentionDetector {
    fn default() -> Self {
        Self::new()
    }
}
