//! Structured key-value header embedded at the top of free-text descriptions.
//!
//! Backends without native columns (the flat issue-tracker store) keep every
//! scheduling field in this block:
//!
//! ```text
//! ---
//! cell: alpha
//! role: builder
//! turn_id: wi-3f9a02c1
//! ---
//! Free-form body text.
//! ```
//!
//! Decoding ignores unknown keys. Encoding emits only non-empty fields, always
//! in the same order.

use serde::{Deserialize, Serialize};

/// Header delimiter line.
pub const MARKER: &str = "---";

/// Recognized header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub rig: Option<String>,
    pub cell: Option<String>,
    pub role: Option<String>,
    pub scope: Option<String>,
    pub worktree: Option<String>,
    pub turn_id: Option<String>,
    pub kind: Option<String>,
    pub title: Option<String>,
    pub severity: Option<String>,
    pub conflict: bool,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub promise: Option<String>,
    pub agent: Option<String>,
    pub work_item: Option<String>,
    pub session: Option<String>,
    pub status: Option<String>,
    pub heartbeat: Option<String>,
    pub branch: Option<String>,
    pub base: Option<String>,
}

/// Field names in encoding order. `conflict` is the only boolean.
const FIELDS: &[&str] = &[
    "rig",
    "cell",
    "role",
    "scope",
    "worktree",
    "turn_id",
    "kind",
    "title",
    "severity",
    "conflict",
    "inbox",
    "outbox",
    "promise",
    "agent",
    "work_item",
    "session",
    "status",
    "heartbeat",
    "branch",
    "base",
];

impl Metadata {
    fn slot(&mut self, key: &str) -> Option<&mut Option<String>> {
        let slot = match key {
            "rig" => &mut self.rig,
            "cell" => &mut self.cell,
            "role" => &mut self.role,
            "scope" => &mut self.scope,
            "worktree" => &mut self.worktree,
            "turn_id" => &mut self.turn_id,
            "kind" => &mut self.kind,
            "title" => &mut self.title,
            "severity" => &mut self.severity,
            "inbox" => &mut self.inbox,
            "outbox" => &mut self.outbox,
            "promise" => &mut self.promise,
            "agent" => &mut self.agent,
            "work_item" => &mut self.work_item,
            "session" => &mut self.session,
            "status" => &mut self.status,
            "heartbeat" => &mut self.heartbeat,
            "branch" => &mut self.branch,
            "base" => &mut self.base,
            _ => return None,
        };
        Some(slot)
    }

    fn value(&self, key: &str) -> Option<&str> {
        let value = match key {
            "rig" => &self.rig,
            "cell" => &self.cell,
            "role" => &self.role,
            "scope" => &self.scope,
            "worktree" => &self.worktree,
            "turn_id" => &self.turn_id,
            "kind" => &self.kind,
            "title" => &self.title,
            "severity" => &self.severity,
            "inbox" => &self.inbox,
            "outbox" => &self.outbox,
            "promise" => &self.promise,
            "agent" => &self.agent,
            "work_item" => &self.work_item,
            "session" => &self.session,
            "status" => &self.status,
            "heartbeat" => &self.heartbeat,
            "branch" => &self.branch,
            "base" => &self.base,
            _ => return None,
        };
        value.as_deref().filter(|v| !v.is_empty())
    }

    /// True when no field carries a value.
    pub fn is_empty(&self) -> bool {
        *self == Metadata::default()
    }

    /// Decode the header block of `text`. Text without a header decodes to
    /// an empty `Metadata`.
    pub fn decode(text: &str) -> Self {
        let mut meta = Metadata::default();
        let mut lines = text.lines().skip_while(|line| line.trim() != MARKER);
        if lines.next().is_none() {
            return meta;
        }

        for line in lines {
            if line.trim() == MARKER {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key == "conflict" {
                meta.conflict = parse_bool(value);
                continue;
            }
            if value.is_empty() {
                continue;
            }
            if let Some(slot) = meta.slot(key) {
                *slot = Some(value.to_string());
            }
        }

        meta
    }

    /// Encode the non-empty fields as a `---` delimited block. An empty
    /// `Metadata` encodes to an empty string.
    pub fn encode(&self) -> String {
        let mut lines = Vec::new();
        for key in FIELDS {
            if *key == "conflict" {
                if self.conflict {
                    lines.push("conflict: true".to_string());
                }
                continue;
            }
            if let Some(value) = self.value(key) {
                lines.push(format!("{}: {}", key, value));
            }
        }

        if lines.is_empty() {
            return String::new();
        }
        format!("{MARKER}\n{}\n{MARKER}\n", lines.join("\n"))
    }

    /// Set one field by name. An empty value clears it. Returns false for an
    /// unknown key.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        let value = value.trim();
        if key == "conflict" {
            self.conflict = parse_bool(value);
            return true;
        }
        match self.slot(key) {
            Some(slot) => {
                *slot = (!value.is_empty()).then(|| value.to_string());
                true
            }
            None => false,
        }
    }

    /// Names of the recognized fields, in encoding order.
    pub fn fields() -> &'static [&'static str] {
        FIELDS
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

/// Remove a leading header block from `text` and trim the remainder.
///
/// A header that is opened but never closed yields an empty body. This keeps
/// compatibility with records already written that way, although it drops
/// whatever followed the opening marker.
pub fn strip(text: &str) -> String {
    let first = text.lines().find(|line| !line.trim().is_empty());
    if first.map(str::trim) != Some(MARKER) {
        return text.trim().to_string();
    }

    let mut lines = text.lines().skip_while(|line| line.trim() != MARKER);
    lines.next();
    let mut closed = false;
    let mut body = Vec::new();
    for line in lines {
        if !closed {
            if line.trim() == MARKER {
                closed = true;
            }
            continue;
        }
        body.push(line);
    }

    if !closed {
        return String::new();
    }
    body.join("\n").trim().to_string()
}

/// Replace the header of `text` with `meta`, keeping the body.
pub fn with_metadata(text: &str, meta: &Metadata) -> String {
    let body = strip(text);
    let header = meta.encode();
    match (header.is_empty(), body.is_empty()) {
        (true, _) => body,
        (false, true) => header,
        (false, false) => format!("{}\n{}", header, body),
    }
}
