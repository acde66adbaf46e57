//! Session actions queued by the registry.
//!
//! The registry delivers actions as plain string tokens (`update_raw`,
//! `update_raw:from_server`, `create_otf`, `launch_otf`). They are decoded
//! once, right after a session is fetched, into the closed [`Action`] set; the
//! dispatcher never looks at raw tokens.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Re-derive the raw folder info. `from_server` marks the periodic
    /// refresh, which only pushes the session when something changed.
    UpdateRaw { from_server: bool },
    /// Build (or rebuild) the OTF workspace.
    CreateOtf,
    /// Start processing in an existing workspace.
    LaunchOtf,
}

impl Action {
    /// Decode one registry token. Tokens are matched by prefix, so suffixed
    /// variants such as `create_otf:retry` still resolve.
    pub fn parse(token: &str) -> Option<Action> {
        let token = token.trim();
        if let Some(rest) = token.strip_prefix("update_raw") {
            return Some(Action::UpdateRaw {
                from_server: rest.contains("from_server"),
            });
        }
        if token.starts_with("create_otf") {
            return Some(Action::CreateOtf);
        }
        if token.starts_with("launch_otf") {
            return Some(Action::LaunchOtf);
        }
        None
    }

    /// Decode a whole queue, dropping (and logging) unknown tokens.
    pub fn decode_queue<S: AsRef<str>>(tokens: &[S]) -> Vec<Action> {
        tokens
            .iter()
            .filter_map(|t| {
                let t = t.as_ref();
                let action = Action::parse(t);
                if action.is_none() {
                    warn!(token = t, "ignoring unknown session action");
                }
                action
            })
            .collect()
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            Action::UpdateRaw { from_server: false } => "update_raw",
            Action::UpdateRaw { from_server: true } => "update_raw:from_server",
            Action::CreateOtf => "create_otf",
            Action::LaunchOtf => "launch_otf",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}
