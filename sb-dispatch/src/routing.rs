use crate::error::DispatchError;
use sb_channels::{CanonicalInboundEvent, ChatType, SessionKey, Surface};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    #[default]
    #[serde(alias = "per_sender", alias = "perSender")]
    PerSender,
    Global,
}

impl SessionScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerSender => "per-sender",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionScope {
    type Err = DispatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per-sender" | "per_sender" | "persender" => Ok(Self::PerSender),
            "global" => Ok(Self::Global),
            other => Err(DispatchError::UnknownSessionScope(other.to_string())),
        }
    }
}

/// Map an event to the session that owns its history and queue.
///
/// Direct chats share the main session under `per-sender`; every group or room
/// gets an isolated key built from the surface, chat type and conversation address.
pub fn route(scope: SessionScope, event: &CanonicalInboundEvent, main_key: &SessionKey) -> SessionKey {
    match scope {
        SessionScope::Global => main_key.clone(),
        SessionScope::PerSender if !event.chat_type.is_multi_party() => main_key.clone(),
        SessionScope::PerSender => group_session_key(event.surface, event.chat_type, &event.from),
    }
}

pub fn group_session_key(surface: Surface, chat_type: ChatType, from: &str) -> SessionKey {
    SessionKey::new(format!("{surface}:{chat_type}:{}", from.trim()))
}
