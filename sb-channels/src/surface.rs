use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The six chat platforms bridged to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Whatsapp,
    Telegram,
    Discord,
    Slack,
    Signal,
    Imessage,
}

impl Surface {
    pub const ALL: [Surface; 6] = [
        Surface::Whatsapp,
        Surface::Telegram,
        Surface::Discord,
        Surface::Slack,
        Surface::Signal,
        Surface::Imessage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::Signal => "signal",
            Self::Imessage => "imessage",
        }
    }

    /// Platform text limit applied when the operator does not override it.
    pub fn default_text_chunk_limit(self) -> usize {
        match self {
            Self::Discord => 2000,
            _ => 4000,
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSurface(pub String);

impl fmt::Display for UnknownSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown surface: {:?}", self.0)
    }
}

impl std::error::Error for UnknownSurface {}

impl FromStr for Surface {
    type Err = UnknownSurface;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Surface::ALL
            .into_iter()
            .find(|surface| surface.as_str() == normalized)
            .ok_or(UnknownSurface(s.to_string()))
    }
}
