use crate::types::MessageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One unit of agent output, produced by the agent collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_reply_to(mut self, reply_to_id: impl Into<MessageId>) -> Self {
        self.reply_to_id = Some(reply_to_id.into());
        self
    }

    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media_urls.push(url.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.media_urls.iter().all(|url| url.trim().is_empty())
    }
}

/// Where a payload sits in the agent turn; used to tag delivery errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Tool,
    Block,
    Final,
}

impl ReplyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Block => "block",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single outbound platform call: a text chunk or one media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOp {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl SendOp {
    pub fn is_media(&self) -> bool {
        self.media_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_payload_is_empty() {
        assert!(ReplyPayload::text("  \n").is_empty());
        assert!(!ReplyPayload::text("ok").is_empty());
        assert!(!ReplyPayload::default().with_media("file:///a.png").is_empty());
    }
}
