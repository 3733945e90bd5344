use crate::surface::Surface;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(SenderId);
id_newtype!(SessionKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Direct,
    Group,
    Room,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Room => "room",
        }
    }

    /// Group and room conversations share gating and routing rules.
    pub fn is_multi_party(self) -> bool {
        matches!(self, Self::Group | Self::Room)
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media the adapter already downloaded; the core never fetches bytes itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub path: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Adapter-normalized inbound message.
///
/// `from` and `to` are self-describing addresses (`group:<id>`, `user:<id>`,
/// `+15550001111`). `from` is also the reply destination for the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalInboundEvent {
    pub surface: Surface,
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub chat_type: ChatType,
    pub sender_id: SenderId,
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Platform handle, e.g. `@alice` on Telegram.
    #[serde(default)]
    pub sender_tag: Option<String>,
    /// Adapter-native group/channel identity, used for group allowlists.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub group_subject: Option<String>,
    #[serde(default)]
    pub body: String,
    /// `None` when the platform exposes no structured mention data.
    #[serde(default)]
    pub was_mentioned: Option<bool>,
    /// At least one structured mention entity exists, whoever it targets.
    #[serde(default)]
    pub has_mention_entities: bool,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    pub message_id: MessageId,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CanonicalInboundEvent {
    /// Key used for inbound de-duplication.
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.surface, self.message_id)
    }

    pub fn sender_label(&self) -> &str {
        self.sender_name
            .as_deref()
            .or(self.sender_tag.as_deref())
            .unwrap_or(self.sender_id.as_str())
    }
}
