//! Turns agent output into ordered, size-bounded send operations.

use crate::error::DispatchError;
use sb_channels::{ChannelAdapter, MessageId, ReplyPayload, SendOp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyToMode {
    Off,
    #[default]
    First,
    All,
}

impl ReplyToMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::First => "first",
            Self::All => "all",
        }
    }
}

impl fmt::Display for ReplyToMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyToMode {
    type Err = DispatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "first" => Ok(Self::First),
            "all" => Ok(Self::All),
            other => Err(DispatchError::UnknownReplyToMode(other.to_string())),
        }
    }
}

/// Decides which send ops get threaded. One picker spans one sequence; the delivery
/// loop keeps one per agent run so `first` holds across incremental payloads.
#[derive(Debug, Clone)]
pub struct ReplyTargetPicker {
    mode: ReplyToMode,
    emitted: bool,
}

impl ReplyTargetPicker {
    pub fn new(mode: ReplyToMode) -> Self {
        Self {
            mode,
            emitted: false,
        }
    }

    /// Called once per send op, in emission order.
    pub fn pick(&mut self, reply_to_id: Option<&MessageId>) -> Option<MessageId> {
        let first = !self.emitted;
        self.emitted = true;
        match self.mode {
            ReplyToMode::Off => None,
            ReplyToMode::First if first => reply_to_id.cloned(),
            ReplyToMode::First => None,
            ReplyToMode::All => reply_to_id.cloned(),
        }
    }
}

pub fn sequence(payloads: &[ReplyPayload], chunk_limit: usize, mode: ReplyToMode) -> Vec<SendOp> {
    let mut picker = ReplyTargetPicker::new(mode);
    payloads
        .iter()
        .flat_map(|payload| sequence_payload(payload, chunk_limit, &mut picker))
        .collect()
}

/// Send ops for one payload, continuing `picker`'s threading state.
pub fn sequence_payload(
    payload: &ReplyPayload,
    chunk_limit: usize,
    picker: &mut ReplyTargetPicker,
) -> Vec<SendOp> {
    if payload.is_empty() {
        return Vec::new();
    }
    let reply_to_id = payload.reply_to_id.as_ref();
    let media: Vec<&str> = payload
        .media_urls
        .iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .collect();

    if media.is_empty() {
        return chunk_text(&payload.text, chunk_limit)
            .into_iter()
            .map(|chunk| SendOp {
                text: Some(chunk),
                media_url: None,
                reply_to: picker.pick(reply_to_id),
            })
            .collect();
    }

    let caption = Some(payload.text.trim())
        .filter(|text| !text.is_empty())
        .map(str::to_string);
    media
        .into_iter()
        .enumerate()
        .map(|(index, url)| SendOp {
            text: if index == 0 { caption.clone() } else { None },
            media_url: Some(url.to_string()),
            reply_to: picker.pick(reply_to_id),
        })
        .collect()
}

/// Split `text` into chunks of at most `limit` characters.
///
/// Cuts land on grapheme boundaries, preferring the last newline and then the last
/// whitespace inside the window. Only the boundary grapheme is dropped at a cut, so
/// indentation and blank lines survive. A single grapheme longer than `limit` is
/// kept whole.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim_end();

    while !rest.trim_start().is_empty() {
        if rest.chars().count() <= limit {
            chunks.push(rest.to_string());
            break;
        }

        let mut end = 0;
        let mut chars = 0;
        let mut newline_cut = None;
        let mut space_cut = None;
        for (index, grapheme) in rest.grapheme_indices(true) {
            let width = grapheme.chars().count();
            if chars + width > limit {
                // A boundary right after the window still gives a full-width chunk.
                if grapheme.contains('\n') {
                    newline_cut = Some((index, grapheme.len()));
                } else if grapheme.chars().all(char::is_whitespace) {
                    space_cut = Some((index, grapheme.len()));
                }
                break;
            }
            chars += width;
            end = index + grapheme.len();
            if grapheme.contains('\n') {
                newline_cut = Some((index, grapheme.len()));
            } else if grapheme.chars().all(char::is_whitespace) {
                space_cut = Some((index, grapheme.len()));
            }
        }
        if end == 0 {
            end = rest.graphemes(true).next().map_or(rest.len(), str::len);
        }

        let (cut, skip) = newline_cut
            .or(space_cut)
            .filter(|(cut, _)| *cut > 0)
            .unwrap_or((end, 0));
        let head = &rest[..cut];
        if !head.trim().is_empty() {
            chunks.push(head.to_string());
        }
        rest = &rest[cut + skip..];
    }
    chunks
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: Vec<MessageId>,
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Deliver every op in order. A failed op is recorded and the rest still go out.
pub async fn deliver_all(adapter: &dyn ChannelAdapter, to: &str, ops: Vec<SendOp>) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for (index, op) in ops.into_iter().enumerate() {
        match adapter.deliver(to, op).await {
            Ok(message_id) => report.delivered.push(message_id),
            Err(e) => {
                tracing::warn!(%e, surface = %adapter.surface(), to, index, "send op failed");
                report.failures.push(DeliveryFailure {
                    index,
                    error: e.to_string(),
                });
            }
        }
    }
    report
}
