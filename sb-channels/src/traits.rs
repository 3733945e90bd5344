use crate::reply::SendOp;
use crate::surface::Surface;
use crate::types::{CanonicalInboundEvent, MessageId};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn surface(&self) -> Surface;

    /// Start receiving messages. Push a canonical event to tx for each one worth surfacing.
    async fn start(&self, tx: mpsc::Sender<CanonicalInboundEvent>) -> Result<()>;

    /// Deliver one send operation to a conversation address (`event.from`).
    async fn deliver(&self, to: &str, op: SendOp) -> Result<MessageId>;

    /// Maximum characters per outbound text message.
    fn text_chunk_limit(&self) -> usize {
        self.surface().default_text_chunk_limit()
    }

    /// Group identity used for group allowlists and per-group mention settings.
    /// Adapters with a richer notion (guild + channel) override this.
    fn group_identity(&self, event: &CanonicalInboundEvent) -> Option<String> {
        if !event.chat_type.is_multi_party() {
            return None;
        }
        event.group_id.clone().or_else(|| Some(event.from.clone()))
    }
}
