use crate::reply::SendOp;
use crate::surface::Surface;
use crate::traits::ChannelAdapter;
use crate::types::{CanonicalInboundEvent, MessageId};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// A delivery the loopback adapter accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredOp {
    pub surface: Surface,
    pub to: String,
    pub message_id: MessageId,
    pub op: SendOp,
}

#[derive(Default)]
struct LoopbackState {
    delivered: Vec<DeliveredOp>,
    attempts: usize,
    failing_attempts: HashSet<usize>,
}

/// In-process adapter: inbound events are pushed by the caller and every
/// delivery is recorded instead of hitting a platform API.
#[derive(Clone)]
pub struct LoopbackAdapter {
    surface: Surface,
    chunk_limit: Option<usize>,
    inbound_tx: Arc<RwLock<Option<mpsc::Sender<CanonicalInboundEvent>>>>,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackAdapter {
    pub fn new(surface: Surface) -> Self {
        Self {
            surface,
            chunk_limit: None,
            inbound_tx: Arc::new(RwLock::new(None)),
            state: Arc::new(Mutex::new(LoopbackState::default())),
        }
    }

    pub fn with_chunk_limit(mut self, chunk_limit: usize) -> Self {
        self.chunk_limit = Some(chunk_limit);
        self
    }

    /// Make the n-th delivery attempt (0-based, counted across the adapter's lifetime) fail.
    pub fn fail_attempt(&self, attempt: usize) {
        self.with_state(|state| {
            state.failing_attempts.insert(attempt);
        });
    }

    pub async fn push(&self, event: CanonicalInboundEvent) -> Result<()> {
        let tx = self.inbound_tx.read().await.clone();
        let Some(tx) = tx else {
            return Err(anyhow::anyhow!(
                "{} loopback adapter started without inbound queue",
                self.surface
            ));
        };
        tx.send(event)
            .await
            .map_err(|e| anyhow::anyhow!("{} inbound queue closed: {e}", self.surface))
    }

    /// Drop the inbound sender so the gateway sees end-of-stream.
    pub async fn close(&self) {
        self.inbound_tx.write().await.take();
    }

    pub fn delivered(&self) -> Vec<DeliveredOp> {
        self.with_state(|state| state.delivered.clone())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LoopbackState) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for LoopbackAdapter {
    fn surface(&self) -> Surface {
        self.surface
    }

    async fn start(&self, tx: mpsc::Sender<CanonicalInboundEvent>) -> Result<()> {
        *self.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn deliver(&self, to: &str, op: SendOp) -> Result<MessageId> {
        let surface = self.surface;
        self.with_state(|state| {
            let attempt = state.attempts;
            state.attempts += 1;
            if state.failing_attempts.remove(&attempt) {
                tracing::debug!(%surface, attempt, to, "injected loopback delivery failure");
                return Err(anyhow::anyhow!(
                    "{surface} loopback delivery failed: attempt={attempt} to={to}"
                ));
            }
            let message_id = MessageId::new(Uuid::new_v4().to_string());
            tracing::trace!(%surface, to, %message_id, media = op.is_media(), "loopback delivery recorded");
            state.delivered.push(DeliveredOp {
                surface,
                to: to.to_string(),
                message_id: message_id.clone(),
                op,
            });
            Ok(message_id)
        })
    }

    fn text_chunk_limit(&self) -> usize {
        self.chunk_limit
            .unwrap_or_else(|| self.surface.default_text_chunk_limit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatType, SenderId};
    use chrono::Utc;

    fn event() -> CanonicalInboundEvent {
        CanonicalInboundEvent {
            surface: Surface::Signal,
            from: "+15550001111".to_string(),
            to: "+15559990000".to_string(),
            chat_type: ChatType::Direct,
            sender_id: SenderId::new("+15550001111"),
            sender_name: None,
            sender_tag: None,
            group_id: None,
            group_subject: None,
            body: "hello".to_string(),
            was_mentioned: None,
            has_mention_entities: false,
            media: vec![],
            message_id: MessageId::new("1"),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn push_requires_start() {
        let adapter = LoopbackAdapter::new(Surface::Signal);
        assert!(adapter.push(event()).await.is_err());

        let (tx, mut rx) = mpsc::channel(4);
        adapter.start(tx).await.expect("start");
        adapter.push(event()).await.expect("push");
        let received = rx.recv().await.expect("event");
        assert_eq!(received.body, "hello");
    }

    #[tokio::test]
    async fn records_deliveries_and_injected_failures() {
        let adapter = LoopbackAdapter::new(Surface::Signal).with_chunk_limit(10);
        adapter.fail_attempt(1);
        let op = |text: &str| SendOp {
            text: Some(text.to_string()),
            media_url: None,
            reply_to: None,
        };

        adapter.deliver("+1555", op("a")).await.expect("first");
        assert!(adapter.deliver("+1555", op("b")).await.is_err());
        adapter.deliver("+1555", op("c")).await.expect("third");

        let delivered = adapter.delivered();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].op.text.as_deref(), Some("a"));
        assert_eq!(delivered[1].op.text.as_deref(), Some("c"));
        assert_eq!(adapter.text_chunk_limit(), 10);
    }
}
