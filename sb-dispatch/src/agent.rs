use crate::queue::is_summary;
use anyhow::Result;
use async_trait::async_trait;
use sb_channels::{
    CanonicalInboundEvent, ChatType, MessageId, ReplyKind, ReplyPayload, SessionKey, Surface,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where a run's replies go: the conversation of the newest event that seeded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOrigin {
    pub surface: Surface,
    pub chat_type: ChatType,
    pub to: String,
    pub message_id: MessageId,
}

impl RunOrigin {
    pub fn from_event(event: &CanonicalInboundEvent) -> Self {
        Self {
            surface: event.surface,
            chat_type: event.chat_type,
            to: event.from.clone(),
            message_id: event.message_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_key: SessionKey,
    pub run_id: Uuid,
    pub origin: RunOrigin,
    pub events: Vec<CanonicalInboundEvent>,
}

impl RunRequest {
    /// `None` when there is nothing to run.
    pub fn new(session_key: SessionKey, events: Vec<CanonicalInboundEvent>) -> Option<Self> {
        let origin = RunOrigin::from_event(events.last()?);
        Some(Self {
            session_key,
            run_id: Uuid::new_v4(),
            origin,
            events,
        })
    }

    /// Input text for the agent. Several queued events are concatenated in arrival order.
    pub fn prompt(&self) -> String {
        if let [single] = self.events.as_slice() {
            return single.body.clone();
        }
        let mut prompt = String::from("[Queued messages while agent was busy]\n");
        for (index, event) in self.events.iter().enumerate() {
            prompt.push_str("\n---\n");
            if is_summary(event) {
                prompt.push_str(&event.body);
            } else {
                let _ = write!(
                    prompt,
                    "Queued #{} from {}\n{}",
                    index + 1,
                    event.sender_label(),
                    event.body
                );
            }
        }
        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub kind: ReplyKind,
    pub payload: ReplyPayload,
}

impl AgentOutput {
    pub fn new(kind: ReplyKind, payload: ReplyPayload) -> Self {
        Self { kind, payload }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self::new(ReplyKind::Final, ReplyPayload::text(text))
    }
}

/// Live input for a running turn.
///
/// Events the agent has not read when the turn ends are handed back to the session
/// backlog, so closing the inbox early never loses a message.
#[derive(Clone)]
pub struct SteerInbox {
    rx: Arc<Mutex<mpsc::Receiver<CanonicalInboundEvent>>>,
}

impl SteerInbox {
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<CanonicalInboundEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    pub async fn recv(&self) -> Option<CanonicalInboundEvent> {
        self.rx.lock().await.recv().await
    }

    pub async fn try_recv(&self) -> Option<CanonicalInboundEvent> {
        self.rx.lock().await.try_recv().ok()
    }

    /// Stop taking live input. Later arrivals go to the backlog instead.
    pub async fn close(&self) {
        self.rx.lock().await.close();
    }

    pub(crate) async fn reclaim(&self) -> Vec<CanonicalInboundEvent> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut unread = Vec::new();
        while let Ok(event) = rx.try_recv() {
            unread.push(event);
        }
        unread
    }
}

/// The agent collaborator. One call is one turn.
///
/// Output sent on `replies` after `cancel` fires is discarded.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        steer: SteerInbox,
        replies: mpsc::Sender<AgentOutput>,
        cancel: CancellationToken,
    ) -> Result<()>;
}
