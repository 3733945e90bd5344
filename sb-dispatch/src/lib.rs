//! Session routing, per-session dispatch queues and reply sequencing.

pub mod agent;
pub mod dedupe;
pub mod dispatcher;
mod error;
pub mod queue;
pub mod routing;
pub mod sequencer;

pub use agent::{AgentOutput, AgentRunner, RunOrigin, RunRequest, SteerInbox};
pub use dedupe::DedupeCache;
pub use dispatcher::{
    DispatchOutput, Dispatcher, DispatcherConfig, RunOutcome, SessionStatus,
};
pub use error::{DispatchError, Result};
pub use queue::{DropPolicy, Phase, QueueMode, QueueSettings, SessionQueue};
pub use routing::{SessionScope, route};
pub use sequencer::{
    DeliveryFailure, DeliveryReport, ReplyTargetPicker, ReplyToMode, chunk_text, deliver_all,
    sequence, sequence_payload,
};
