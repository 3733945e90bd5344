//! Canonical message model for Switchboard.
//!
//! Platform adapters are pure I/O: they convert platform events into
//! `CanonicalInboundEvent`s and deliver `SendOp`s back to the platform. Every
//! policy decision happens downstream of this crate.

mod loopback;
mod reply;
mod surface;
mod traits;
mod types;

pub use loopback::{DeliveredOp, LoopbackAdapter};
pub use reply::{ReplyKind, ReplyPayload, SendOp};
pub use surface::{Surface, UnknownSurface};
pub use traits::ChannelAdapter;
pub use types::{CanonicalInboundEvent, ChatType, MediaRef, MessageId, SenderId, SessionKey};
