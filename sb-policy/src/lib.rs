//! Cross-surface authorization policy: allowlists, group policy and mention gating.

pub mod allowlist;
mod error;
pub mod gate;
pub mod group_policy;
pub mod mention;

pub use allowlist::{Allowlist, Subject};
pub use error::{PolicyError, Result};
pub use gate::{AuthorizationGate, AuthorizationVerdict, SurfacePolicy};
pub use group_policy::{GroupPolicy, GroupTable};
pub use mention::{ControlCommands, GroupSettings, MentionPatterns};
