//! The authorization gate: one combined verdict per inbound event.

use crate::allowlist::{Allowlist, Subject};
use crate::group_policy::{GroupPolicy, GroupTable};
use crate::mention::{self, ControlCommands, GroupSettings, MentionPatterns};
use sb_channels::CanonicalInboundEvent;
use serde::Serialize;

/// Compiled policy for one surface.
#[derive(Debug, Clone)]
pub struct SurfacePolicy {
    pub group_policy: GroupPolicy,
    pub allow_from: Allowlist,
    /// Empty falls back to `allow_from`; empty both ways leaves groups gated only by
    /// `group_policy`.
    pub group_allow_from: Allowlist,
    pub require_mention: bool,
    pub groups: GroupTable<GroupSettings>,
}

impl Default for SurfacePolicy {
    fn default() -> Self {
        Self {
            group_policy: GroupPolicy::default(),
            allow_from: Allowlist::default(),
            group_allow_from: Allowlist::default(),
            require_mention: true,
            groups: GroupTable::default(),
        }
    }
}

impl SurfacePolicy {
    /// Group senders are checked against `group_allow_from`, falling back to `allow_from`.
    fn sender_list(&self, event: &CanonicalInboundEvent) -> &Allowlist {
        if event.chat_type.is_multi_party() && !self.group_allow_from.is_empty() {
            &self.group_allow_from
        } else {
            &self.allow_from
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthorizationVerdict {
    pub sender_allowed: bool,
    pub group_allowed: bool,
    pub mention_satisfied: bool,
    pub command_authorized: bool,
}

impl AuthorizationVerdict {
    pub fn accepted(&self) -> bool {
        self.sender_allowed && self.group_allowed && self.mention_satisfied
    }
}

pub struct AuthorizationGate<'a> {
    policy: &'a SurfacePolicy,
    patterns: &'a MentionPatterns,
    commands: &'a dyn ControlCommands,
}

impl<'a> AuthorizationGate<'a> {
    pub fn new(
        policy: &'a SurfacePolicy,
        patterns: &'a MentionPatterns,
        commands: &'a dyn ControlCommands,
    ) -> Self {
        Self {
            policy,
            patterns,
            commands,
        }
    }

    /// `group_id` is the adapter-supplied group identity (`None` for direct chats).
    pub fn evaluate(
        &self,
        event: &CanonicalInboundEvent,
        group_id: Option<&str>,
    ) -> AuthorizationVerdict {
        let subject = Subject::sender(event);
        let senders = self.policy.sender_list(event);
        let sender_allowed = senders.allows(&subject);

        if !event.chat_type.is_multi_party() {
            return AuthorizationVerdict {
                sender_allowed,
                group_allowed: true,
                mention_satisfied: true,
                command_authorized: sender_allowed,
            };
        }

        // In groups an empty sender list admits chatter but grants no command rights.
        let command_authorized = senders.matches(&subject);
        let group_allowed = self
            .policy
            .groups
            .allows_group(self.policy.group_policy, group_id);

        let require_mention =
            mention::requires_mention(self.policy.require_mention, &self.policy.groups, group_id);
        let mention_satisfied = mention::is_satisfied(event, self.patterns, require_mention)
            || mention::bypass_for_command(
                event,
                self.patterns,
                command_authorized,
                self.commands,
            );

        let verdict = AuthorizationVerdict {
            sender_allowed,
            group_allowed,
            mention_satisfied,
            command_authorized,
        };
        tracing::trace!(
            surface = %event.surface,
            group_id = group_id.unwrap_or_default(),
            policy = %self.policy.group_policy,
            require_mention,
            ?verdict,
            "group message evaluated"
        );
        verdict
    }
}
