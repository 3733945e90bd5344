use crate::error::{PolicyError, Result};
use crate::group_policy::GroupTable;
use regex::{Regex, RegexBuilder};
use sb_channels::CanonicalInboundEvent;

/// Recognizes operator directives that may skip mention gating.
pub trait ControlCommands: Send + Sync {
    fn is_control_command(&self, body: &str) -> bool;
}

impl<F> ControlCommands for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_control_command(&self, body: &str) -> bool {
        self(body)
    }
}

/// Textual mention patterns shared by every surface, compiled case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct MentionPatterns {
    patterns: Vec<Regex>,
}

impl MentionPatterns {
    pub fn compile<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| PolicyError::InvalidMentionPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
            compiled.push(regex);
        }
        tracing::debug!(count = compiled.len(), "compiled mention patterns");
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn matches(&self, body: &str) -> bool {
        self.patterns.iter().any(|regex| regex.is_match(body))
    }
}

/// Per-group override. Unset fields fall through to the `"*"` entry, then the surface default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSettings {
    pub require_mention: Option<bool>,
}

pub fn requires_mention(
    surface_default: bool,
    groups: &GroupTable<GroupSettings>,
    group_id: Option<&str>,
) -> bool {
    let exact = group_id
        .filter(|id| id.trim() != GroupTable::<GroupSettings>::WILDCARD)
        .and_then(|id| groups.lookup(Some(id)))
        .and_then(|settings| settings.require_mention);
    exact
        .or_else(|| {
            groups
                .lookup(None)
                .and_then(|settings| settings.require_mention)
        })
        .unwrap_or(surface_default)
}

/// Gating only applies when some form of detection exists; otherwise every message passes.
pub fn is_satisfied(
    event: &CanonicalInboundEvent,
    patterns: &MentionPatterns,
    require_mention: bool,
) -> bool {
    if !require_mention {
        return true;
    }
    if event.was_mentioned.is_none() && patterns.is_empty() {
        return true;
    }
    event.was_mentioned == Some(true) || patterns.matches(&event.body)
}

/// Lets an authorized operator issue a command in a group without mentioning the bot.
/// Never applies when the message carries any mention, including one aimed at someone else.
pub fn bypass_for_command(
    event: &CanonicalInboundEvent,
    patterns: &MentionPatterns,
    command_authorized: bool,
    commands: &dyn ControlCommands,
) -> bool {
    event.chat_type.is_multi_party()
        && command_authorized
        && !event.has_mention_entities
        && event.was_mentioned != Some(true)
        && !patterns.matches(&event.body)
        && commands.is_control_command(&event.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sb_channels::{ChatType, MessageId, SenderId, Surface};
    use std::collections::HashMap;

    fn group_event(body: &str) -> CanonicalInboundEvent {
        CanonicalInboundEvent {
            surface: Surface::Discord,
            from: "channel:555".to_string(),
            to: "bot".to_string(),
            chat_type: ChatType::Group,
            sender_id: SenderId::new("111"),
            sender_name: Some("Op".to_string()),
            sender_tag: None,
            group_id: Some("555".to_string()),
            group_subject: None,
            body: body.to_string(),
            was_mentioned: None,
            has_mention_entities: false,
            media: vec![],
            message_id: MessageId::new("m1"),
            timestamp: Utc::now(),
        }
    }

    fn slash(body: &str) -> bool {
        body.trim_start().starts_with('/')
    }

    fn patterns(list: &[&str]) -> MentionPatterns {
        MentionPatterns::compile(list.iter().copied()).expect("compile patterns")
    }

    #[test]
    fn not_required_is_always_satisfied() {
        let mut event = group_event("hello");
        event.was_mentioned = Some(false);
        assert!(is_satisfied(&event, &patterns(&["@clawd"]), false));
    }

    #[test]
    fn no_detection_capability_is_always_satisfied() {
        let event = group_event("hello everyone");
        assert!(is_satisfied(&event, &MentionPatterns::default(), true));
    }

    #[test]
    fn native_mention_or_pattern_satisfies() {
        let mut event = group_event("hello");
        event.was_mentioned = Some(true);
        assert!(is_satisfied(&event, &MentionPatterns::default(), true));

        event.was_mentioned = Some(false);
        assert!(!is_satisfied(&event, &MentionPatterns::default(), true));

        let event = group_event("hey CLAWD what's up");
        assert!(is_satisfied(&event, &patterns(&[r"\bclawd\b"]), true));
        let event = group_event("hey there");
        assert!(!is_satisfied(&event, &patterns(&[r"\bclawd\b"]), true));
    }

    #[test]
    fn bypass_for_authorized_command_without_mentions() {
        let mut event = group_event("/status");
        event.was_mentioned = Some(false);
        let pats = patterns(&["@clawd"]);
        assert!(bypass_for_command(&event, &pats, true, &slash));
        assert!(!bypass_for_command(&event, &pats, false, &slash));

        let plain = group_event("status please");
        assert!(!bypass_for_command(&plain, &pats, true, &slash));
    }

    #[test]
    fn bypass_never_applies_to_mention_of_someone_else() {
        let mut event = group_event("<@999> /status");
        event.was_mentioned = Some(false);
        event.has_mention_entities = true;
        event.body = "/status <@999>".to_string();
        assert!(!is_satisfied(&event, &MentionPatterns::default(), true));
        assert!(!bypass_for_command(
            &event,
            &MentionPatterns::default(),
            true,
            &slash
        ));
    }

    #[test]
    fn bypass_is_group_only() {
        let mut event = group_event("/new");
        event.chat_type = ChatType::Direct;
        assert!(!bypass_for_command(
            &event,
            &MentionPatterns::default(),
            true,
            &slash
        ));
    }

    #[test]
    fn requires_mention_resolution_order() {
        let groups = GroupTable::new(HashMap::from([
            (
                "*".to_string(),
                GroupSettings {
                    require_mention: Some(false),
                },
            ),
            (
                "loud".to_string(),
                GroupSettings {
                    require_mention: Some(true),
                },
            ),
            ("unset".to_string(), GroupSettings::default()),
        ]));
        assert!(requires_mention(false, &groups, Some("loud")));
        assert!(!requires_mention(true, &groups, Some("quiet")));
        assert!(!requires_mention(true, &groups, Some("unset")));
        assert!(requires_mention(true, &GroupTable::default(), Some("x")));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = MentionPatterns::compile(["(unclosed"]).expect_err("bad regex");
        assert!(matches!(err, PolicyError::InvalidMentionPattern { .. }));
    }
}
