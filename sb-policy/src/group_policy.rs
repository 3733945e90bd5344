use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    Open,
    Disabled,
    #[default]
    Allowlist,
}

impl GroupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Disabled => "disabled",
            Self::Allowlist => "allowlist",
        }
    }
}

impl fmt::Display for GroupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a group/room/channel message is accepted at all.
pub fn evaluate(policy: GroupPolicy, allowlist_configured: bool, candidate_allowed: bool) -> bool {
    match policy {
        GroupPolicy::Disabled => false,
        GroupPolicy::Open => true,
        GroupPolicy::Allowlist => allowlist_configured && candidate_allowed,
    }
}

/// Per-group settings keyed by adapter group identity; `"*"` applies to any group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTable<T> {
    entries: HashMap<String, T>,
}

impl<T> Default for GroupTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> GroupTable<T> {
    pub const WILDCARD: &'static str = "*";

    pub fn new(entries: HashMap<String, T>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (key.trim().to_string(), value))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Self { entries }
    }

    pub fn is_configured(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn contains(&self, group_id: Option<&str>) -> bool {
        self.entries.contains_key(Self::WILDCARD)
            || group_id.is_some_and(|id| self.entries.contains_key(id.trim()))
    }

    /// Exact entry first, then the `"*"` default.
    pub fn lookup(&self, group_id: Option<&str>) -> Option<&T> {
        group_id
            .and_then(|id| self.entries.get(id.trim()))
            .or_else(|| self.entries.get(Self::WILDCARD))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn allows_group(&self, policy: GroupPolicy, group_id: Option<&str>) -> bool {
        evaluate(policy, self.is_configured(), self.contains(group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table_holds_for_every_triple() {
        for configured in [false, true] {
            for candidate in [false, true] {
                assert!(evaluate(GroupPolicy::Open, configured, candidate));
                assert!(!evaluate(GroupPolicy::Disabled, configured, candidate));
            }
        }
        assert!(!evaluate(GroupPolicy::Allowlist, false, false));
        assert!(!evaluate(GroupPolicy::Allowlist, false, true));
        assert!(!evaluate(GroupPolicy::Allowlist, true, false));
        assert!(evaluate(GroupPolicy::Allowlist, true, true));
    }

    #[test]
    fn table_lookup_prefers_exact_entry() {
        let table = GroupTable::new(HashMap::from([
            ("*".to_string(), false),
            (" 1203@g.us ".to_string(), true),
        ]));
        assert_eq!(table.lookup(Some("1203@g.us")), Some(&true));
        assert_eq!(table.lookup(Some("other")), Some(&false));
        assert_eq!(table.lookup(None), Some(&false));
        assert!(table.contains(Some("anything")));
    }

    #[test]
    fn empty_table_is_unconfigured() {
        let table: GroupTable<()> = GroupTable::default();
        assert!(!table.is_configured());
        assert!(!table.allows_group(GroupPolicy::Allowlist, Some("g")));
        assert!(table.allows_group(GroupPolicy::Open, Some("g")));
    }

    #[test]
    fn policy_parses_lowercase() {
        let policy: GroupPolicy = serde_json::from_str("\"disabled\"").expect("parse");
        assert_eq!(policy, GroupPolicy::Disabled);
        assert_eq!(GroupPolicy::default(), GroupPolicy::Allowlist);
    }
}
