//! Identity/allowlist matching across heterogeneous addressing schemes.
//!
//! Entries are normalized once when the `Allowlist` is built; the value is then
//! reused for every candidate check. Matching order is exact id, exact
//! lowercase name, then slug. There is no substring matching.

use crate::error::{PolicyError, Result};
use sb_channels::{CanonicalInboundEvent, Surface};

const WILDCARD: &str = "*";
const GENERIC_PREFIXES: [&str; 2] = ["user:", "channel:"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum AllowEntry {
    /// Numeric id, phone number, or an id lifted out of `<@123>` syntax.
    Id(String),
    /// Free-form entry: compared as an id first, then as a display name or handle.
    Text { id: String, name: String, slug: String },
}

/// The identity being checked. Any field may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subject<'a> {
    pub id: Option<&'a str>,
    pub name: Option<&'a str>,
    pub tag: Option<&'a str>,
}

impl<'a> Subject<'a> {
    pub fn id(id: &'a str) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn sender(event: &'a CanonicalInboundEvent) -> Self {
        Self {
            id: Some(event.sender_id.as_str()),
            name: event.sender_name.as_deref(),
            tag: event.sender_tag.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    wildcard: bool,
    entries: Vec<AllowEntry>,
}

impl Allowlist {
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for raw in entries {
            let raw = raw.as_ref();
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed == WILDCARD {
                list.wildcard = true;
                continue;
            }
            let entry = normalize_entry(trimmed)
                .ok_or_else(|| PolicyError::InvalidAllowEntry(raw.to_string()))?;
            if !list.entries.contains(&entry) {
                list.entries.push(entry);
            }
        }
        Ok(list)
    }

    pub fn is_empty(&self) -> bool {
        !self.wildcard && self.entries.is_empty()
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Membership test. Policy-agnostic: an empty list matches nobody.
    pub fn matches(&self, subject: &Subject<'_>) -> bool {
        if self.wildcard {
            return true;
        }
        if self.entries.is_empty() {
            return false;
        }

        if let Some(id) = subject.id.and_then(normalize_subject_id) {
            let id_hit = self.entries.iter().any(|entry| match entry {
                AllowEntry::Id(value) => *value == id,
                AllowEntry::Text { id: value, .. } => *value == id,
            });
            if id_hit {
                return true;
            }
        }

        let names: Vec<String> = [subject.name, subject.tag]
            .into_iter()
            .flatten()
            .map(|value| value.trim().trim_start_matches('@').to_lowercase())
            .filter(|value| !value.is_empty())
            .collect();
        if names.is_empty() {
            return false;
        }

        let name_hit = self.entries.iter().any(|entry| match entry {
            AllowEntry::Text { name, .. } => names.iter().any(|candidate| candidate == name),
            AllowEntry::Id(_) => false,
        });
        if name_hit {
            return true;
        }

        let slugs: Vec<String> = names
            .iter()
            .map(|name| slugify(name))
            .filter(|slug| !slug.is_empty())
            .collect();
        self.entries.iter().any(|entry| match entry {
            AllowEntry::Text { slug, .. } => {
                !slug.is_empty() && slugs.iter().any(|candidate| candidate == slug)
            }
            AllowEntry::Id(_) => false,
        })
    }

    /// Direct-chat sender check: an empty list allows everyone.
    pub fn allows(&self, subject: &Subject<'_>) -> bool {
        self.is_empty() || self.matches(subject)
    }
}

fn normalize_entry(raw: &str) -> Option<AllowEntry> {
    let stripped = strip_known_prefixes(raw);
    if stripped.is_empty() {
        return None;
    }

    if let Some(id) = mention_syntax_id(stripped) {
        return Some(AllowEntry::Id(id.to_lowercase()));
    }

    if let Some(phone) = collapse_phone_like(stripped) {
        return Some(AllowEntry::Id(phone));
    }

    let name = stripped.trim_start_matches('@').trim().to_lowercase();
    if name.is_empty() {
        return None;
    }
    Some(AllowEntry::Text {
        id: stripped.to_lowercase(),
        slug: slugify(&name),
        name,
    })
}

fn normalize_subject_id(raw: &str) -> Option<String> {
    let stripped = strip_known_prefixes(raw.trim());
    if stripped.is_empty() {
        return None;
    }
    if let Some(id) = mention_syntax_id(stripped) {
        return Some(id.to_lowercase());
    }
    Some(collapse_phone_like(stripped).unwrap_or_else(|| stripped.to_lowercase()))
}

/// Strips `telegram:`, `user:`, `channel:` (case-insensitive, repeated) from the front.
fn strip_known_prefixes(value: &str) -> &str {
    let mut rest = value.trim();
    loop {
        let before = rest.len();
        for prefix in Surface::ALL
            .iter()
            .map(|surface| surface.as_str())
            .chain(GENERIC_PREFIXES.iter().map(|p| p.trim_end_matches(':')))
        {
            rest = strip_prefix_ignore_case(rest, prefix)
                .and_then(|tail| tail.strip_prefix(':'))
                .map(str::trim_start)
                .unwrap_or(rest);
        }
        if rest.len() == before {
            return rest;
        }
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

/// `<@123>`, `<@!123>`, `<#123>` and Slack's `<@U123|alice>` all carry an id.
fn mention_syntax_id(value: &str) -> Option<&str> {
    let inner = value.strip_prefix('<')?.strip_suffix('>')?;
    let inner = inner
        .strip_prefix("@!")
        .or_else(|| inner.strip_prefix('@'))
        .or_else(|| inner.strip_prefix('#'))?;
    let id = inner.split('|').next().unwrap_or_default().trim();
    if id.is_empty() || !id.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return None;
    }
    Some(id)
}

/// `+1 (555) 000-1111` → `+15550001111`; plain numeric ids pass through.
fn collapse_phone_like(value: &str) -> Option<String> {
    let allowed = |ch: char| ch.is_ascii_digit() || matches!(ch, '+' | ' ' | '-' | '(' | ')' | '.');
    if !value.chars().all(allowed) {
        return None;
    }
    let plus = value.trim_start().starts_with('+');
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if plus {
        Some(format!("+{digits}"))
    } else {
        Some(digits)
    }
}

/// Lowercase, non-alphanumeric runs become a single `-`, no leading/trailing dashes.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Allowlist {
        Allowlist::new(entries.iter().copied()).expect("valid allowlist")
    }

    #[test]
    fn wildcard_matches_any_candidate() {
        let allow = list(&["*"]);
        assert!(allow.matches(&Subject::id("+15550002222")));
        assert!(allow.matches(&Subject::default()));
        let mixed = list(&["alice", "*"]);
        assert!(mixed.matches(&Subject::id("somebody-else")));
    }

    #[test]
    fn id_entry_matches_by_id_regardless_of_name() {
        let allow = list(&["123456"]);
        let subject = Subject {
            id: Some("123456"),
            name: Some("Completely Different"),
            tag: Some("@other"),
        };
        assert!(allow.matches(&subject));
        assert!(!allow.matches(&Subject {
            id: Some("654321"),
            name: Some("123456"),
            tag: None,
        }));
    }

    #[test]
    fn name_entry_matches_case_insensitively_and_by_slug() {
        let allow = list(&["Friends of Clawd"]);
        assert!(allow.matches(&Subject {
            id: Some("g-1"),
            name: Some("friends of clawd"),
            tag: None,
        }));
        assert!(allow.matches(&Subject {
            id: Some("g-1"),
            name: Some("friends-of-clawd"),
            tag: None,
        }));

        let slugged = list(&["friends-of-clawd"]);
        assert!(slugged.matches(&Subject {
            id: None,
            name: Some("Friends   of Clawd!"),
            tag: None,
        }));
    }

    #[test]
    fn no_partial_matches() {
        let allow = list(&["alice"]);
        assert!(!allow.matches(&Subject {
            id: Some("u-1"),
            name: Some("alice cooper"),
            tag: None,
        }));
        assert!(!allow.matches(&Subject::id("alice2")));
    }

    #[test]
    fn surface_and_kind_prefixes_are_stripped() {
        let allow = list(&["Telegram:user:42", "SLACK:U0123ABC", "channel:C999"]);
        assert!(allow.matches(&Subject::id("42")));
        assert!(allow.matches(&Subject::id("u0123abc")));
        assert!(allow.matches(&Subject::id("U0123ABC")));
        assert!(allow.matches(&Subject::id("channel:C999")));
    }

    #[test]
    fn structured_mention_syntax_yields_id() {
        let allow = list(&["<@!123>", "<@U77|bob>"]);
        assert!(allow.matches(&Subject::id("123")));
        assert!(allow.matches(&Subject::id("<@123>")));
        assert!(allow.matches(&Subject::id("U77")));
    }

    #[test]
    fn phone_formatting_is_collapsed() {
        let allow = list(&["+1 (555) 000-1111"]);
        assert!(allow.matches(&Subject::id("+15550001111")));
        assert!(allow.matches(&Subject::id("whatsapp:+1-555-000-1111")));
        assert!(!allow.matches(&Subject::id("+15550002222")));
    }

    #[test]
    fn handle_matches_name_entry() {
        let allow = list(&["@alice"]);
        assert!(allow.matches(&Subject {
            id: Some("99"),
            name: None,
            tag: Some("@Alice"),
        }));
    }

    #[test]
    fn empty_list_matches_nobody_but_allows_direct() {
        let allow = list(&[]);
        assert!(allow.is_empty());
        assert!(!allow.matches(&Subject::id("1")));
        assert!(allow.allows(&Subject::id("1")));

        let blank = list(&["", "   "]);
        assert!(blank.is_empty());
    }

    #[test]
    fn prefix_only_entry_is_rejected() {
        let err = Allowlist::new(["user:"]).expect_err("empty after prefix");
        assert!(matches!(err, PolicyError::InvalidAllowEntry(_)));
    }

    #[test]
    fn slugify_collapses_runs() {
        assert_eq!(slugify("Friends of Clawd"), "friends-of-clawd");
        assert_eq!(slugify("  --Ops__Team!! "), "ops-team");
        assert_eq!(slugify("!!!"), "");
    }
}
