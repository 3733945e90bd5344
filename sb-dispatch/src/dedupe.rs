use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_DEDUPE_ENTRIES: usize = 5000;
pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(20 * 60);

#[derive(Default)]
struct DedupeState {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

/// Recently seen inbound message keys, bounded by count and age.
pub struct DedupeCache {
    state: Mutex<DedupeState>,
    max_entries: usize,
    ttl: Duration,
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_ENTRIES, DEFAULT_DEDUPE_TTL)
    }
}

impl DedupeCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(DedupeState::default()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Returns `true` the first time a key is seen within the window.
    pub fn check_and_insert(&self, key: &str) -> bool {
        self.check_and_insert_at(key, Instant::now())
    }

    fn check_and_insert_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.evict(&mut state, now);

        if state
            .seen
            .get(key)
            .is_some_and(|seen_at| now.duration_since(*seen_at) < self.ttl)
        {
            return false;
        }
        state.seen.insert(key.to_string(), now);
        state.order.push_back((key.to_string(), now));
        true
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, state: &mut DedupeState, now: Instant) {
        while let Some((key, inserted)) = state.order.front() {
            let expired = now.duration_since(*inserted) >= self.ttl;
            if !expired && state.seen.len() < self.max_entries {
                break;
            }
            // Only drop the map entry if it still belongs to this queue slot.
            if state.seen.get(key) == Some(inserted) {
                state.seen.remove(key);
            }
            state.order.pop_front();
        }
    }
}
