//! Per-session dispatch queue state machine.
//!
//! Pure state: the owning session actor feeds it arrivals, run completions and
//! the clock, and acts on what it returns. Nothing here spawns or sleeps.

use crate::error::DispatchError;
use sb_channels::{CanonicalInboundEvent, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use tokio::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_CAP: usize = 20;

const SUMMARY_HEADER: &str = "[Queue overflow] Earlier messages, summarized:";
const SUMMARY_LINE_CHARS: usize = 160;

/// How an event that arrives during a running turn is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    Interrupt,
    Steer,
    Followup,
    #[default]
    Collect,
    /// Steer while the running turn takes live input; otherwise backlog followup-style.
    /// The event reaches the agent exactly once.
    #[serde(alias = "steer+backlog", alias = "steer_backlog")]
    SteerBacklog,
    Queue,
}

impl QueueMode {
    pub const ALL: [QueueMode; 6] = [
        QueueMode::Interrupt,
        QueueMode::Steer,
        QueueMode::Followup,
        QueueMode::Collect,
        QueueMode::SteerBacklog,
        QueueMode::Queue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Steer => "steer",
            Self::Followup => "followup",
            Self::Collect => "collect",
            Self::SteerBacklog => "steer-backlog",
            Self::Queue => "queue",
        }
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueMode {
    type Err = DispatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interrupt" => Ok(Self::Interrupt),
            "steer" => Ok(Self::Steer),
            "followup" | "follow-up" => Ok(Self::Followup),
            "collect" => Ok(Self::Collect),
            "steer-backlog" | "steer+backlog" | "steer_backlog" => Ok(Self::SteerBacklog),
            "queue" => Ok(Self::Queue),
            other => Err(DispatchError::UnknownQueueMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    Old,
    New,
    #[default]
    Summarize,
}

impl DropPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Old => "old",
            Self::New => "new",
            Self::Summarize => "summarize",
        }
    }
}

impl fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DropPolicy {
    type Err = DispatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "old" => Ok(Self::Old),
            "new" => Ok(Self::New),
            "summarize" => Ok(Self::Summarize),
            other => Err(DispatchError::UnknownDropPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub mode: QueueMode,
    pub debounce: Duration,
    pub cap: usize,
    pub drop: DropPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            cap: DEFAULT_CAP,
            drop: DropPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    /// Work is pending and waiting on the debounce deadline or a concurrency slot.
    Queued,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Queued => "queued",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What overflow handling discarded or merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dropped {
    Oldest(MessageId),
    Incoming(MessageId),
    Summarized(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The session was idle; start a run once a concurrency slot is free.
    Ready,
    /// Cancel the running turn; the new event is already in the backlog.
    Interrupt,
    /// Inject into the running turn's live input.
    Steer(CanonicalInboundEvent),
    Enqueued(Option<Dropped>),
}

#[derive(Debug, Clone)]
pub struct SessionQueue {
    settings: QueueSettings,
    phase: Phase,
    backlog: VecDeque<CanonicalInboundEvent>,
    debounce_deadline: Option<Instant>,
    last_arrival: Option<Instant>,
}

impl SessionQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            phase: Phase::Idle,
            backlog: VecDeque::new(),
            debounce_deadline: None,
            last_arrival: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mode(&self) -> QueueMode {
        self.settings.mode
    }

    pub fn set_mode(&mut self, mode: QueueMode) {
        self.settings.mode = mode;
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn backlog(&self) -> impl Iterator<Item = &CanonicalInboundEvent> {
        self.backlog.iter()
    }

    pub fn debounce_deadline(&self) -> Option<Instant> {
        self.debounce_deadline
    }

    pub fn on_event(&mut self, event: CanonicalInboundEvent, now: Instant) -> Admission {
        self.last_arrival = Some(now);
        match self.phase {
            Phase::Idle => {
                self.backlog.push_back(event);
                self.phase = Phase::Queued;
                self.debounce_deadline = None;
                Admission::Ready
            }
            Phase::Queued => {
                if self.settings.mode == QueueMode::Collect {
                    self.debounce_deadline = Some(now + self.settings.debounce);
                }
                Admission::Enqueued(self.push_backlog(event))
            }
            Phase::Running => match self.settings.mode {
                QueueMode::Interrupt => {
                    self.push_backlog(event);
                    Admission::Interrupt
                }
                QueueMode::Steer | QueueMode::SteerBacklog => Admission::Steer(event),
                QueueMode::Followup | QueueMode::Collect | QueueMode::Queue => {
                    Admission::Enqueued(self.push_backlog(event))
                }
            },
        }
    }

    /// The running turn no longer takes live input; the event waits for a followup run.
    pub fn on_steer_rejected(&mut self, event: CanonicalInboundEvent) -> Option<Dropped> {
        self.push_backlog(event)
    }

    pub fn on_run_finished(&mut self, now: Instant) {
        self.debounce_deadline = None;
        if self.backlog.is_empty() {
            self.phase = Phase::Idle;
            return;
        }
        self.phase = Phase::Queued;
        if self.settings.mode == QueueMode::Collect {
            self.debounce_deadline = self
                .last_arrival
                .map(|arrived| arrived + self.settings.debounce)
                .filter(|deadline| *deadline > now);
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.phase == Phase::Queued
            && !self.backlog.is_empty()
            && self.debounce_deadline.is_none_or(|deadline| now >= deadline)
    }

    /// Events for the next run. `queue` mode takes one event; every other mode takes the
    /// whole backlog.
    pub fn take_ready(&mut self, now: Instant) -> Option<Vec<CanonicalInboundEvent>> {
        if !self.is_ready(now) {
            return None;
        }
        let events: Vec<_> = match self.settings.mode {
            QueueMode::Queue => self.backlog.pop_front().into_iter().collect(),
            _ => self.backlog.drain(..).collect(),
        };
        self.phase = Phase::Running;
        self.debounce_deadline = None;
        Some(events)
    }

    /// Discard pending work. Returns how many events were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.backlog.len();
        self.backlog.clear();
        self.debounce_deadline = None;
        if self.phase == Phase::Queued {
            self.phase = Phase::Idle;
        }
        dropped
    }

    fn push_backlog(&mut self, event: CanonicalInboundEvent) -> Option<Dropped> {
        let cap = self.settings.cap.max(1);
        if self.backlog.len() < cap {
            self.backlog.push_back(event);
            return None;
        }
        match self.settings.drop {
            DropPolicy::Old => {
                let oldest = self.backlog.pop_front();
                self.backlog.push_back(event);
                oldest.map(|oldest| Dropped::Oldest(oldest.message_id))
            }
            DropPolicy::New => Some(Dropped::Incoming(event.message_id)),
            DropPolicy::Summarize => {
                let mut pending: Vec<_> = self.backlog.drain(..).collect();
                let summarized = pending.len();
                // With a single slot the incoming event has to join the summary.
                let incoming = if cap == 1 {
                    pending.push(event);
                    None
                } else {
                    Some(event)
                };
                self.backlog.extend(summarize(pending));
                self.backlog.extend(incoming);
                Some(Dropped::Summarized(summarized))
            }
        }
    }
}

pub fn is_summary(event: &CanonicalInboundEvent) -> bool {
    event.body.starts_with(SUMMARY_HEADER)
}

/// Collapse entries into one synthetic event that carries the newest entry's origin.
fn summarize(entries: Vec<CanonicalInboundEvent>) -> Option<CanonicalInboundEvent> {
    let mut lines = Vec::new();
    let mut newest = None;
    for entry in entries {
        if let Some(previous) = entry.body.strip_prefix(SUMMARY_HEADER) {
            lines.extend(
                previous
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(str::to_string),
            );
        } else {
            lines.push(format!(
                "- {}: {}",
                entry.sender_label(),
                one_line(&entry.body, SUMMARY_LINE_CHARS)
            ));
        }
        newest = Some(entry);
    }
    let mut summary = newest?;
    summary.body = format!("{SUMMARY_HEADER}\n{}", lines.join("\n"));
    summary.media.clear();
    Some(summary)
}

fn one_line(body: &str, max_chars: usize) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sb_channels::{ChatType, SenderId, Surface};

    fn event(n: usize) -> CanonicalInboundEvent {
        CanonicalInboundEvent {
            surface: Surface::Telegram,
            from: "user:42".to_string(),
            to: String::new(),
            chat_type: ChatType::Direct,
            sender_id: SenderId::new("42"),
            sender_name: Some("Ada".to_string()),
            sender_tag: None,
            group_id: None,
            group_subject: None,
            body: format!("message {n}"),
            was_mentioned: None,
            has_mention_entities: false,
            media: vec![],
            message_id: MessageId::new(n.to_string()),
            timestamp: Utc::now(),
        }
    }

    fn settings(mode: QueueMode, cap: usize, drop: DropPolicy) -> QueueSettings {
        QueueSettings {
            mode,
            debounce: Duration::from_millis(500),
            cap,
            drop,
        }
    }

    fn running_queue(settings: QueueSettings, now: Instant) -> SessionQueue {
        let mut queue = SessionQueue::new(settings);
        assert_eq!(queue.on_event(event(0), now), Admission::Ready);
        assert!(queue.take_ready(now).is_some());
        assert_eq!(queue.phase(), Phase::Running);
        queue
    }

    fn backlog_ids(queue: &SessionQueue) -> Vec<String> {
        queue
            .backlog()
            .map(|event| event.message_id.to_string())
            .collect()
    }

    #[test]
    fn drop_old_keeps_most_recent_cap_entries() {
        let now = Instant::now();
        let cap = 3;
        let mut queue = running_queue(settings(QueueMode::Followup, cap, DropPolicy::Old), now);
        for n in 1..=cap + 5 {
            queue.on_event(event(n), now);
        }
        assert_eq!(queue.backlog_len(), cap);
        assert_eq!(backlog_ids(&queue), vec!["6", "7", "8"]);
    }

    #[test]
    fn drop_new_keeps_first_cap_entries() {
        let now = Instant::now();
        let cap = 3;
        let mut queue = running_queue(settings(QueueMode::Followup, cap, DropPolicy::New), now);
        let mut rejected = 0;
        for n in 1..=cap + 5 {
            if let Admission::Enqueued(Some(Dropped::Incoming(_))) = queue.on_event(event(n), now) {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 5);
        assert_eq!(backlog_ids(&queue), vec!["1", "2", "3"]);
    }

    #[test]
    fn summarize_collapses_backlog_then_appends() {
        let now = Instant::now();
        let mut queue =
            running_queue(settings(QueueMode::Followup, 2, DropPolicy::Summarize), now);
        queue.on_event(event(1), now);
        queue.on_event(event(2), now);
        let admission = queue.on_event(event(3), now);
        assert_eq!(admission, Admission::Enqueued(Some(Dropped::Summarized(2))));
        assert_eq!(queue.backlog_len(), 2);

        let entries: Vec<_> = queue.backlog().cloned().collect();
        assert!(is_summary(&entries[0]));
        assert!(entries[0].body.contains("- Ada: message 1"));
        assert!(entries[0].body.contains("- Ada: message 2"));
        assert_eq!(entries[0].message_id.as_str(), "2");
        assert_eq!(entries[1].body, "message 3");

        // A second overflow folds the earlier summary lines in.
        queue.on_event(event(4), now);
        let entries: Vec<_> = queue.backlog().cloned().collect();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].body.contains("message 1"));
        assert!(entries[0].body.contains("message 3"));
        assert_eq!(entries[0].body.matches(SUMMARY_HEADER).count(), 1);
        assert_eq!(entries[1].body, "message 4");
    }

    #[test]
    fn summarize_with_single_slot_folds_incoming() {
        let now = Instant::now();
        let mut queue =
            running_queue(settings(QueueMode::Followup, 1, DropPolicy::Summarize), now);
        queue.on_event(event(1), now);
        queue.on_event(event(2), now);
        assert_eq!(queue.backlog_len(), 1);
        let only = queue.backlog().next().cloned().expect("summary");
        assert!(is_summary(&only));
        assert!(only.body.contains("message 2"));
    }

    #[test]
    fn followup_drains_whole_backlog_after_run() {
        let now = Instant::now();
        let mut queue = running_queue(settings(QueueMode::Followup, 10, DropPolicy::Old), now);
        queue.on_event(event(1), now);
        queue.on_event(event(2), now);
        assert!(queue.take_ready(now).is_none());

        queue.on_run_finished(now);
        assert_eq!(queue.phase(), Phase::Queued);
        let events = queue.take_ready(now).expect("ready");
        assert_eq!(events.len(), 2);
        assert_eq!(queue.backlog_len(), 0);

        queue.on_run_finished(now);
        assert_eq!(queue.phase(), Phase::Idle);
    }

    #[test]
    fn queue_mode_runs_one_event_at_a_time() {
        let now = Instant::now();
        let mut queue = running_queue(settings(QueueMode::Queue, 10, DropPolicy::Old), now);
        queue.on_event(event(1), now);
        queue.on_event(event(2), now);
        queue.on_run_finished(now);
        let first = queue.take_ready(now).expect("first");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_id.as_str(), "1");
        queue.on_run_finished(now);
        let second = queue.take_ready(now).expect("second");
        assert_eq!(second[0].message_id.as_str(), "2");
    }

    #[test]
    fn collect_waits_for_quiet_period() {
        let start = Instant::now();
        let mut queue = running_queue(settings(QueueMode::Collect, 10, DropPolicy::Old), start);
        let arrival = start + Duration::from_millis(100);
        queue.on_event(event(1), arrival);

        let finished = start + Duration::from_millis(200);
        queue.on_run_finished(finished);
        assert_eq!(queue.phase(), Phase::Queued);
        assert_eq!(
            queue.debounce_deadline(),
            Some(arrival + Duration::from_millis(500))
        );
        assert!(queue.take_ready(finished).is_none());

        // A new arrival while queued pushes the deadline forward.
        let late = start + Duration::from_millis(550);
        queue.on_event(event(2), late);
        assert!(!queue.is_ready(arrival + Duration::from_millis(500)));
        let events = queue
            .take_ready(late + Duration::from_millis(500))
            .expect("ready after quiet period");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn collect_after_long_run_starts_immediately() {
        let start = Instant::now();
        let mut queue = running_queue(settings(QueueMode::Collect, 10, DropPolicy::Old), start);
        queue.on_event(event(1), start);
        let finished = start + Duration::from_secs(5);
        queue.on_run_finished(finished);
        assert!(queue.is_ready(finished));
    }

    #[test]
    fn interrupt_backlogs_the_new_event() {
        let now = Instant::now();
        let mut queue = running_queue(settings(QueueMode::Interrupt, 10, DropPolicy::Old), now);
        assert_eq!(queue.on_event(event(1), now), Admission::Interrupt);
        queue.on_run_finished(now);
        let events = queue.take_ready(now).expect("ready");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body, "message 1");
    }

    #[test]
    fn steer_falls_back_to_backlog_when_rejected() {
        let now = Instant::now();
        let mut queue = running_queue(settings(QueueMode::Steer, 10, DropPolicy::Old), now);
        let Admission::Steer(event) = queue.on_event(event(1), now) else {
            panic!("expected steer");
        };
        assert_eq!(queue.backlog_len(), 0);
        queue.on_steer_rejected(event);
        assert_eq!(queue.backlog_len(), 1);
    }

    #[test]
    fn steer_backlog_backlogs_only_rejected_events() {
        let now = Instant::now();
        let mut queue =
            running_queue(settings(QueueMode::SteerBacklog, 10, DropPolicy::Old), now);
        let Admission::Steer(_) = queue.on_event(event(1), now) else {
            panic!("expected steer");
        };
        assert_eq!(queue.backlog_len(), 0);

        let Admission::Steer(rejected) = queue.on_event(event(2), now) else {
            panic!("expected steer");
        };
        assert_eq!(queue.on_steer_rejected(rejected), None);
        assert_eq!(queue.backlog_len(), 1);
        queue.on_run_finished(now);
        let events = queue.take_ready(now).expect("ready");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body, "message 2");
    }

    #[test]
    fn mode_parsing_accepts_aliases() {
        assert_eq!("steer+backlog".parse::<QueueMode>().ok(), Some(QueueMode::SteerBacklog));
        assert_eq!("Steer-Backlog".parse::<QueueMode>().ok(), Some(QueueMode::SteerBacklog));
        let parsed: QueueMode = serde_json::from_str("\"steer+backlog\"").expect("serde alias");
        assert_eq!(parsed, QueueMode::SteerBacklog);
        assert!("later".parse::<QueueMode>().is_err());
        assert_eq!("OLD".parse::<DropPolicy>().ok(), Some(DropPolicy::Old));
    }

    #[test]
    fn one_line_truncates_long_bodies() {
        let long = "word ".repeat(100);
        let line = one_line(&long, 20);
        assert_eq!(line.chars().count(), 20);
        assert!(line.ends_with('…'));
        assert_eq!(one_line("a\n  b", 20), "a b");
    }
}
