//! Switchboard configuration loader.
//!
//! Keys are snake_case; the camelCase spellings used by other gateways are
//! accepted as aliases so existing config files keep working.

use sb_channels::{CanonicalInboundEvent, SessionKey, Surface};
use sb_dispatch::{
    DispatcherConfig, DropPolicy, QueueMode, QueueSettings, ReplyToMode, SessionScope,
};
use sb_policy::{
    Allowlist, AuthorizationGate, AuthorizationVerdict, ControlCommands, GroupPolicy,
    GroupSettings, GroupTable, MentionPatterns, SurfacePolicy,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: SurfaceConfig,
    #[serde(default)]
    pub telegram: SurfaceConfig,
    #[serde(default)]
    pub discord: SurfaceConfig,
    #[serde(default)]
    pub slack: SurfaceConfig,
    #[serde(default)]
    pub signal: SurfaceConfig,
    #[serde(default)]
    pub imessage: SurfaceConfig,
}

impl ChannelsConfig {
    pub fn get(&self, surface: Surface) -> &SurfaceConfig {
        match surface {
            Surface::Whatsapp => &self.whatsapp,
            Surface::Telegram => &self.telegram,
            Surface::Discord => &self.discord,
            Surface::Slack => &self.slack,
            Surface::Signal => &self.signal,
            Surface::Imessage => &self.imessage,
        }
    }

    pub fn enabled(&self) -> Vec<Surface> {
        Surface::ALL
            .into_iter()
            .filter(|surface| self.get(*surface).enabled)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "groupPolicy")]
    pub group_policy: GroupPolicy,
    /// Senders allowed in direct chats. Empty admits everyone.
    #[serde(default, alias = "allowFrom")]
    pub allow_from: Vec<String>,
    /// Senders allowed inside groups. Empty falls back to `allow_from`, so with both
    /// lists empty any member of an admitted group passes; `group_policy` and
    /// `groups` decide which groups are admitted.
    #[serde(default, alias = "groupAllowFrom")]
    pub group_allow_from: Vec<String>,
    /// Surface-wide default; `groups.<id>.require_mention` and `groups."*"` override it.
    #[serde(default = "default_require_mention", alias = "requireMention")]
    pub require_mention: bool,
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
    #[serde(default, alias = "replyToMode")]
    pub reply_to_mode: ReplyToMode,
    #[serde(default, alias = "textChunkLimit")]
    pub text_chunk_limit: Option<usize>,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_policy: GroupPolicy::default(),
            allow_from: Vec::new(),
            group_allow_from: Vec::new(),
            require_mention: default_require_mention(),
            groups: HashMap::new(),
            reply_to_mode: ReplyToMode::default(),
            text_chunk_limit: None,
        }
    }
}

fn default_require_mention() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupConfig {
    #[serde(default, alias = "requireMention")]
    pub require_mention: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default, alias = "groupChat")]
    pub group_chat: GroupChatConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupChatConfig {
    #[serde(default, alias = "mentionPatterns")]
    pub mention_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub mode: QueueMode,
    /// Keyed by surface name; resolved when a session is created.
    #[serde(default, alias = "bySurface")]
    pub by_surface: HashMap<String, QueueMode>,
    #[serde(default = "default_debounce_ms", alias = "debounceMs")]
    pub debounce_ms: u64,
    #[serde(default = "default_queue_cap")]
    pub cap: usize,
    #[serde(default)]
    pub drop: DropPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            by_surface: HashMap::new(),
            debounce_ms: default_debounce_ms(),
            cap: default_queue_cap(),
            drop: DropPolicy::default(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    sb_dispatch::queue::DEFAULT_DEBOUNCE_MS
}

fn default_queue_cap() -> usize {
    sb_dispatch::queue::DEFAULT_CAP
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub scope: SessionScope,
    #[serde(default = "default_main_key", alias = "mainKey")]
    pub main_key: String,
    /// Last-route store. Default: `~/.switchboard/data/last_route.json`.
    #[serde(default, alias = "storePath")]
    pub store_path: Option<String>,
    /// Idle session actors exit after this many seconds; 0 keeps them until `/new`.
    #[serde(default = "default_idle_retention_secs", alias = "idleRetentionSecs")]
    pub idle_retention_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scope: SessionScope::default(),
            main_key: default_main_key(),
            store_path: None,
            idle_retention_secs: default_idle_retention_secs(),
        }
    }
}

fn default_main_key() -> String {
    "main".to_string()
}

fn default_idle_retention_secs() -> u64 {
    sb_dispatch::dispatcher::DEFAULT_IDLE_RETENTION.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_concurrent", alias = "maxConcurrent")]
    pub max_concurrent: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    sb_dispatch::dispatcher::DEFAULT_MAX_CONCURRENT
}

/// Per-surface policy and delivery settings, normalized once at load.
#[derive(Debug, Clone, Default)]
pub struct SurfaceRuntime {
    pub policy: SurfacePolicy,
    pub reply_to_mode: ReplyToMode,
    pub text_chunk_limit: Option<usize>,
}

/// Everything the gateway needs, compiled from `SwitchboardConfig`.
#[derive(Debug, Clone)]
pub struct RuntimePolicy {
    pub surfaces: HashMap<Surface, SurfaceRuntime>,
    pub mention_patterns: MentionPatterns,
    pub scope: SessionScope,
    pub main_key: SessionKey,
    pub dispatcher: DispatcherConfig,
}

impl RuntimePolicy {
    pub fn surface(&self, surface: Surface) -> Option<&SurfaceRuntime> {
        self.surfaces.get(&surface)
    }

    pub fn evaluate(
        &self,
        event: &CanonicalInboundEvent,
        group_id: Option<&str>,
        commands: &dyn ControlCommands,
    ) -> AuthorizationVerdict {
        let fallback = SurfacePolicy::default();
        let policy = self
            .surface(event.surface)
            .map(|runtime| &runtime.policy)
            .unwrap_or(&fallback);
        AuthorizationGate::new(policy, &self.mention_patterns, commands).evaluate(event, group_id)
    }
}

impl SwitchboardConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: SwitchboardConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("SWITCHBOARD_QUEUE_MODE") {
            self.routing.queue.mode = v
                .parse()
                .map_err(|e| anyhow::anyhow!("SWITCHBOARD_QUEUE_MODE: {e}"))?;
        }
        if let Some(v) = var("SWITCHBOARD_MAX_CONCURRENT") {
            self.agent.max_concurrent = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("SWITCHBOARD_MAX_CONCURRENT={v:?}: {e}"))?;
        }
        if let Some(v) = var("SWITCHBOARD_MAIN_KEY") {
            self.session.main_key = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.routing.queue.cap == 0 {
            return Err(anyhow::anyhow!("routing.queue.cap must be > 0"));
        }
        if self.agent.max_concurrent == 0 {
            return Err(anyhow::anyhow!("agent.max_concurrent must be > 0"));
        }
        let main_key = self.session.main_key.trim();
        if main_key.is_empty() {
            return Err(anyhow::anyhow!("session.main_key is required"));
        }
        // Group session keys are `surface:chat_type:from`; a colon-free main key can never collide.
        if main_key.contains(':') {
            return Err(anyhow::anyhow!(
                "session.main_key must not contain ':' (got {main_key:?})"
            ));
        }
        for surface in Surface::ALL {
            if self.channels.get(surface).text_chunk_limit == Some(0) {
                return Err(anyhow::anyhow!(
                    "channels.{surface}.text_chunk_limit must be > 0"
                ));
            }
        }
        self.compile().map(|_| ())
    }

    /// Normalize allowlists, compile mention patterns and resolve queue overrides.
    pub fn compile(&self) -> anyhow::Result<RuntimePolicy> {
        let mut surfaces = HashMap::new();
        for surface in Surface::ALL {
            let cfg = self.channels.get(surface);
            let allow_from = Allowlist::new(&cfg.allow_from)
                .map_err(|e| anyhow::anyhow!("channels.{surface}.allow_from: {e}"))?;
            let group_allow_from = Allowlist::new(&cfg.group_allow_from)
                .map_err(|e| anyhow::anyhow!("channels.{surface}.group_allow_from: {e}"))?;
            let groups = GroupTable::new(
                cfg.groups
                    .iter()
                    .map(|(id, group)| {
                        (
                            id.clone(),
                            GroupSettings {
                                require_mention: group.require_mention,
                            },
                        )
                    })
                    .collect(),
            );
            surfaces.insert(
                surface,
                SurfaceRuntime {
                    policy: SurfacePolicy {
                        group_policy: cfg.group_policy,
                        allow_from,
                        group_allow_from,
                        require_mention: cfg.require_mention,
                        groups,
                    },
                    reply_to_mode: cfg.reply_to_mode,
                    text_chunk_limit: cfg.text_chunk_limit,
                },
            );
        }

        let mention_patterns = MentionPatterns::compile(&self.routing.group_chat.mention_patterns)
            .map_err(|e| anyhow::anyhow!("routing.group_chat.mention_patterns: {e}"))?;

        let mut by_surface = HashMap::new();
        for (name, mode) in &self.routing.queue.by_surface {
            let surface: Surface = name
                .parse()
                .map_err(|e| anyhow::anyhow!("routing.queue.by_surface: {e}"))?;
            by_surface.insert(surface, *mode);
        }

        let queue = &self.routing.queue;
        let dispatcher = DispatcherConfig {
            queue: QueueSettings {
                mode: queue.mode,
                debounce: Duration::from_millis(queue.debounce_ms),
                cap: queue.cap,
                drop: queue.drop,
            },
            by_surface,
            max_concurrent: self.agent.max_concurrent,
            idle_retention: (self.session.idle_retention_secs > 0)
                .then(|| Duration::from_secs(self.session.idle_retention_secs)),
        };

        Ok(RuntimePolicy {
            surfaces,
            mention_patterns,
            scope: self.session.scope,
            main_key: SessionKey::new(self.session.main_key.trim()),
            dispatcher,
        })
    }

    pub fn last_route_path(&self) -> anyhow::Result<PathBuf> {
        match self.session.store_path.as_deref() {
            Some(path) => expand_home(path),
            None => Ok(default_data_dir().join("last_route.json")),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".switchboard").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".switchboard").join("data")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sb_channels::{ChatType, MessageId, SenderId};

    const SAMPLE: &str = r#"
[channels.whatsapp]
enabled = true
allowFrom = ["+15550001111"]
groupPolicy = "allowlist"

[channels.whatsapp.groups."1203@g.us"]
requireMention = false

[channels.discord]
enabled = true
group_policy = "open"
allow_from = ["*"]
reply_to_mode = "all"
text_chunk_limit = 1800

[routing.groupChat]
mentionPatterns = ["@?switchboard"]

[routing.queue]
mode = "steer+backlog"
bySurface = { discord = "queue" }
debounceMs = 250
cap = 5
drop = "old"

[session]
scope = "per-sender"
mainKey = "owner"

[agent]
maxConcurrent = 2
"#;

    fn parse(raw: &str) -> SwitchboardConfig {
        toml::from_str(raw).expect("parse config")
    }

    fn event(surface: Surface, chat_type: ChatType, sender: &str) -> CanonicalInboundEvent {
        CanonicalInboundEvent {
            surface,
            from: sender.to_string(),
            to: String::new(),
            chat_type,
            sender_id: SenderId::new(sender),
            sender_name: None,
            sender_tag: None,
            group_id: None,
            group_subject: None,
            body: "hello".to_string(),
            was_mentioned: None,
            has_mention_entities: false,
            media: vec![],
            message_id: MessageId::new("1"),
            timestamp: Utc::now(),
        }
    }

    fn no_commands(_: &str) -> bool {
        false
    }

    #[test]
    fn camel_case_aliases_and_defaults() {
        let cfg = parse(SAMPLE);
        cfg.validate().expect("valid");
        assert_eq!(cfg.channels.enabled(), vec![Surface::Whatsapp, Surface::Discord]);
        assert_eq!(cfg.routing.queue.mode, QueueMode::SteerBacklog);
        assert_eq!(cfg.session.main_key, "owner");
        assert!(cfg.channels.telegram.require_mention);
        assert_eq!(cfg.channels.telegram.group_policy, GroupPolicy::Allowlist);

        let policy = cfg.compile().expect("compile");
        assert_eq!(policy.dispatcher.mode_for(Surface::Discord), QueueMode::Queue);
        assert_eq!(policy.dispatcher.mode_for(Surface::Whatsapp), QueueMode::SteerBacklog);
        assert_eq!(policy.dispatcher.queue.debounce, Duration::from_millis(250));
        assert_eq!(policy.dispatcher.max_concurrent, 2);
        assert_eq!(policy.mention_patterns.len(), 1);
        let discord = policy.surface(Surface::Discord).expect("discord");
        assert_eq!(discord.reply_to_mode, ReplyToMode::All);
        assert_eq!(discord.text_chunk_limit, Some(1800));
    }

    #[test]
    fn compiled_policy_evaluates_events() {
        let policy = parse(SAMPLE).compile().expect("compile");
        let ok = policy.evaluate(
            &event(Surface::Whatsapp, ChatType::Direct, "+15550001111"),
            None,
            &no_commands,
        );
        assert!(ok.accepted());
        let denied = policy.evaluate(
            &event(Surface::Whatsapp, ChatType::Direct, "+15550002222"),
            None,
            &no_commands,
        );
        assert!(!denied.accepted());

        let listed_group = policy.evaluate(
            &event(Surface::Whatsapp, ChatType::Group, "+15550001111"),
            Some("1203@g.us"),
            &no_commands,
        );
        assert!(listed_group.accepted());
        let other_group = policy.evaluate(
            &event(Surface::Whatsapp, ChatType::Group, "+15550001111"),
            Some("999@g.us"),
            &no_commands,
        );
        assert!(!other_group.group_allowed);
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = parse(SAMPLE);
        cfg.apply_overrides(|key| match key {
            "SWITCHBOARD_QUEUE_MODE" => Some("interrupt".to_string()),
            "SWITCHBOARD_MAX_CONCURRENT" => Some(" 8 ".to_string()),
            "SWITCHBOARD_MAIN_KEY" => Some("   ".to_string()),
            _ => None,
        })
        .expect("overrides");
        assert_eq!(cfg.routing.queue.mode, QueueMode::Interrupt);
        assert_eq!(cfg.agent.max_concurrent, 8);
        assert_eq!(cfg.session.main_key, "owner");

        let err = cfg
            .apply_overrides(|key| (key == "SWITCHBOARD_QUEUE_MODE").then(|| "later".to_string()))
            .expect_err("bad mode");
        assert!(err.to_string().contains("SWITCHBOARD_QUEUE_MODE"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = SwitchboardConfig::default();
        cfg.validate().expect("defaults are valid");

        cfg.routing.queue.cap = 0;
        assert!(cfg.validate().is_err());
        cfg.routing.queue.cap = 3;

        cfg.session.main_key = "telegram:group:x".to_string();
        assert!(cfg.validate().is_err());
        cfg.session.main_key = "main".to_string();

        cfg.routing.group_chat.mention_patterns = vec!["(".to_string()];
        let err = cfg.validate().expect_err("bad regex");
        assert!(err.to_string().contains("mention_patterns"));
        cfg.routing.group_chat.mention_patterns.clear();

        cfg.routing.queue.by_surface.insert("irc".to_string(), QueueMode::Queue);
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, SAMPLE).await.expect("write");
        let (cfg, loaded_from) = SwitchboardConfig::load_with_path(Some(path.clone()))
            .await
            .expect("load");
        assert_eq!(loaded_from, path);
        assert!(cfg.channels.discord.enabled);

        let missing = SwitchboardConfig::load(Some(dir.path().join("nope.toml"))).await;
        assert!(missing.is_err());
    }
}
