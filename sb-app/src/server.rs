//! CLI entry points: config checks and offline replay through the full pipeline.

use crate::config::SwitchboardConfig;
use crate::dev_backends::EchoAgent;
use crate::gateway::Gateway;
use crate::last_route::LastRouteStore;
use anyhow::Result;
use sb_channels::{CanonicalInboundEvent, ChannelAdapter, LoopbackAdapter, Surface};
use sb_dispatch::route;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_CHANNEL_CAPACITY: usize = 256;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = SwitchboardConfig::load_with_path(config_path).await?;
    let policy = cfg.compile()?;
    let enabled: Vec<&str> = cfg
        .channels
        .enabled()
        .into_iter()
        .map(Surface::as_str)
        .collect();
    tracing::info!(
        config_path = %path.display(),
        channels = %enabled.join(","),
        queue_mode = %policy.dispatcher.queue.mode,
        queue_cap = policy.dispatcher.queue.cap,
        queue_drop = %policy.dispatcher.queue.drop,
        debounce_ms = policy.dispatcher.queue.debounce.as_millis() as u64,
        max_concurrent = policy.dispatcher.max_concurrent,
        session_scope = %policy.scope,
        main_key = %policy.main_key,
        mention_patterns = policy.mention_patterns.len(),
        "config ok"
    );

    let store = LastRouteStore::load(cfg.last_route_path()?).await?;
    match store.get(&policy.main_key).await {
        Some(route) => tracing::info!(
            path = %store.path().display(),
            channel = %route.channel,
            to = %route.to,
            updated_at = %route.updated_at,
            "last route"
        ),
        None => tracing::info!(path = %store.path().display(), "no last route recorded"),
    }
    Ok(())
}

/// Print the authorization verdict and session key for one canonical event.
pub async fn check(config_path: Option<PathBuf>, event_path: &Path) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path).await?;
    let policy = cfg.compile()?;
    let raw = tokio::fs::read_to_string(event_path)
        .await
        .map_err(|e| anyhow::anyhow!("read event {}: {e}", event_path.display()))?;
    let event: CanonicalInboundEvent = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parse event {}: {e}", event_path.display()))?;

    let grammar = crate::commands::SlashCommandGrammar;
    let group_id = LoopbackAdapter::new(event.surface).group_identity(&event);
    let verdict = policy.evaluate(&event, group_id.as_deref(), &grammar);
    let session_key = verdict
        .accepted()
        .then(|| route(policy.scope, &event, &policy.main_key));
    let command = verdict
        .command_authorized
        .then(|| grammar.parse(&event.body))
        .flatten()
        .map(|command| command.name());

    let report = serde_json::json!({
        "surface": event.surface,
        "message_id": event.message_id,
        "group_id": group_id,
        "verdict": verdict,
        "accepted": verdict.accepted(),
        "session_key": session_key,
        "command": command,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Feed a JSONL file of canonical events through loopback adapters and the echo
/// agent, then print every delivered send op as one JSON line.
pub async fn replay(config_path: Option<PathBuf>, events_path: &Path, latency: Duration) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path).await?;
    let policy = cfg.compile()?;
    let store = Arc::new(LastRouteStore::load(cfg.last_route_path()?).await?);

    let adapters: HashMap<Surface, LoopbackAdapter> = Surface::ALL
        .into_iter()
        .map(|surface| (surface, LoopbackAdapter::new(surface)))
        .collect();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let (issues_tx, mut issues_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let gateway = Arc::new(
        Gateway::new(
            policy,
            Arc::new(EchoAgent::new(latency)),
            adapters
                .values()
                .map(|adapter| Arc::new(adapter.clone()) as Arc<dyn ChannelAdapter>)
                .collect(),
            store,
            inbound_rx,
        )
        .with_delivery_issues(issues_tx),
    );
    let issues = tokio::spawn(async move {
        let mut failed_ops = 0usize;
        while let Some(issue) = issues_rx.recv().await {
            failed_ops += issue.failures.len();
        }
        failed_ops
    });
    gateway.start_adapters(inbound_tx).await?;
    let tasks = Arc::clone(&gateway).start();

    let shutdown = gateway.dispatcher().shutdown_token();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let raw = tokio::fs::read_to_string(events_path)
        .await
        .map_err(|e| anyhow::anyhow!("read events {}: {e}", events_path.display()))?;
    let mut pushed = 0usize;
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: CanonicalInboundEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%e, line = index + 1, "skipping malformed event");
                continue;
            }
        };
        let Some(adapter) = adapters.get(&event.surface) else {
            continue;
        };
        adapter.push(event).await?;
        pushed += 1;
    }
    for adapter in adapters.values() {
        adapter.close().await;
    }
    tracing::info!(pushed, "replay input exhausted");

    if let Err(e) = tasks.inbound.await {
        tracing::warn!(%e, "gateway loop task failed");
    }
    tokio::select! {
        () = gateway.wait_drained() => {}
        () = shutdown.cancelled() => {
            tracing::warn!("replay interrupted before draining");
        }
    }
    gateway.shutdown();
    if let Err(e) = tasks.delivery.await {
        tracing::warn!(%e, "delivery loop task failed");
    }
    drop(gateway);
    match issues.await {
        Ok(0) => {}
        Ok(failed_ops) => tracing::warn!(failed_ops, "some send ops were not delivered"),
        Err(e) => tracing::warn!(%e, "delivery issue collector failed"),
    }

    for surface in Surface::ALL {
        let Some(adapter) = adapters.get(&surface) else {
            continue;
        };
        for delivered in adapter.delivered() {
            println!("{}", serde_json::to_string(&delivered)?);
        }
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            () = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            () = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[channels.signal]
allow_from = ["+15550001111"]

[routing.queue]
mode = "queue"

[session]
store_path = "STORE"
"#;

    async fn write_config(dir: &Path) -> PathBuf {
        let store = dir.join("last_route.json");
        let config = CONFIG.replace("STORE", &store.display().to_string());
        let path = dir.join("config.toml");
        tokio::fs::write(&path, config).await.expect("write config");
        path
    }

    fn event_line(id: &str, sender: &str, body: &str) -> String {
        serde_json::json!({
            "surface": "signal",
            "from": sender,
            "chat_type": "direct",
            "sender_id": sender,
            "body": body,
            "message_id": id,
        })
        .to_string()
    }

    #[tokio::test]
    async fn replay_drains_and_records_last_route() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = write_config(dir.path()).await;
        let events = dir.path().join("events.jsonl");
        let lines = [
            event_line("1", "+15550001111", "first"),
            "{not json".to_string(),
            event_line("2", "+15550002222", "stranger"),
            event_line("3", "+15550001111", "second"),
        ];
        tokio::fs::write(&events, lines.join("\n"))
            .await
            .expect("write events");

        replay(Some(config), &events, Duration::from_millis(5))
            .await
            .expect("replay");

        let store = LastRouteStore::load(dir.path().join("last_route.json"))
            .await
            .expect("store");
        let route = store
            .get(&sb_channels::SessionKey::new("main"))
            .await
            .expect("route");
        assert_eq!(route.channel, Surface::Signal);
        assert_eq!(route.to, "+15550001111");
    }

    #[tokio::test]
    async fn check_rejects_missing_event_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = write_config(dir.path()).await;
        let err = check(Some(config), &dir.path().join("missing.json"))
            .await
            .expect_err("missing event");
        assert!(err.to_string().contains("read event"));
    }
}
