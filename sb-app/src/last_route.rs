//! Where the main session was last reached from, persisted as one JSON file.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sb_channels::{SessionKey, Surface};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRoute {
    pub channel: Surface,
    pub to: String,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

pub struct LastRouteStore {
    path: PathBuf,
    routes: Mutex<HashMap<String, LastRoute>>,
}

impl LastRouteStore {
    /// A missing file is an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let routes = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("parse last route {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(anyhow::anyhow!("read last route {}: {e}", path.display())),
        };
        Ok(Self {
            path,
            routes: Mutex::new(routes),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &SessionKey) -> Option<LastRoute> {
        self.routes.lock().await.get(key.as_str()).cloned()
    }

    /// Returns `true` when the route changed and the file was rewritten.
    pub async fn record(&self, key: &SessionKey, channel: Surface, to: &str) -> Result<bool> {
        let mut routes = self.routes.lock().await;
        if routes
            .get(key.as_str())
            .is_some_and(|current| current.channel == channel && current.to == to)
        {
            return Ok(false);
        }
        routes.insert(
            key.as_str().to_string(),
            LastRoute {
                channel,
                to: to.to_string(),
                updated_at: Utc::now(),
            },
        );
        let snapshot = serde_json::to_vec_pretty(&*routes)?;
        write_atomic(&self.path, &snapshot).await?;
        tracing::debug!(session_key = %key, %channel, to, "last route updated");
        Ok(true)
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("create {}: {e}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| anyhow::anyhow!("write {}: {e}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| anyhow::anyhow!("rename {} -> {}: {e}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LastRouteStore::load(dir.path().join("last_route.json"))
            .await
            .expect("load");
        assert!(store.get(&SessionKey::new("main")).await.is_none());
    }

    #[tokio::test]
    async fn records_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("last_route.json");
        let key = SessionKey::new("main");

        let store = LastRouteStore::load(&path).await.expect("load");
        assert!(store.record(&key, Surface::Telegram, "user:42").await.expect("record"));
        assert!(!store.record(&key, Surface::Telegram, "user:42").await.expect("same"));
        assert!(store.record(&key, Surface::Signal, "+15550001111").await.expect("moved"));

        let reloaded = LastRouteStore::load(&path).await.expect("reload");
        let route = reloaded.get(&key).await.expect("route");
        assert_eq!(route.channel, Surface::Signal);
        assert_eq!(route.to, "+15550001111");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("last_route.json");
        tokio::fs::write(&path, "{not json").await.expect("write");
        assert!(LastRouteStore::load(&path).await.is_err());
    }
}
