use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde::Deserialize;

use crate::cache::ResponseCache;

/// One JSON line on stdin. `params` defaults to `null` when omitted so
/// parameterless methods like `health` stay one-field requests.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Everything the handlers share: the selected workspace, its SQLite
/// connection and the read-side response cache. `workspace`/`db` stay
/// `None` until `workspace.select` succeeds.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub cache: ResponseCache,
}

impl AppState {
    /// `ACADEMD_CACHE_TTL` (seconds) tunes the stats cache; 0 disables it,
    /// which the integration tests rely on for deterministic reads.
    pub fn from_env() -> Self {
        let ttl = std::env::var("ACADEMD_CACHE_TTL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        AppState {
            workspace: None,
            db: None,
            cache: ResponseCache::new(Duration::from_secs(ttl)),
        }
    }

    pub fn cache_ttl_secs(&self) -> u64 {
        self.cache.ttl().as_secs()
    }
}
