//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a client can start with no configuration
//! and work offline until an API URL is supplied.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rendezvous_shared::constants::{
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_SYNC_INTERVAL_SECS, PROFILE_THROTTLE_SECS,
};
use rendezvous_store::Database;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the backend API.
    /// Env: `RENDEZVOUS_API_URL`
    /// Default: none (remote calls fail with `NotConfigured`).
    pub api_url: Option<String>,

    /// Bearer token for the backend.
    /// Env: `RENDEZVOUS_API_TOKEN`
    pub api_token: Option<String>,

    /// Directory holding the database, the key file and the checkpoints.
    /// Env: `RENDEZVOUS_DATA_DIR`
    /// Default: the platform data directory.
    pub data_dir: PathBuf,

    /// Period of the background sync loop.
    /// Env: `RENDEZVOUS_SYNC_INTERVAL_SECS`
    /// Default: 60 seconds.
    pub sync_interval: Duration,

    /// Minimum age before a cached profile or feed is fetched again.
    /// Env: `RENDEZVOUS_PROFILE_THROTTLE_SECS`
    /// Default: 300 seconds.
    pub profile_throttle: Duration,

    /// Per-request HTTP timeout.
    /// Env: `RENDEZVOUS_HTTP_TIMEOUT_SECS`
    /// Default: 30 seconds.
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            data_dir: default_data_dir(),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            profile_throttle: Duration::from_secs(PROFILE_THROTTLE_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("RENDEZVOUS_API_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.is_empty() {
                config.api_url = Some(url);
            }
        }

        config.api_token = lookup("RENDEZVOUS_API_TOKEN").filter(|t| !t.is_empty());

        if let Some(dir) = lookup("RENDEZVOUS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(secs) = parse_secs(&lookup, "RENDEZVOUS_SYNC_INTERVAL_SECS") {
            config.sync_interval = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "RENDEZVOUS_PROFILE_THROTTLE_SECS") {
            config.profile_throttle = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "RENDEZVOUS_HTTP_TIMEOUT_SECS") {
            config.http_timeout = secs;
        }

        config
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("rendezvous.db")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.data_dir.join("secrets")
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }
}

fn default_data_dir() -> PathBuf {
    Database::default_path()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(".rendezvous"))
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let value = lookup(name)?;
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(name, value = %value, "Invalid duration, using default");
            None
        }
    }
}
