use std::path::{Path, PathBuf};
use std::time::Duration;

use hostbridge_protocol::{
    DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_JOIN_TIMEOUT_MS, DEFAULT_PORT, INACTIVITY_TIMEOUT_MS,
    RECONNECT_DELAY_MS,
};
use serde::Deserialize;

use crate::error::BridgeResult;

/// Environment variable overriding `server`.
pub const SERVER_ENV: &str = "HOSTBRIDGE_SERVER";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: String,
    pub port: u16,
    /// Full websocket URL; takes precedence over `server`/`port`.
    pub url: Option<String>,
    pub command_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub progress_buffer: usize,
}

impl BridgeConfig {
    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let (config_path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::config_path(), false),
        };
        if !required && !config_path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&contents)?;
        tracing::debug!(path = %config_path.display(), "loaded config");
        Ok(config)
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    /// Apply `HOSTBRIDGE_SERVER` if set.
    pub fn with_env(self) -> Self {
        self.apply_server_override(std::env::var(SERVER_ENV).ok())
    }

    pub fn apply_server_override(mut self, server: Option<String>) -> Self {
        if let Some(server) = server.filter(|s| !s.trim().is_empty()) {
            self.server = server.trim().to_string();
        }
        self
    }

    /// Websocket URL to dial. `localhost` is plain `ws://` on the configured
    /// port; any other host is `wss://` with no port appended.
    pub fn endpoint(&self) -> String {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }
        if self.server.starts_with("ws://") || self.server.starts_with("wss://") {
            return self.server.clone();
        }
        if self.server == "localhost" {
            format!("ws://localhost:{}", self.port)
        } else {
            format!("wss://{}", self.server)
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn inactivity_window(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: DEFAULT_PORT,
            url: None,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            inactivity_timeout_ms: INACTIVITY_TIMEOUT_MS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            progress_buffer: 256,
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("hostbridge")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("hostbridge")
    } else {
        PathBuf::from("/tmp/hostbridge")
    }
}
