//! TOML configuration.
//!
//! Every field has a default, so a missing file, an empty file, or a file that
//! sets only a few keys are all valid. Precedence, lowest first: defaults,
//! config file, `STORYCAST_*` environment variables, command-line flags (applied
//! by the binary).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelOptions, ReconnectPolicy};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket endpoint; `room_id` and `role` are appended as query params.
    pub url: String,
    /// Keepalive `ping` interval in seconds. 0 disables it.
    pub heartbeat_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { url: "ws://127.0.0.1:8031/ws".to_string(), heartbeat_secs: 30 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 1_000, max_delay_ms: 30_000, max_attempts: 5 }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoteConfig {
    pub duration_secs: u64,
    /// How long a viewer keeps showing a result before clearing the vote view.
    pub result_linger_ms: u64,
    /// Close early once this percentage of viewers has voted. 0 disables.
    pub quorum_percent: u32,
    /// Flag `should_trigger_vote` on progress each time this many more
    /// audience interactions have arrived. 0 disables.
    pub interaction_threshold: u64,
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self { duration_secs: 15, result_linger_ms: 3_000, quorum_percent: 0, interaction_threshold: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryConfig {
    pub dir: String,
    /// Story service base URL. When set, stories are fetched over HTTP.
    pub http_base: Option<String>,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self { dir: "./stories".to_string(), http_base: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    /// Per-room broadcast buffer. Slow members that fall further behind skip
    /// messages.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8031".to_string(), channel_capacity: 256 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub history: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self { history: 200 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub vote: VoteConfig,
    pub story: StoryConfig,
    pub relay: RelayConfig,
    pub chat: ChatConfig,
}

impl SyncConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: SyncConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `STORYCAST_SERVER_URL`, `STORYCAST_RELAY_BIND` and
    /// `STORYCAST_STORY_HTTP` when set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get("STORYCAST_SERVER_URL") {
            self.server.url = url;
        }
        if let Some(bind) = get("STORYCAST_RELAY_BIND") {
            self.relay.bind = bind;
        }
        if let Some(base) = get("STORYCAST_STORY_HTTP") {
            self.story.http_base = Some(base);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, detail: String| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { field, detail })
        };
        if self.server.url.trim().is_empty() {
            return invalid("server.url", "must not be empty".into());
        }
        if self.reconnect.base_delay_ms == 0 {
            return invalid("reconnect.base_delay_ms", "must be greater than 0".into());
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return invalid(
                "reconnect.max_delay_ms",
                format!("{} is below base_delay_ms {}", self.reconnect.max_delay_ms, self.reconnect.base_delay_ms),
            );
        }
        if self.vote.duration_secs == 0 {
            return invalid("vote.duration_secs", "must be greater than 0".into());
        }
        if self.vote.quorum_percent > 100 {
            return invalid("vote.quorum_percent", format!("{} is above 100", self.vote.quorum_percent));
        }
        if self.relay.channel_capacity == 0 {
            return invalid("relay.channel_capacity", "must be greater than 0".into());
        }
        Ok(())
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            reconnect: self.reconnect.policy(),
            heartbeat: (self.server.heartbeat_secs > 0).then(|| Duration::from_secs(self.server.heartbeat_secs)),
            ..ChannelOptions::default()
        }
    }
}
