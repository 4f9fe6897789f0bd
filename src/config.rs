//! Client options and the operator config file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::channel::queue::OverflowPolicy;
use crate::reconnect::ReconnectPolicy;

/// Websocket endpoint used when no config file overrides it.
pub const DEFAULT_API_URL: &str = "ws://localhost:3001";
/// Directory under the home directory holding operator state.
pub const CONFIG_DIR_NAME: &str = ".yallma3";
/// Name of the operator config file inside [`CONFIG_DIR_NAME`].
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);
    pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(3_000);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
}

/// Runtime options for a [`ChannelClient`](crate::channel::client::ChannelClient).
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub url: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Reply to `run_workflow` requests nobody is subscribed to.
    pub auto_reply_unhandled_run_workflow: bool,
    /// Maximum queued messages while disconnected. `None` is unbounded.
    pub queue_capacity: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    /// Force-close the transport when no `pong` arrives within this window.
    ///
    /// Disabled by default: heartbeats are sent but never checked.
    pub pong_timeout: Option<Duration>,
    /// Log every frame at `debug` instead of `trace`.
    pub verbose: bool,
}

impl ClientOptions {
    /// Default options for `url`, with trailing whitespace trimmed.
    pub fn new(url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            url: url.trim_end().to_string(),
            ..Self::default()
        }
    }

    /// Builds options from the `api` section of the operator config.
    pub fn from_api_config(api: &ApiConfig) -> Self {
        Self::new(api.url.clone())
    }

    /// How long `connect()` waits for the transport to open.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Ping period while connected. Zero disables the heartbeat.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Automatic reconnect cap and interval.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets [`auto_reply_unhandled_run_workflow`](Self::auto_reply_unhandled_run_workflow).
    pub fn with_auto_reply(mut self, enabled: bool) -> Self {
        self.auto_reply_unhandled_run_workflow = enabled;
        self
    }

    /// Bounds the outbound queue and picks what to discard when it is full.
    pub fn with_queue_capacity(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.queue_capacity = Some(capacity);
        self.overflow_policy = policy;
        self
    }

    /// Enables the pong watchdog.
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = Some(timeout);
        self
    }

    /// Logs every frame at `debug`.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_string(),
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            heartbeat_interval: ClientDefaults::HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy {
                max_attempts: ClientDefaults::MAX_RECONNECT_ATTEMPTS,
                interval: ClientDefaults::RECONNECT_INTERVAL,
            },
            auto_reply_unhandled_run_workflow: true,
            queue_capacity: None,
            overflow_policy: OverflowPolicy::default(),
            pong_timeout: None,
            verbose: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory could not be resolved")]
    NoHomeDir,

    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// `api` section of `~/.yallma3/config.json`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            timeout: default_api_timeout(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_api_timeout() -> u64 {
    30
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    api: ApiConfig,
}

/// Path of the operator config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Reads the `api` section from `path`.
///
/// A missing file yields the defaults; other I/O and parse failures are
/// returned.
pub fn read_api_config(path: &Path) -> Result<ApiConfig, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ApiConfig::default())
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let file: ConfigFile = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.api)
}

/// Loads the operator's `api` config, falling back to defaults on any error.
pub fn load_api_config() -> ApiConfig {
    let loaded = config_file_path().and_then(|path| read_api_config(&path));
    match loaded {
        Ok(api) => api,
        Err(err) => {
            warn!(event = "config_load_failed", error = %err, "using default api config");
            ApiConfig::default()
        }
    }
}
