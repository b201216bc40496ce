// Client configuration.
//
// File: `~/.checkin/config.toml` (every field optional).
// Environment overrides, applied after the file:
//
// | Variable | Field |
// |---|---|
// | `CHECKIN_API_BASE` | `api_base` |
// | `CHECKIN_WS_URL` | `realtime.ws_url` |
// | `CHECKIN_USE_WEBSOCKET` | `realtime.enabled` (`true`/`1`/`yes`) |
// | `CHECKIN_LOG_FILTER` | `log_filter` |
// | `CHECKIN_SESSION_PATH` | `session_path` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::relay::{ReconnectPolicy, RelayConfig};
use crate::security::write_private_file;

const DEFAULT_API_BASE: &str = "http://localhost:8000";
const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/crud01/";

/// Root directory for client state: `~/.checkin/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".checkin"))
}

/// Path to the config file: `~/.checkin/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Default location of the persisted identity: `~/.checkin/session.json`.
pub fn default_session_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("session.json"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend base URL (e.g. `https://checkin.example.com`).
    pub api_base: String,
    /// Override for the persisted identity file.
    pub session_path: Option<PathBuf>,
    /// Log filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub realtime: RealtimeConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.into(),
            session_path: None,
            log_filter: "info".into(),
            realtime: RealtimeConfig::default(),
        }
    }
}

/// Real-time event stream settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RealtimeConfig {
    /// Real-time features are off unless explicitly enabled.
    pub enabled: bool,
    pub ws_url: String,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ws_url: DEFAULT_WS_URL.into(),
            connect_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Unset means retry indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { enabled: true, base_delay_ms: 250, max_delay_ms: 30_000, max_attempts: None }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        if !self.enabled {
            return ReconnectPolicy::disabled();
        }
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts.unwrap_or(u32::MAX),
        }
    }
}

impl ClientConfig {
    /// Load `~/.checkin/config.toml` and apply environment overrides.
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Self {
        let mut config =
            global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default();
        config.apply_env();
        config
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        write_private_file(path, contents.as_bytes())
            .map_err(|error| ConfigError::Io(std::io::Error::other(format!("{error:#}"))))
    }

    pub fn apply_env(&mut self) {
        self.apply_env_fn(|key| std::env::var(key));
    }

    /// Testable variant that accepts an environment lookup function.
    pub fn apply_env_fn<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        if let Ok(api_base) = env("CHECKIN_API_BASE") {
            self.api_base = api_base;
        }
        if let Ok(ws_url) = env("CHECKIN_WS_URL") {
            self.realtime.ws_url = ws_url;
        }
        if let Ok(flag) = env("CHECKIN_USE_WEBSOCKET") {
            self.realtime.enabled = parse_flag(&flag);
        }
        if let Ok(filter) = env("CHECKIN_LOG_FILTER") {
            self.log_filter = filter;
        }
        if let Ok(path) = env("CHECKIN_SESSION_PATH") {
            self.session_path = Some(PathBuf::from(path));
        }
    }

    /// Parsed backend base URL.
    pub fn api_base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.api_base)
            .map_err(|error| ConfigError::Invalid(format!("api_base `{}`: {error}", self.api_base)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::Invalid(format!("api_base must use http or https, got `{other}`"))),
        }
    }

    /// Relay settings derived from the `[realtime]` table.
    pub fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let ws_url = Url::parse(&self.realtime.ws_url).map_err(|error| {
            ConfigError::Invalid(format!("realtime.ws_url `{}`: {error}", self.realtime.ws_url))
        })?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "realtime.ws_url must use ws or wss, got `{}`",
                ws_url.scheme()
            )));
        }

        Ok(RelayConfig {
            ws_url,
            enabled: self.realtime.enabled,
            connect_timeout: Duration::from_millis(self.realtime.connect_timeout_ms),
            reconnect: self.realtime.reconnect.policy(),
        })
    }

    /// Where the identity is persisted.
    pub fn resolved_session_path(&self) -> Result<PathBuf, ConfigError> {
        self.session_path.clone().or_else(default_session_path).ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}
