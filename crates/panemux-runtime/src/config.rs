//! TOML configuration for the `serve` daemon.
//!
//! ```toml
//! [busy]
//! hold_interval_ms = 2000
//!
//! [fallback]
//! primary = "claude"
//! fallbacks = ["codex", "gemini"]
//! recovery_interval_ms = 60000
//! auto_recovery = true
//!
//! [rate_limit]
//! default_cooldown_ms = 300000
//!
//! [layout]
//! refresh_delay_ms = 100
//!
//! [backend]
//! socket_path = "/run/user/1000/panemux/backend.sock"
//! ```
//!
//! Every section and key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use panemux_core::busy::DEFAULT_HOLD_INTERVAL_MS;
use panemux_core::rate_limit::DEFAULT_COOLDOWN_MS;
use panemux_core::{CoreError, FallbackChainConfig, WorkspaceConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delay before a reattached surface is asked to refresh.
pub const DEFAULT_REFRESH_DELAY_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub busy: BusyConfig,
    pub fallback: FallbackChainConfig,
    pub rate_limit: RateLimitConfig,
    pub layout: LayoutConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusyConfig {
    pub hold_interval_ms: u64,
}

impl Default for BusyConfig {
    fn default() -> Self {
        Self {
            hold_interval_ms: DEFAULT_HOLD_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_cooldown_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub refresh_delay_ms: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            refresh_delay_ms: DEFAULT_REFRESH_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Native backend socket. Defaults to [`default_backend_socket_path`].
    pub socket_path: Option<String>,
}

impl Config {
    /// Load from `explicit` if given (must exist), else from the default
    /// location (missing file means defaults).
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load_file(path),
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::load_file(&path)
                } else {
                    tracing::debug!(path = %path.display(), "no config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workspace_config().validate()?;
        Ok(())
    }

    pub fn workspace_config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            hold_interval_ms: self.busy.hold_interval_ms,
            default_cooldown_ms: self.rate_limit.default_cooldown_ms,
            fallback: self.fallback.clone().normalized(),
        }
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.layout.refresh_delay_ms)
    }

    pub fn backend_socket_path(&self) -> String {
        self.backend
            .socket_path
            .clone()
            .unwrap_or_else(default_backend_socket_path)
    }
}

/// `$XDG_CONFIG_HOME/panemux/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("panemux").join("config.toml")
}

pub fn default_backend_socket_path() -> String {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return format!("{dir}/panemux/backend.sock");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("/tmp/panemux-{user}/backend.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use panemux_core::AgentType;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(text.as_bytes()).expect("write");
        file
    }

    #[test]
    fn empty_file_yields_defaults() {
        let file = write_config("");
        let config = Config::load(Some(file.path())).expect("load");
        assert_eq!(config, Config::default());
        assert_eq!(config.busy.hold_interval_ms, 2_000);
        assert_eq!(config.refresh_delay(), Duration::from_millis(100));
    }

    #[test]
    fn sections_override_defaults() {
        let file = write_config(
            r#"
[busy]
hold_interval_ms = 750

[fallback]
primary = "codex"
fallbacks = ["codex", "claude", "claude", "gemini"]
auto_recovery = false

[rate_limit]
default_cooldown_ms = 1000

[backend]
socket_path = "/tmp/test-backend.sock"
"#,
        );
        let config = Config::load(Some(file.path())).expect("load");
        let ws = config.workspace_config();
        assert_eq!(ws.hold_interval_ms, 750);
        assert_eq!(ws.default_cooldown_ms, 1_000);
        assert_eq!(ws.fallback.primary, AgentType::Codex);
        assert_eq!(ws.fallback.fallbacks, vec![AgentType::Claude, AgentType::Gemini]);
        assert!(!ws.fallback.auto_recovery);
        assert_eq!(ws.fallback.recovery_interval_ms, 60_000);
        assert_eq!(config.backend_socket_path(), "/tmp/test-backend.sock");
    }

    #[test]
    fn zero_hold_interval_is_rejected() {
        let file = write_config("[busy]\nhold_interval_ms = 0\n");
        let err = Config::load(Some(file.path())).expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn unknown_agent_is_a_parse_error() {
        let file = write_config("[fallback]\nprimary = \"aider\"\n");
        let err = Config::load(Some(file.path())).expect_err("invalid");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Config::load(Some(&dir.path().join("nope.toml"))).expect_err("missing");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
