//! Configuration loading and management.
//!
//! Loads holonic configuration from `./holonic.toml` (or
//! `$HOLONIC_CONFIG_PATH`). Environment variables override file values; file
//! values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level holonic configuration loaded from TOML.
///
/// Path: `./holonic.toml` or `$HOLONIC_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HolonicConfig {
    /// Scheduler tick settings (`[scheduler]`).
    pub scheduler: SchedulerSettings,
    /// Storage engine settings (`[storage]`).
    pub storage: StorageSettings,
    /// Inspection surface settings (`[http]`).
    pub http: HttpSettings,
    /// Logging settings (`[logging]`).
    pub logging: LoggingSettings,
}

impl HolonicConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$HOLONIC_CONFIG_PATH` or `./holonic.toml`.
    /// If the file does not exist, returns defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path()?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: HolonicConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(HolonicConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config file path (`$HOLONIC_CONFIG_PATH` or `./holonic.toml`).
    fn config_path() -> Result<PathBuf> {
        Self::config_path_with(|key| std::env::var(key).ok())
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(p) = env("HOLONIC_CONFIG_PATH") {
            return Ok(PathBuf::from(p));
        }
        Ok(PathBuf::from("holonic.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in
    /// tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("HOLONIC_TICK_INTERVAL_SECS") {
            match v.parse() {
                Ok(n) => self.scheduler.tick_interval_secs = n,
                Err(_) => tracing::warn!(
                    var = "HOLONIC_TICK_INTERVAL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("HOLONIC_MODEL") {
            self.scheduler.model = v;
        }
        if let Some(v) = env("HOLONIC_MAX_RESPONSE_TOKENS") {
            match v.parse() {
                Ok(n) => self.scheduler.max_response_tokens = n,
                Err(_) => tracing::warn!(
                    var = "HOLONIC_MAX_RESPONSE_TOKENS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("HOLONIC_STRUCTURED_OUTPUT") {
            match v.parse() {
                Ok(b) => self.scheduler.structured_output = b,
                Err(_) => tracing::warn!(
                    var = "HOLONIC_STRUCTURED_OUTPUT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        if let Some(v) = env("HOLONIC_STORAGE_PATH") {
            self.storage.path = v;
        }
        if let Some(v) = env("HOLONIC_STORAGE_PASSPHRASE") {
            self.storage.passphrase = Some(v);
        }

        if let Some(v) = env("HOLONIC_HTTP_BIND") {
            self.http.bind = v;
        }

        if let Some(v) = env("HOLONIC_LOG_DIR") {
            self.logging.log_dir = v;
        }
        if let Some(v) = env("HOLONIC_LOG_LEVEL") {
            self.logging.log_level = v;
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: HolonicConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

/// Scheduler tick settings (`[scheduler]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Wall-clock seconds between ticks.
    pub tick_interval_secs: u64,
    /// `<vendor>/<model>` spec passed to the AI transport.
    pub model: String,
    /// Maximum tokens requested per AI call.
    pub max_response_tokens: u32,
    /// Whether to request vendor structured-output mode.
    pub structured_output: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            max_response_tokens: 4096,
            structured_output: true,
        }
    }
}

/// Storage engine settings (`[storage]`).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database path.
    pub path: String,
    /// Optional encryption passphrase (applied via `PRAGMA key` on connect).
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("path", &self.path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "__REDACTED__"))
            .finish()
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: "./holonic.db".to_string(),
            passphrase: None,
        }
    }
}

/// Inspection surface settings (`[http]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// `host:port` the inspection surface binds to.
    pub bind: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
        }
    }
}

/// Logging settings (`[logging]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for rotated JSON log files (production mode only).
    pub log_dir: String,
    /// `RUST_LOG`-style filter used as the default when the env var is
    /// absent.
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: "./logs".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = HolonicConfig::default();

        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert_eq!(config.scheduler.model, "anthropic/claude-sonnet-4-20250514");
        assert_eq!(config.scheduler.max_response_tokens, 4096);
        assert!(config.scheduler.structured_output);

        assert_eq!(config.storage.path, "./holonic.db");
        assert!(config.storage.passphrase.is_none());

        assert_eq!(config.http.bind, "127.0.0.1:5000");

        assert_eq!(config.logging.log_dir, "./logs");
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn parse_full_toml() {
        let toml_str = r#"
[scheduler]
tick_interval_secs = 30
model = "openai/gpt-4o"
max_response_tokens = 2048
structured_output = false

[storage]
path = "/var/lib/holonic/holonic.db"
passphrase = "vault:holonic_db_key"

[http]
bind = "0.0.0.0:8080"

[logging]
log_dir = "/var/log/holonic"
log_level = "debug"
"#;

        let config = HolonicConfig::from_toml(toml_str).expect("should parse");

        assert_eq!(config.scheduler.tick_interval_secs, 30);
        assert_eq!(config.scheduler.model, "openai/gpt-4o");
        assert_eq!(config.scheduler.max_response_tokens, 2048);
        assert!(!config.scheduler.structured_output);
        assert_eq!(config.storage.path, "/var/lib/holonic/holonic.db");
        assert_eq!(config.storage.passphrase.as_deref(), Some("vault:holonic_db_key"));
        assert_eq!(config.http.bind, "0.0.0.0:8080");
        assert_eq!(config.logging.log_dir, "/var/log/holonic");
        assert_eq!(config.logging.log_level, "debug");
    }

    #[test]
    fn env_overrides_take_precedence_over_file_values() {
        let mut config = HolonicConfig::from_toml(
            r#"
[scheduler]
model = "openai/gpt-4o"
"#,
        )
        .expect("should parse");

        let env = |key: &str| match key {
            "HOLONIC_MODEL" => Some("anthropic/claude-sonnet-4-20250514".to_string()),
            "HOLONIC_TICK_INTERVAL_SECS" => Some("15".to_string()),
            _ => None,
        };
        config.apply_overrides(env);

        assert_eq!(config.scheduler.model, "anthropic/claude-sonnet-4-20250514");
        assert_eq!(config.scheduler.tick_interval_secs, 15);
    }

    #[test]
    fn config_path_prefers_env_var_over_default() {
        let path = HolonicConfig::config_path_with(|key| {
            if key == "HOLONIC_CONFIG_PATH" {
                Some("/etc/holonic/custom.toml".to_string())
            } else {
                None
            }
        })
        .expect("should resolve");
        assert_eq!(path, PathBuf::from("/etc/holonic/custom.toml"));
    }
}
