//! Configuration system for Keyseat.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `keyseat.toml` file
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `KEYSEAT_SERVER_HOST` - Server bind address
//! - `KEYSEAT_SERVER_PORT` - Server port
//! - `KEYSEAT_DATABASE_TYPE` - Record store backend (sqlite, postgres, memory)
//! - `KEYSEAT_DATABASE_URL` - Database connection URL
//! - `KEYSEAT_SESSION_TIMEOUT_SECS` - Idle time after which a session expires
//! - `KEYSEAT_SWEEP_INTERVAL_SECS` - How often expired sessions are reclaimed
//! - `KEYSEAT_CACHE_TTL_SECS` - How long a license record may be served from cache
//! - `KEYSEAT_STORE_TIMEOUT_MS` - Upper bound on a single record store call
//! - `KEYSEAT_LOG_LEVEL` - Log level (trace, debug, info, warn, error)

use config::builder::DefaultState;
use config::{Config, ConfigBuilder};
use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use crate::errors::{LicenseError, LicenseResult};

/// Longest accepted session timeout (30 days).
pub const MAX_SESSION_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Global configuration singleton.
static CONFIG: OnceLock<KeyseatConfig> = OnceLock::new();

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyseatConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Record store configuration
    pub database: DatabaseConfig,
    /// Session lifetime and freshness configuration
    pub session: SessionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
        }
    }
}

/// Record store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Backend: "sqlite", "postgres" or "memory"
    pub db_type: String,
    /// SQLite connection URL
    pub sqlite_url: String,
    /// PostgreSQL connection URL
    pub postgres_url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".to_string(),
            sqlite_url: "sqlite://keyseat.db?mode=rwc".to_string(),
            postgres_url: "postgres://localhost/keyseat".to_string(),
        }
    }
}

/// Session lifetime and record freshness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds without a keep-alive after which a session expires
    pub timeout_secs: u64,
    /// Seconds between two expiry sweeps
    pub sweep_interval_secs: u64,
    /// Seconds a license record may be served from cache (0 disables caching)
    pub cache_ttl_secs: u64,
    /// Milliseconds a record store call may take before the check is denied
    pub store_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            sweep_interval_secs: 30,
            cache_ttl_secs: 5,
            store_timeout_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn config_err(e: config::ConfigError) -> LicenseError {
    LicenseError::ConfigError(e.to_string())
}

fn env_int(name: &str) -> Option<i64> {
    env::var(name).ok().and_then(|v| v.parse::<i64>().ok())
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> LicenseResult<ConfigBuilder<DefaultState>> {
    let defaults = KeyseatConfig::default();

    builder
        .set_default("server.host", defaults.server.host)
        .map_err(config_err)?
        .set_default("server.port", i64::from(defaults.server.port))
        .map_err(config_err)?
        .set_default("database.db_type", defaults.database.db_type)
        .map_err(config_err)?
        .set_default("database.sqlite_url", defaults.database.sqlite_url)
        .map_err(config_err)?
        .set_default("database.postgres_url", defaults.database.postgres_url)
        .map_err(config_err)?
        .set_default("session.timeout_secs", defaults.session.timeout_secs as i64)
        .map_err(config_err)?
        .set_default(
            "session.sweep_interval_secs",
            defaults.session.sweep_interval_secs as i64,
        )
        .map_err(config_err)?
        .set_default("session.cache_ttl_secs", defaults.session.cache_ttl_secs as i64)
        .map_err(config_err)?
        .set_default("session.store_timeout_ms", defaults.session.store_timeout_ms as i64)
        .map_err(config_err)?
        .set_default("logging.level", defaults.logging.level)
        .map_err(config_err)
}

impl KeyseatConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. Default values
    /// 2. `keyseat.toml` file (optional)
    /// 3. Environment variables
    pub fn load() -> LicenseResult<Self> {
        let builder = with_defaults(Config::builder())?
            .add_source(config::File::with_name("keyseat").required(false))
            .set_override_option("server.host", env::var("KEYSEAT_SERVER_HOST").ok())
            .map_err(config_err)?
            .set_override_option("server.port", env_int("KEYSEAT_SERVER_PORT"))
            .map_err(config_err)?
            .set_override_option("database.db_type", env::var("KEYSEAT_DATABASE_TYPE").ok())
            .map_err(config_err)?
            .set_override_option(
                "database.sqlite_url",
                env::var("KEYSEAT_DATABASE_URL")
                    .ok()
                    .filter(|url| url.starts_with("sqlite")),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.postgres_url",
                env::var("KEYSEAT_DATABASE_URL")
                    .ok()
                    .filter(|url| url.starts_with("postgres")),
            )
            .map_err(config_err)?
            .set_override_option(
                "session.timeout_secs",
                env_int("KEYSEAT_SESSION_TIMEOUT_SECS"),
            )
            .map_err(config_err)?
            .set_override_option(
                "session.sweep_interval_secs",
                env_int("KEYSEAT_SWEEP_INTERVAL_SECS"),
            )
            .map_err(config_err)?
            .set_override_option("session.cache_ttl_secs", env_int("KEYSEAT_CACHE_TTL_SECS"))
            .map_err(config_err)?
            .set_override_option(
                "session.store_timeout_ms",
                env_int("KEYSEAT_STORE_TIMEOUT_MS"),
            )
            .map_err(config_err)?
            .set_override_option("logging.level", env::var("KEYSEAT_LOG_LEVEL").ok())
            .map_err(config_err)?;

        let settings = builder
            .build()
            .map_err(|e| LicenseError::ConfigError(format!("failed to build config: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| LicenseError::ConfigError(format!("failed to deserialize config: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.server.port == 0 {
            return Err(LicenseError::ConfigError(
                "server.port must be greater than 0".to_string(),
            ));
        }

        match self.database.db_type.as_str() {
            "sqlite" | "postgres" | "memory" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "database.db_type must be 'sqlite', 'postgres' or 'memory', got '{other}'"
                )));
            }
        }

        if self.session.timeout_secs == 0 {
            return Err(LicenseError::ConfigError(
                "session.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.timeout_secs > MAX_SESSION_TIMEOUT_SECS {
            return Err(LicenseError::ConfigError(format!(
                "session.timeout_secs must be at most {MAX_SESSION_TIMEOUT_SECS}, got {}",
                self.session.timeout_secs
            )));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(LicenseError::ConfigError(
                "session.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.store_timeout_ms == 0 {
            return Err(LicenseError::ConfigError(
                "session.store_timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        Ok(())
    }
}

/// Get the global configuration.
///
/// Loads and validates on first access, then caches it.
pub fn get_config() -> LicenseResult<&'static KeyseatConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = KeyseatConfig::load()?;
    config.validate()?;

    // Another thread may have won the race; either value is valid.
    let _ = CONFIG.set(config);

    CONFIG
        .get()
        .ok_or_else(|| LicenseError::ConfigError("configuration was not initialized".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = KeyseatConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.timeout(), Duration::from_secs(300));
        assert_eq!(config.session.store_timeout(), Duration::from_millis(2_000));
    }

    #[test]
    fn rejects_unknown_backend() {
        let mut config = KeyseatConfig::default();
        config.database.db_type = "redis".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("database.db_type"));
    }

    #[test]
    fn rejects_zero_session_timeout() {
        let mut config = KeyseatConfig::default();
        config.session.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_huge_session_timeout() {
        let mut config = KeyseatConfig::default();
        config.session.timeout_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("session.timeout_secs"));

        config.session.timeout_secs = MAX_SESSION_TIMEOUT_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_log_level() {
        let mut config = KeyseatConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_cache_ttl_is_allowed() {
        let mut config = KeyseatConfig::default();
        config.session.cache_ttl_secs = 0;
        assert!(config.validate().is_ok());
    }
}
