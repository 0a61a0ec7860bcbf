//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles all scheduler settings from environment variables and files

use config::{Config as ConfigBuilder, Environment, File};
use cronmesh_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Minimum accepted length, in bytes, for the encryption key (§6.4: required, aborts startup if absent).
pub const MIN_ENCRYPTION_KEY_LEN: usize = 16;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub lock: LockConfig,
    #[validate(nested)]
    pub security: SecurityConfig,
    #[validate(nested)]
    pub retry: RetryConfig,
    #[validate(nested)]
    pub dispatch: DispatchConfig,
    #[validate(nested)]
    pub channel: ChannelConfig,
    pub observability: ObservabilityConfig,
}

/// HTTP listen address for the worker channel and the thin operator surface
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Persistence endpoint + pool size (§6.2)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub url: String,
    #[validate(range(min = 1, max = 100))]
    pub max_connections: u32,
    #[validate(range(min = 1, max = 100))]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "cronmesh.db".to_string(),
            max_connections: 10,
            min_connections: 1,
        }
    }
}

/// Distributed lock tunables (§4.2)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LockConfig {
    #[validate(range(min = 1, max = 86400))]
    pub default_lease_seconds: u64,
    #[validate(range(min = 0, max = 100))]
    pub max_retries: u32,
    #[validate(range(min = 1, max = 60000))]
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease_seconds: 10,
            max_retries: 3,
            retry_interval_ms: 100,
        }
    }
}

/// Secrets and the delegated auth endpoint (§6.4, §6.6)
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct SecurityConfig {
    // Length is enforced explicitly in `Config::load` (MIN_ENCRYPTION_KEY_LEN), not here —
    // a `validate(length(min = 1))` here would reject the empty default before that check
    // ever ran, surfacing `Error::Config` instead of the documented `Error::Fatal`.
    pub encryption_key: String,
    pub auth_endpoint: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key: String::new(),
            auth_endpoint: None,
        }
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("encryption_key", &"[REDACTED]")
            .field("auth_endpoint", &self.auth_endpoint)
            .finish()
    }
}

/// Retry engine cadence and global switch (§4.7)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RetryConfig {
    pub enabled: bool,
    #[validate(range(min = 1, max = 3600))]
    pub check_interval_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 30,
        }
    }
}

/// Dispatch loop tunables (§4.5)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DispatchConfig {
    #[validate(range(min = 1, max = 3600))]
    pub lookahead_seconds: u64,
    #[validate(range(min = 1, max = 10000))]
    pub batch_size: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lookahead_seconds: 10,
            batch_size: 50,
        }
    }
}

/// Worker channel tunables (§6.1)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChannelConfig {
    #[validate(range(min = 1, max = 1000))]
    pub max_tasks_per_frame: u32,
    #[validate(range(min = 1, max = 100000))]
    pub session_queue_capacity: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_frame: 5,
            session_queue_capacity: 100,
        }
    }
}

/// Log level/format/path (ambient, §7a)
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ObservabilityConfig {
    pub log_level: Option<String>,
    pub log_format: LogFormat,
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables and an optional `.env` file.
    ///
    /// Returns `Error::Fatal` when the encryption key is missing or too short, since
    /// that condition aborts process startup per the error-handling design.
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.url", "cronmesh.db")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 1)?
            .set_default("lock.default_lease_seconds", 10)?
            .set_default("lock.max_retries", 3)?
            .set_default("lock.retry_interval_ms", 100)?
            .set_default("retry.enabled", true)?
            .set_default("retry.check_interval_seconds", 30)?
            .set_default("dispatch.lookahead_seconds", 10)?
            .set_default("dispatch.batch_size", 50)?
            .set_default("channel.max_tasks_per_frame", 5)?
            .set_default("channel.session_queue_capacity", 100)?
            .set_default("observability.log_format", "pretty")?;

        // Pool size is commonly overridden per deployment without touching the rest of the file.
        if let Ok(max_conn) = std::env::var("CRONMESH_DATABASE_MAX_CONNECTIONS") {
            builder = builder.set_override("database.max_connections", max_conn)?;
        }

        if std::path::Path::new(".env").exists() {
            builder = builder.add_source(File::with_name(".env").required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("CRONMESH")
                .try_parsing(true)
                .separator("_"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("config validation failed: {}", e)))?;

        if parsed.security.encryption_key.len() < MIN_ENCRYPTION_KEY_LEN {
            return Err(Error::Fatal(format!(
                "security.encryption_key must be at least {} bytes",
                MIN_ENCRYPTION_KEY_LEN
            )));
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Use a mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear(vars: &[&str]) {
        for key in vars {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_config_defaults_without_key_is_fatal() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear(&["CRONMESH_SECURITY_ENCRYPTION_KEY"]);

        let result = Config::load();
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[test]
    fn test_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear(&[
            "CRONMESH_SERVER_HOST",
            "CRONMESH_SERVER_PORT",
            "CRONMESH_SECURITY_ENCRYPTION_KEY",
        ]);

        env::set_var("CRONMESH_SERVER_HOST", "127.0.0.1");
        env::set_var("CRONMESH_SERVER_PORT", "9000");
        env::set_var("CRONMESH_SECURITY_ENCRYPTION_KEY", "0123456789abcdef");

        let config = Config::load().expect("should load from env");

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.security.encryption_key, "0123456789abcdef");

        clear(&[
            "CRONMESH_SERVER_HOST",
            "CRONMESH_SERVER_PORT",
            "CRONMESH_SECURITY_ENCRYPTION_KEY",
        ]);
    }

    #[test]
    fn test_config_validation_failure() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear(&["CRONMESH_DATABASE_MAX_CONNECTIONS"]);

        env::set_var("CRONMESH_SECURITY_ENCRYPTION_KEY", "0123456789abcdef");
        env::set_var("CRONMESH_DATABASE_MAX_CONNECTIONS", "200"); // out of range

        let result = Config::load();
        assert!(result.is_err());

        clear(&[
            "CRONMESH_SECURITY_ENCRYPTION_KEY",
            "CRONMESH_DATABASE_MAX_CONNECTIONS",
        ]);
    }

    #[test]
    fn test_secret_redaction() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("CRONMESH_SECURITY_ENCRYPTION_KEY", "0123456789abcdef");

        let config = Config::load().expect("should load with a valid key");
        let debug_output = format!("{:?}", config);

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("0123456789abcdef"));

        env::remove_var("CRONMESH_SECURITY_ENCRYPTION_KEY");
    }

    #[test]
    fn test_encryption_key_too_short_is_fatal() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("CRONMESH_SECURITY_ENCRYPTION_KEY", "short");

        let result = Config::load();
        assert!(matches!(result, Err(Error::Fatal(_))));

        env::remove_var("CRONMESH_SECURITY_ENCRYPTION_KEY");
    }
}
