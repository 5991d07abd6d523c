//! TOML configuration for Passport Buddy.
//!
//! Every queue constant has a compiled-in default. A config file only needs
//! to name what it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PASSPORTBUDDY_CONFIG";

/// System-wide config location checked after the environment variable.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/passportbuddy/passportbuddy.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuddyConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BuddyConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .queue
            .validate()
            .with_context(|| format!("invalid [queue] section in {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Use the first config source that loads and validates: the file named
    /// by `PASSPORTBUDDY_CONFIG`, then the system path if it exists. A source
    /// that fails is logged and skipped. With no usable source the compiled-in
    /// defaults apply.
    pub fn load_or_default() -> Self {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let system = Some(PathBuf::from(SYSTEM_CONFIG_PATH)).filter(|p| p.exists());

        for path in from_env.into_iter().chain(system) {
            match Self::load(&path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = format!("{:#}", e),
                        "config file could not be loaded, trying next source"
                    );
                }
            }
        }

        debug!("no usable config file, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Admission, concurrency and retry limits for the request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Operations allowed to execute at the same time.
    pub max_concurrent: usize,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds).
    pub base_retry_delay_ms: u64,
    /// Factor applied to the delay for each further retry.
    pub backoff_multiplier: u32,
    /// Width of one fixed rate-limit window (milliseconds).
    pub rate_limit_window_ms: u64,
    /// Requests admitted per key per window.
    pub rate_limit_max_requests: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            base_retry_delay_ms: 1000,
            backoff_multiplier: 2,
            rate_limit_window_ms: 1000,
            rate_limit_max_requests: 10,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }
        if self.rate_limit_window_ms == 0 {
            anyhow::bail!("rate_limit_window_ms must be greater than zero");
        }
        if self.rate_limit_max_requests == 0 {
            anyhow::bail!("rate_limit_max_requests must be at least 1");
        }
        if self.backoff_multiplier == 0 {
            anyhow::bail!("backoff_multiplier must be at least 1");
        }
        Ok(())
    }

    /// Raise every zero limit to 1, warning for each.
    ///
    /// A queue built from an unvalidated config goes through this so that a
    /// zero cap or window cannot stall or break it.
    pub fn clamped(mut self) -> Self {
        fn at_least_one<N: PartialEq + From<u8>>(name: &str, value: &mut N) {
            if *value == N::from(0) {
                warn!(setting = name, "zero is not allowed, using 1");
                *value = N::from(1);
            }
        }
        at_least_one("max_concurrent", &mut self.max_concurrent);
        at_least_one("rate_limit_window_ms", &mut self.rate_limit_window_ms);
        at_least_one("rate_limit_max_requests", &mut self.rate_limit_max_requests);
        at_least_one("backoff_multiplier", &mut self.backoff_multiplier);
        self
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Where the REST backend lives and how long a single call may take.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_sec: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout_sec: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level, used when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_queue_constants() {
        let cfg = BuddyConfig::default();

        assert_eq!(cfg.queue.max_concurrent, 5);
        assert_eq!(cfg.queue.max_retries, 3);
        assert_eq!(cfg.queue.base_retry_delay_ms, 1000);
        assert_eq!(cfg.queue.backoff_multiplier, 2);
        assert_eq!(cfg.queue.rate_limit_window_ms, 1000);
        assert_eq!(cfg.queue.rate_limit_max_requests, 10);
        assert!(cfg.queue.validate().is_ok());

        assert_eq!(cfg.backend.base_url, "http://localhost:5000");
        assert_eq!(cfg.backend.timeout_sec, 10);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[queue]
max_concurrent = 2
base_retry_delay_ms = 50
"#;

        let cfg: BuddyConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.queue.max_concurrent, 2);
        assert_eq!(cfg.queue.base_retry_delay(), Duration::from_millis(50));
        assert_eq!(cfg.queue.max_retries, 3);
        assert_eq!(cfg.queue.rate_limit_max_requests, 10);
        assert_eq!(cfg.backend.timeout_sec, 10);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: BuddyConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.queue, QueueConfig::default());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let zero_concurrency = QueueConfig {
            max_concurrent: 0,
            ..QueueConfig::default()
        };
        assert!(zero_concurrency.validate().is_err());

        let zero_window = QueueConfig {
            rate_limit_window_ms: 0,
            ..QueueConfig::default()
        };
        assert!(zero_window.validate().is_err());

        let zero_multiplier = QueueConfig {
            backoff_multiplier: 0,
            ..QueueConfig::default()
        };
        assert!(zero_multiplier.validate().is_err());
    }

    #[test]
    fn test_clamped_raises_zero_limits() {
        let cfg = QueueConfig {
            max_concurrent: 0,
            rate_limit_window_ms: 0,
            rate_limit_max_requests: 0,
            backoff_multiplier: 0,
            max_retries: 0,
            base_retry_delay_ms: 0,
        }
        .clamped();

        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_concurrent, 1);
        assert_eq!(cfg.rate_limit_window_ms, 1);
        assert_eq!(cfg.rate_limit_max_requests, 1);
        assert_eq!(cfg.backoff_multiplier, 1);
        // Zero retries and a zero delay are meaningful and stay.
        assert_eq!(cfg.max_retries, 0);
        assert_eq!(cfg.base_retry_delay_ms, 0);

        assert_eq!(QueueConfig::default().clamped(), QueueConfig::default());
    }

    #[test]
    fn test_load_or_default_skips_invalid_env_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[queue]\nmax_concurrent = 0\n").unwrap();

        std::env::set_var(CONFIG_ENV, &path);
        let cfg = BuddyConfig::load_or_default();
        std::env::remove_var(CONFIG_ENV);

        // Falls through to the system path or defaults, both valid.
        assert!(cfg.queue.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("passportbuddy.toml");
        std::fs::write(
            &path,
            r#"
[backend]
base_url = "http://10.0.0.5:8080"

[logging]
json = true
"#,
        )
        .unwrap();

        let cfg = BuddyConfig::load(&path).unwrap();
        assert_eq!(cfg.backend.base_url, "http://10.0.0.5:8080");
        assert!(cfg.logging.json);
        assert_eq!(cfg.queue.max_concurrent, 5);
    }

    #[test]
    fn test_load_invalid_queue_section_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[queue]\nmax_concurrent = 0\n").unwrap();

        assert!(BuddyConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = BuddyConfig::load(Path::new("/nonexistent/path/passportbuddy.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = BuddyConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: BuddyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.queue, roundtripped.queue);
        assert_eq!(cfg.backend.base_url, roundtripped.backend.base_url);
    }
}
