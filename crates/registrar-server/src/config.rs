//! Control plane configuration
//!
//! Loaded from an optional YAML file, then overridden from the environment.
//! Every field has a default, so an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding [`RegistrarConfig::listen`]
pub const ENV_LISTEN: &str = "REGISTRAR_LISTEN";

/// Environment variable overriding [`RegistrarConfig::log_filter`]
pub const ENV_LOG: &str = "REGISTRAR_LOG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {name}: {message}")]
    Invalid { name: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Address the HTTP API listens on
    pub listen: SocketAddr,

    pub reconciler: ReconcilerConfig,

    pub termination: TerminationConfig,

    /// Tracing directive used when RUST_LOG is unset (e.g. "registrar=debug")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Seconds between full level-triggered resyncs of every registration
    pub resync_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminationConfig {
    /// First delay after a failed drain attempt
    pub initial_backoff_ms: u64,

    /// Upper bound for the exponential drain backoff
    pub max_backoff_ms: u64,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            reconciler: ReconcilerConfig::default(),
            termination: TerminationConfig::default(),
            log_filter: None,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 30,
        }
    }
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

impl TerminationConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl RegistrarConfig {
    /// Parse a YAML document
    pub fn from_yaml(source: &str, origin: &str) -> Result<Self, ConfigError> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(source).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Load from `path` if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let display = path.display().to_string();
                let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: display.clone(),
                    source,
                })?;
                Self::from_yaml(&source, &display)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(listen) = lookup(ENV_LISTEN) {
            self.listen = listen.parse().map_err(|e| ConfigError::Invalid {
                name: ENV_LISTEN.to_string(),
                message: format!("{}", e),
            })?;
        }
        if let Some(filter) = lookup(ENV_LOG) {
            if !filter.is_empty() {
                self.log_filter = Some(filter);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.termination.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "termination.initial_backoff_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.termination.max_backoff_ms < self.termination.initial_backoff_ms {
            return Err(ConfigError::Invalid {
                name: "termination.max_backoff_ms".to_string(),
                message: "must not be smaller than initial_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RegistrarConfig::default();
        assert_eq!(config.listen.to_string(), "127.0.0.1:8080");
        assert_eq!(config.reconciler.resync_interval(), Duration::from_secs(30));
        assert_eq!(config.termination.initial_backoff_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "listen: 0.0.0.0:9000\ntermination:\n  max_backoff_ms: 2000\n";
        let config = RegistrarConfig::from_yaml(yaml, "test.yaml").unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.termination.max_backoff_ms, 2000);
        assert_eq!(config.termination.initial_backoff_ms, 500);
        assert_eq!(config.reconciler.resync_interval_secs, 30);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = RegistrarConfig::from_yaml("  \n", "empty.yaml").unwrap();
        assert_eq!(config, RegistrarConfig::default());
    }

    #[test]
    fn test_bad_yaml_reports_origin() {
        let err = RegistrarConfig::from_yaml("listen: [", "broken.yaml").unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_LISTEN, "10.0.0.1:80"), (ENV_LOG, "registrar=trace")]
            .into_iter()
            .collect();

        let mut config = RegistrarConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.listen.to_string(), "10.0.0.1:80");
        assert_eq!(config.log_filter.as_deref(), Some("registrar=trace"));

        let err = config
            .apply_overrides(|name| (name == ENV_LISTEN).then(|| "nope".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_LISTEN));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let termination = TerminationConfig {
            initial_backoff_ms: 500,
            max_backoff_ms: 3000,
        };
        assert_eq!(termination.backoff(1), Duration::from_millis(500));
        assert_eq!(termination.backoff(2), Duration::from_millis(1000));
        assert_eq!(termination.backoff(3), Duration::from_millis(2000));
        assert_eq!(termination.backoff(4), Duration::from_millis(3000));
        assert_eq!(termination.backoff(60), Duration::from_millis(3000));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "reconciler:\n  resync_interval_secs: 5").unwrap();

        let config = RegistrarConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.reconciler.resync_interval(), Duration::from_secs(5));
        assert_eq!(config.termination, TerminationConfig::default());
    }

    #[test]
    fn test_load_validates_and_reports_missing_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "termination:\n  initial_backoff_ms: 0").unwrap();
        let err = RegistrarConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        let err = RegistrarConfig::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.yaml"));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = RegistrarConfig::default();
        config.termination.max_backoff_ms = 100;
        assert!(config.validate().is_err());
    }
}
