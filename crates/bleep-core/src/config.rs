//! Configuration management.
//!
//! Handles loading, saving, and validating bleep configuration:
//! - Connection budgets and timeouts (`[connection]`)
//! - Reconnection back-off (`[monitor]`)
//! - Default enumeration mode and probe timing (`[enumeration]`)
//!
//! Sources are layered with the `config` crate: an optional TOML file
//! (`$BLEEP_CONFIG`, else the platform config directory) overridden by
//! `BLEEP__<SECTION>__<KEY>` environment variables, e.g.
//! `BLEEP__MONITOR__MAX_ATTEMPTS=8`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enumeration::{BruteforcePlan, EnumerationMode};
use crate::monitor::MonitorConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "BLEEP_CONFIG";

/// Prefix of override variables (`BLEEP__SECTION__KEY`).
pub const ENV_PREFIX: &str = "BLEEP";

/// Errors from loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly named config file could not be read.
    #[error("Failed to read config file {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The config file could not be written.
    #[error("Failed to write config file {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A source could not be parsed or deserialized.
    #[error("Invalid configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// No platform config directory exists.
    #[error("Cannot determine config directory")]
    NoConfigDir,

    /// One field holds an unusable value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path, e.g. `monitor.max_attempts`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold unusable values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Connection pipeline budgets and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Adapter to use (`None`: the system default).
    pub adapter: Option<String>,
    /// Discovery bursts before giving up on visibility.
    pub discovery_bursts: u32,
    /// Length of one discovery burst, in seconds.
    pub discovery_burst_secs: f64,
    /// Transport retry budget of the first connect.
    pub connect_retries: u32,
    /// Retry budget of the connect after pairing.
    pub paired_connect_retries: u32,
    /// Retry budget of the connect after stall mitigation.
    pub stall_connect_retries: u32,
    /// Pairing timeout, in seconds.
    pub pairing_timeout_secs: f64,
    /// Upper bound for the whole connect stage, in seconds.
    pub connect_timeout_secs: f64,
    /// Service resolution timeout, in seconds.
    pub services_timeout_secs: f64,
    /// Attach a reconnection monitor to new sessions.
    pub enable_monitoring: bool,
    /// Retry reads and read descriptors during full resolution.
    pub deep_enumeration: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            discovery_bursts: 3,
            discovery_burst_secs: 5.0,
            connect_retries: 5,
            paired_connect_retries: 3,
            stall_connect_retries: 3,
            pairing_timeout_secs: 30.0,
            connect_timeout_secs: 60.0,
            services_timeout_secs: 10.0,
            enable_monitoring: false,
            deep_enumeration: false,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl ConnectionConfig {
    /// Length of one discovery burst.
    #[must_use]
    pub fn discovery_burst(&self) -> Duration {
        secs(self.discovery_burst_secs)
    }

    /// Pairing timeout.
    #[must_use]
    pub fn pairing_timeout(&self) -> Duration {
        secs(self.pairing_timeout_secs)
    }

    /// Bound on the connect stage.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    /// Service resolution timeout.
    #[must_use]
    pub fn services_timeout(&self) -> Duration {
        secs(self.services_timeout_secs)
    }
}

/// Defaults for enumeration passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumerationConfig {
    /// Default mode: `passive`, `naggy` or `pokey`.
    pub mode: String,
    /// Naggy read passes.
    pub naggy_rounds: u32,
    /// Delay between naggy passes, in milliseconds.
    pub naggy_delay_ms: u64,
    /// Delay after each pokey write, in milliseconds.
    pub pokey_delay_ms: u64,
    /// Delay between brute-force payloads, in milliseconds.
    pub brute_delay_ms: u64,
    /// Read back after accepted writes.
    pub verify: bool,
    /// Skip characteristics flagged in the hints.
    pub respect_roe: bool,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            mode: "passive".to_string(),
            naggy_rounds: 3,
            naggy_delay_ms: 50,
            pokey_delay_ms: 100,
            brute_delay_ms: 50,
            verify: false,
            respect_roe: true,
        }
    }
}

impl EnumerationConfig {
    /// The configured default mode with its timing applied.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown names and for `bruteforce`,
    /// which needs a target.
    pub fn mode(&self) -> ConfigResult<EnumerationMode> {
        let mode = self
            .mode
            .parse::<EnumerationMode>()
            .map_err(|e| ConfigError::ValidationError {
                field: "enumeration.mode".into(),
                message: e.to_string(),
            })?;
        Ok(match mode {
            EnumerationMode::Naggy { .. } => EnumerationMode::Naggy {
                rounds: self.naggy_rounds,
                delay: Duration::from_millis(self.naggy_delay_ms),
            },
            EnumerationMode::Pokey { .. } => EnumerationMode::Pokey {
                delay: Duration::from_millis(self.pokey_delay_ms),
                verify: self.verify,
            },
            other => other,
        })
    }

    /// Applies the configured brute-force timing and flags to `plan`.
    #[must_use]
    pub fn apply_to(&self, mut plan: BruteforcePlan) -> BruteforcePlan {
        plan.delay = Duration::from_millis(self.brute_delay_ms);
        plan.verify = self.verify;
        plan.respect_roe = self.respect_roe;
        plan
    }
}

/// Main bleep configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleepConfig {
    /// Connection pipeline.
    pub connection: ConnectionConfig,
    /// Reconnection monitor.
    pub monitor: MonitorConfig,
    /// Enumeration defaults.
    pub enumeration: EnumerationConfig,
}

impl BleepConfig {
    /// Loads from the default path with environment overrides.
    ///
    /// A missing default file is not an error; a missing file named by
    /// `$BLEEP_CONFIG` is.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> ConfigResult<Self> {
        if let Some(explicit) = std::env::var_os(CONFIG_PATH_ENV) {
            let path = PathBuf::from(explicit);
            if let Err(source) = std::fs::metadata(&path) {
                return Err(ConfigError::ReadError { path, source });
            }
            return Self::load_from(&path);
        }
        Self::load_from(&Self::default_path()?)
    }

    /// Loads `path` (optional) with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        Self::load_layered(path, env_source())
    }

    fn load_layered(path: &Path, env: ::config::Environment) -> ConfigResult<Self> {
        let config: Self = ::config::Config::builder()
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(env)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Saves to the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&Self::default_path()?)
    }

    /// Saves to `path` as pretty TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The config file path: `$BLEEP_CONFIG`, else
    /// `<platform config dir>/bleep/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] when no home directory exists.
    pub fn default_path() -> ConfigResult<PathBuf> {
        if let Some(explicit) = std::env::var_os(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(explicit));
        }
        let dirs = directories::ProjectDirs::from("", "", "bleep").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Checks every field and reports all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for one problem and
    /// [`ConfigError::MultipleValidationErrors`] for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: &str| {
            if !ok {
                errors.push(ConfigError::ValidationError {
                    field: field.to_string(),
                    message: message.to_string(),
                });
            }
        };

        let c = &self.connection;
        check(c.discovery_bursts >= 1, "connection.discovery_bursts", "must be at least 1");
        check(c.connect_retries >= 1, "connection.connect_retries", "must be at least 1");
        check(
            c.paired_connect_retries >= 1,
            "connection.paired_connect_retries",
            "must be at least 1",
        );
        check(
            c.stall_connect_retries >= 1,
            "connection.stall_connect_retries",
            "must be at least 1",
        );
        for (field, value) in [
            ("connection.discovery_burst_secs", c.discovery_burst_secs),
            ("connection.pairing_timeout_secs", c.pairing_timeout_secs),
            ("connection.connect_timeout_secs", c.connect_timeout_secs),
            ("connection.services_timeout_secs", c.services_timeout_secs),
        ] {
            check(value.is_finite() && value > 0.0, field, "must be a positive number of seconds");
        }

        let m = &self.monitor;
        check(m.max_attempts >= 1, "monitor.max_attempts", "must be at least 1");
        check(
            m.backoff_factor.is_finite() && m.backoff_factor >= 1.0,
            "monitor.backoff_factor",
            "must be at least 1.0",
        );
        check(
            m.initial_delay_secs.is_finite() && m.initial_delay_secs >= 0.0,
            "monitor.initial_delay_secs",
            "must be zero or more seconds",
        );

        let e = &self.enumeration;
        check(e.naggy_rounds >= 1, "enumeration.naggy_rounds", "must be at least 1");
        if let Err(err) = e.mode() {
            errors.push(err);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

fn env_source() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> ::config::Environment {
        let map: ::config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        env_source().source(Some(map))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BleepConfig::default();
        config.validate().unwrap();
        assert_eq!(config.connection.connect_retries, 5);
        assert_eq!(config.connection.discovery_burst(), Duration::from_secs(5));
        assert_eq!(config.monitor.max_attempts, 5);
        assert_eq!(config.enumeration.mode().unwrap(), EnumerationMode::Passive);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = BleepConfig::load_layered(&dir.path().join("absent.toml"), env(&[])).unwrap();
        assert_eq!(config, BleepConfig::default());
    }

    #[test]
    fn test_save_then_load_with_env_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = BleepConfig::default();
        config.connection.services_timeout_secs = 20.0;
        config.enumeration.mode = "naggy".into();
        config.enumeration.naggy_rounds = 5;
        config.save_to(&path).unwrap();

        let loaded = BleepConfig::load_layered(
            &path,
            env(&[("BLEEP__MONITOR__MAX_ATTEMPTS", "8"), ("BLEEP_LOG_LEVEL", "debug")]),
        )
        .unwrap();
        assert_eq!(loaded.connection.services_timeout(), Duration::from_secs(20));
        assert_eq!(loaded.monitor.max_attempts, 8);
        assert_eq!(
            loaded.enumeration.mode().unwrap(),
            EnumerationMode::Naggy {
                rounds: 5,
                delay: Duration::from_millis(50)
            }
        );
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor]\nbackoff_factor = 2.0\n").unwrap();

        let loaded = BleepConfig::load_layered(&path, env(&[])).unwrap();
        assert!((loaded.monitor.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(loaded.monitor.max_attempts, 5);
        assert_eq!(loaded.connection, ConnectionConfig::default());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = BleepConfig::default();
        config.connection.discovery_bursts = 0;
        config.monitor.backoff_factor = 0.5;
        config.enumeration.mode = "bruteforce".into();

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(errors[0].to_string().starts_with("connection.discovery_bursts"));
            }
            other => panic!("expected multiple errors, got {other:?}"),
        }

        let mut config = BleepConfig::default();
        config.connection.services_timeout_secs = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { ref field, .. }) if field == "connection.services_timeout_secs"
        ));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor]\nmax_attempts = 0\n").unwrap();
        let err = BleepConfig::load_layered(&path, env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));

        std::fs::write(&path, "[monitor\n").unwrap();
        let err = BleepConfig::load_layered(&path, env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_brute_plan_picks_up_timing() {
        let config = EnumerationConfig {
            brute_delay_ms: 5,
            verify: true,
            respect_roe: false,
            ..EnumerationConfig::default()
        };
        let plan = config.apply_to(BruteforcePlan::new(uuid::Uuid::nil(), Vec::new()));
        assert_eq!(plan.delay, Duration::from_millis(5));
        assert!(plan.verify);
        assert!(!plan.respect_roe);
    }
}
