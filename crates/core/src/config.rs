//! Runtime configuration for the worker registry and launcher

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the installation home
pub const HOME_ENV: &str = "PRELERT_HOME";

/// Byte order of the integer prefixes in the length-encoded wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Network byte order
    #[default]
    BigEndian,
    /// Host order on x86/ARM
    LittleEndian,
}

/// Bounded retry schedule used while draining busy jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Pause between attempts
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Maximum number of attempts per job (including the first)
    #[serde(deserialize_with = "at_least_one")]
    pub max_attempts: u32,
}

fn at_least_one<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    u32::deserialize(deserializer).map(|n| n.max(1))
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 60,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given interval and attempt budget
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }
}

/// Configuration shared by the launcher and the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Installation home; worker binaries live in `home/bin`
    #[serde(default = "default_home")]
    pub home: PathBuf,

    /// Analytics worker program name
    #[serde(default = "default_autodetect_program")]
    pub autodetect_program: String,

    /// Normalizer program name
    #[serde(default = "default_normalize_program")]
    pub normalize_program: String,

    /// Directory searched for the model config file (default `home/config`)
    #[serde(default)]
    pub config_dir: Option<PathBuf>,

    /// Cap on anomaly records the worker emits per bucket
    #[serde(default = "default_max_anomaly_records")]
    pub max_anomaly_records: Option<u32>,

    /// Retry schedule used by `shutdown` for busy jobs
    #[serde(default)]
    pub stop_retry: RetryPolicy,

    /// Delay before an idle timeout retries a job that was busy
    #[serde(default = "default_busy_reschedule", with = "duration_secs")]
    pub busy_reschedule: Duration,

    /// Byte order of wire-format prefixes
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Directory for temporary config and state files (system default if unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Trailing worker stderr lines kept for error reports
    #[serde(default = "default_stderr_capture_lines")]
    pub stderr_capture_lines: usize,

    /// Maximum percentage of discarded records tolerated per stream
    #[serde(default = "default_max_discard_percent")]
    pub max_discard_percent: f64,
}

// Default value functions for serde
fn default_home() -> PathBuf {
    std::env::var_os(HOME_ENV)
        .map(PathBuf::from)
        .unwrap_or_default()
}

fn default_autodetect_program() -> String {
    "prelert_autodetect_api".to_string()
}

fn default_normalize_program() -> String {
    "prelert_normalize_api".to_string()
}

fn default_max_anomaly_records() -> Option<u32> {
    Some(500)
}

fn default_busy_reschedule() -> Duration {
    Duration::from_secs(10)
}

fn default_stderr_capture_lines() -> usize {
    100
}

fn default_max_discard_percent() -> f64 {
    25.0
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            autodetect_program: default_autodetect_program(),
            normalize_program: default_normalize_program(),
            config_dir: None,
            max_anomaly_records: default_max_anomaly_records(),
            stop_retry: RetryPolicy::default(),
            busy_reschedule: default_busy_reschedule(),
            byte_order: ByteOrder::default(),
            temp_dir: None,
            stderr_capture_lines: default_stderr_capture_lines(),
            max_discard_percent: default_max_discard_percent(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration rooted at `home`
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from a TOML string
    ///
    /// ```
    /// use jobproc_core::RuntimeConfig;
    ///
    /// let config = RuntimeConfig::from_toml_str(r#"
    ///     home = "/opt/engine"
    ///     busy_reschedule = 5
    ///     [stop_retry]
    ///     interval = 2
    ///     max_attempts = 10
    /// "#)?;
    /// assert_eq!(config.stop_retry.max_attempts, 10);
    /// # Ok::<(), jobproc_core::Error>(())
    /// ```
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| Error::Configuration(format!("Failed to parse TOML config: {}", e)))
    }

    /// Load `jobproc.toml` from the current directory, or defaults if absent
    pub fn from_default_file() -> Result<Self> {
        let path = Path::new("jobproc.toml");
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Set the shutdown retry policy
    pub fn with_stop_retry(mut self, policy: RetryPolicy) -> Self {
        self.stop_retry = policy;
        self
    }

    /// Set the busy reschedule delay
    pub fn with_busy_reschedule(mut self, delay: Duration) -> Self {
        self.busy_reschedule = delay;
        self
    }

    /// Set the temporary directory
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Set the wire byte order
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Directory holding the optional model config file
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| self.home.join("config"))
    }

    /// Directory for temporary files
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = RuntimeConfig::from_toml_str(r#"home = "/opt/engine""#).unwrap();
        assert_eq!(config.home, PathBuf::from("/opt/engine"));
        assert_eq!(config.autodetect_program, "prelert_autodetect_api");
        assert_eq!(config.max_anomaly_records, Some(500));
        assert_eq!(config.stop_retry, RetryPolicy::default());
        assert_eq!(config.byte_order, ByteOrder::BigEndian);
        assert_eq!(config.config_dir(), PathBuf::from("/opt/engine/config"));
    }

    #[test]
    fn test_fractional_durations() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            busy_reschedule = 0.25
            byte_order = "little_endian"
            [stop_retry]
            interval = 0.5
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.busy_reschedule, Duration::from_millis(250));
        assert_eq!(config.stop_retry.interval, Duration::from_millis(500));
        assert_eq!(config.byte_order, ByteOrder::LittleEndian);
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = RuntimeConfig::from_toml_str("home = [").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_retry_policy_needs_one_attempt() {
        assert_eq!(RetryPolicy::new(Duration::ZERO, 0).max_attempts, 1);
    }

    #[test]
    fn test_zero_attempts_from_toml_is_one() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [stop_retry]
            interval = 1
            max_attempts = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.stop_retry.max_attempts, 1);
    }
}
