//! Job-side data model supplied by the job configuration collaborator

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Time field name used when the data description does not name one
pub const DEFAULT_TIME_FIELD: &str = "time";

/// Field delimiter the worker assumes unless told otherwise
pub const DEFAULT_DELIMITER: char = '\t';

/// Default quote character for delimited input
pub const DEFAULT_QUOTE_CHAR: char = '"';

/// Encoding of the caller's input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Delimited text with a header row
    #[default]
    Delimited,
    /// A stream of JSON objects, optionally wrapped in an array
    Json,
}

/// How the time field of each record is encoded
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TimeFormat {
    /// Seconds since the Unix epoch (fractional part discarded)
    #[default]
    EpochSeconds,
    /// Milliseconds since the Unix epoch
    EpochMillis,
    /// A `chrono` strftime-style pattern such as `%Y-%m-%d %H:%M:%S`
    Pattern(String),
}

impl TimeFormat {
    /// Parse the configuration spelling: `epoch`, `epoch_ms` or a pattern
    pub fn parse(value: &str) -> Self {
        match value {
            "" | "epoch" => TimeFormat::EpochSeconds,
            "epoch_ms" => TimeFormat::EpochMillis,
            pattern => TimeFormat::Pattern(pattern.to_string()),
        }
    }

    /// Configuration spelling of this format
    pub fn as_str(&self) -> &str {
        match self {
            TimeFormat::EpochSeconds => "epoch",
            TimeFormat::EpochMillis => "epoch_ms",
            TimeFormat::Pattern(pattern) => pattern,
        }
    }
}

impl fmt::Display for TimeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TimeFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TimeFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(TimeFormat::parse(&value))
    }
}

/// Describes the layout of the data sent to a job. Immutable once the
/// worker is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDescription {
    /// Input encoding
    #[serde(default)]
    pub format: DataFormat,

    /// Field delimiter for delimited input
    #[serde(default = "default_delimiter")]
    pub field_delimiter: char,

    /// Quote character for delimited input
    #[serde(default = "default_quote")]
    pub quote_character: char,

    /// Name of the time field
    #[serde(default = "default_time_field")]
    pub time_field: String,

    /// Encoding of the time field
    #[serde(default)]
    pub time_format: TimeFormat,

    /// Project, convert and frame records before sending. When false the
    /// input is copied to the worker untouched.
    #[serde(default = "default_transform")]
    pub transform: bool,
}

fn default_delimiter() -> char {
    DEFAULT_DELIMITER
}

fn default_quote() -> char {
    DEFAULT_QUOTE_CHAR
}

fn default_time_field() -> String {
    DEFAULT_TIME_FIELD.to_string()
}

fn default_transform() -> bool {
    true
}

impl Default for DataDescription {
    fn default() -> Self {
        Self {
            format: DataFormat::default(),
            field_delimiter: DEFAULT_DELIMITER,
            quote_character: DEFAULT_QUOTE_CHAR,
            time_field: default_time_field(),
            time_format: TimeFormat::default(),
            transform: true,
        }
    }
}

impl DataDescription {
    /// Delimited input with the given delimiter
    pub fn delimited(delimiter: char) -> Self {
        Self {
            field_delimiter: delimiter,
            ..Self::default()
        }
    }

    /// JSON input
    pub fn json() -> Self {
        Self {
            format: DataFormat::Json,
            ..Self::default()
        }
    }

    /// Set the time field name
    pub fn with_time_field(mut self, name: impl Into<String>) -> Self {
        self.time_field = name.into();
        self
    }

    /// Set the time format
    pub fn with_time_format(mut self, format: TimeFormat) -> Self {
        self.time_format = format;
        self
    }

    /// Enable or disable record transformation
    pub fn with_transform(mut self, transform: bool) -> Self {
        self.transform = transform;
        self
    }
}

/// One configured analysis function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detector {
    /// Analysis function, e.g. `mean` or `count`
    #[serde(default)]
    pub function: Option<String>,
    /// Field the function is applied to
    #[serde(default)]
    pub field_name: Option<String>,
    /// Split field (per value)
    #[serde(default)]
    pub by_field_name: Option<String>,
    /// Population field
    #[serde(default)]
    pub over_field_name: Option<String>,
    /// Partition field
    #[serde(default)]
    pub partition_field_name: Option<String>,
    /// Treat missing by/over values as a value of their own
    #[serde(default)]
    pub use_null: Option<bool>,
    /// Exclude frequent values (`by`, `over`, `all`)
    #[serde(default)]
    pub exclude_frequent: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl Detector {
    /// Detector applying `function` to `field`
    pub fn new(function: impl Into<String>, field: Option<&str>) -> Self {
        Self {
            function: Some(function.into()),
            field_name: field.map(str::to_string),
            ..Self::default()
        }
    }

    /// Set the by field
    pub fn by(mut self, field: impl Into<String>) -> Self {
        self.by_field_name = Some(field.into());
        self
    }

    /// Set the over field
    pub fn over(mut self, field: impl Into<String>) -> Self {
        self.over_field_name = Some(field.into());
        self
    }

    /// Set the partition field
    pub fn partition(mut self, field: impl Into<String>) -> Self {
        self.partition_field_name = Some(field.into());
        self
    }

    /// Set the use-null flag
    pub fn use_null(mut self, use_null: bool) -> Self {
        self.use_null = Some(use_null);
        self
    }

    /// Function token understood by the worker: `fn(field)`, `fn`, `field`
    /// or `count` when nothing is configured.
    pub fn function_token(&self) -> String {
        match (non_empty(&self.function), non_empty(&self.field_name)) {
            (Some(function), Some(field)) => format!("{}({})", function, field),
            (Some(function), None) => function.to_string(),
            (None, Some(field)) => field.to_string(),
            (None, None) => "count".to_string(),
        }
    }

    /// Key identifying this detector in the field config file
    pub fn key(&self) -> String {
        let mut key = self.function_token();
        for part in [self.by_field(), self.over_field(), self.partition_field()].into_iter().flatten() {
            key.push('-');
            key.push_str(part);
        }
        key
    }

    pub(crate) fn by_field(&self) -> Option<&str> {
        non_empty(&self.by_field_name)
    }

    pub(crate) fn over_field(&self) -> Option<&str> {
        non_empty(&self.over_field_name)
    }

    pub(crate) fn partition_field(&self) -> Option<&str> {
        non_empty(&self.partition_field_name)
    }

    pub(crate) fn analysed_field(&self) -> Option<&str> {
        non_empty(&self.field_name)
    }

    pub(crate) fn exclude_frequent_value(&self) -> Option<&str> {
        non_empty(&self.exclude_frequent)
    }
}

/// Analysis parameters of a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Bucket span in seconds
    #[serde(default)]
    pub bucket_span: Option<u64>,
    /// Batch span in seconds
    #[serde(default)]
    pub batch_span: Option<u64>,
    /// Period in seconds
    #[serde(default)]
    pub period: Option<u64>,
    /// Configured detectors
    #[serde(default)]
    pub detectors: Vec<Detector>,
}

impl AnalysisConfig {
    /// Config with the given detectors and no time parameters
    pub fn with_detectors(detectors: Vec<Detector>) -> Self {
        Self {
            detectors,
            ..Self::default()
        }
    }

    /// Every field referenced by a detector, first occurrence order,
    /// empty names removed
    pub fn analysis_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for detector in &self.detectors {
            let referenced = [
                detector.analysed_field(),
                detector.by_field(),
                detector.over_field(),
                detector.partition_field(),
            ];
            for field in referenced.into_iter().flatten() {
                if !fields.iter().any(|f| f == field) {
                    fields.push(field.to_string());
                }
            }
        }
        fields
    }
}

/// Numeric resource limits written to the worker's limits file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisLimits {
    /// Maximum distinct values per analysed field
    #[serde(default)]
    pub max_field_values: Option<u64>,
    /// Maximum number of time buckets kept in the model
    #[serde(default)]
    pub max_time_buckets: Option<u64>,
}

/// Everything the launcher needs to know about a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    /// Stable job identifier
    pub id: String,
    /// Analysis parameters
    #[serde(default)]
    pub analysis_config: Option<AnalysisConfig>,
    /// Resource limits
    #[serde(default)]
    pub analysis_limits: Option<AnalysisLimits>,
    /// Input layout
    #[serde(default)]
    pub data_description: DataDescription,
    /// Idle time after which the worker is finished automatically
    #[serde(default = "default_timeout", with = "timeout_secs")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(600)
}

mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl JobDetails {
    /// Job with default data description and timeout
    pub fn new(id: impl Into<String>, analysis_config: AnalysisConfig) -> Self {
        Self {
            id: id.into(),
            analysis_config: Some(analysis_config),
            analysis_limits: None,
            data_description: DataDescription::default(),
            timeout: default_timeout(),
        }
    }

    /// Set the data description
    pub fn with_data_description(mut self, dd: DataDescription) -> Self {
        self.data_description = dd;
        self
    }

    /// Set the idle timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the analysis limits
    pub fn with_limits(mut self, limits: AnalysisLimits) -> Self {
        self.analysis_limits = Some(limits);
        self
    }

    /// Fields the worker analyses, excluding the time field
    pub fn analysis_fields(&self) -> Vec<String> {
        self.analysis_config
            .as_ref()
            .map(AnalysisConfig::analysis_fields)
            .unwrap_or_default()
    }
}

/// Serialized model state per detector key, restored into a fresh worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    detector_states: BTreeMap<String, String>,
}

impl PersistedState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the state of one detector
    pub fn insert(&mut self, detector_key: impl Into<String>, state: impl Into<String>) {
        self.detector_states.insert(detector_key.into(), state.into());
    }

    /// True if no detector has state
    pub fn is_empty(&self) -> bool {
        self.detector_states.is_empty()
    }

    /// Number of detectors with state
    pub fn len(&self) -> usize {
        self.detector_states.len()
    }

    /// Detector states in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.detector_states
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for PersistedState {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            detector_states: iter.into_iter().collect(),
        }
    }
}

/// Completion status reported back to the job collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Worker is running
    Running,
    /// Worker finished cleanly
    Closed,
    /// Worker failed
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_keys() {
        assert_eq!(Detector::default().key(), "count");
        assert_eq!(Detector::new("mean", Some("responsetime")).key(), "mean(responsetime)");
        assert_eq!(
            Detector::new("mean", Some("responsetime")).by("airline").key(),
            "mean(responsetime)-airline"
        );
        let full = Detector::new("sum", Some("bytes"))
            .by("host")
            .over("user")
            .partition("dc");
        assert_eq!(full.key(), "sum(bytes)-host-user-dc");
    }

    #[test]
    fn test_analysis_fields_are_unique_and_ordered() {
        let config = AnalysisConfig::with_detectors(vec![
            Detector::new("mean", Some("responsetime")).by("airline"),
            Detector::new("count", None).by("airline").partition("region"),
            Detector {
                field_name: Some(String::new()),
                ..Detector::default()
            },
        ]);
        assert_eq!(
            config.analysis_fields(),
            vec!["responsetime", "airline", "region"]
        );
    }

    #[test]
    fn test_time_format_spelling() {
        assert_eq!(TimeFormat::parse("epoch"), TimeFormat::EpochSeconds);
        assert_eq!(TimeFormat::parse("epoch_ms"), TimeFormat::EpochMillis);
        assert_eq!(
            TimeFormat::parse("%Y-%m-%d"),
            TimeFormat::Pattern("%Y-%m-%d".to_string())
        );

        let dd: DataDescription =
            serde_json::from_str(r#"{"format":"json","time_format":"epoch_ms"}"#).unwrap();
        assert_eq!(dd.format, DataFormat::Json);
        assert_eq!(dd.time_format, TimeFormat::EpochMillis);
        assert_eq!(dd.time_field, DEFAULT_TIME_FIELD);
        assert!(dd.transform);
    }

    #[test]
    fn test_persisted_state_is_key_ordered() {
        let mut state = PersistedState::new();
        state.insert("b", "2");
        state.insert("a", "1");
        let keys: Vec<_> = state.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(state.len(), 2);
    }
}
