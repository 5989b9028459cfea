//! Command lines of the analytics and normalizer workers

use super::environment::Installation;
use super::files::{self, TempArtifacts};
use super::launcher::NormalizerInitState;
use crate::config::RuntimeConfig;
use crate::job::{Detector, JobDetails, PersistedState, TimeFormat, DEFAULT_DELIMITER};
use crate::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const BUCKET_SPAN_ARG: &str = "--bucketspan=";
pub const BATCH_SPAN_ARG: &str = "--batchspan=";
pub const PERIOD_ARG: &str = "--period=";
pub const LIMIT_CONFIG_ARG: &str = "--limitconfig=";
pub const MODEL_CONFIG_ARG: &str = "--modelconfig=";
pub const FIELD_CONFIG_ARG: &str = "--fieldconfig=";
pub const LENGTH_ENCODED_INPUT_ARG: &str = "--lengthEncodedInput";
pub const MAX_ANOMALY_RECORDS_ARG: &str = "--maxAnomalyRecords=";
pub const DELIMITER_ARG: &str = "--delimiter=";
pub const TIME_FIELD_ARG: &str = "--timefield=";
pub const TIME_FORMAT_ARG: &str = "--timeformat=";
pub const RESTORE_STATE_ARG: &str = "--restoreState=";
pub const DELETE_STATE_FILES_ARG: &str = "--deleteStateFiles";
pub const PERSIST_STATE_ARG: &str = "--persistState";
pub const LOG_ID_ARG: &str = "--logid=";
pub const USE_NULL_ARG: &str = "--usenull=";
pub const PARTITION_FIELD_ARG: &str = "--partitionfield=";
pub const SYS_CHANGE_STATE_ARG: &str = "--sysChangeState=";
pub const UNUSUAL_STATE_ARG: &str = "--unusualState=";
pub const VERSION_ARG: &str = "--version";
pub const INFO_ARG: &str = "--info";

/// Name of the optional model config file in the config directory
pub const MODEL_CONFIG_FILE: &str = "prelertmodel.conf";

/// Program path plus arguments, kept as text for logging and inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    /// Command running `program` without arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Program path
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments in order
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// True if an argument equals `arg` or starts with it (for `--flag=`)
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args
            .iter()
            .any(|a| a == arg || (arg.ends_with('=') && a.starts_with(arg)))
    }

    /// Value of the first `--flag=value` argument
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args.iter().find_map(|a| a.strip_prefix(flag))
    }

    /// OS command with piped stdio and only the installation environment
    pub fn to_command(&self, installation: &Installation) -> Result<Command> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        installation.apply(&mut command)?;
        Ok(command)
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn path_arg(flag: &str, path: &Path) -> String {
    format!("{}{}", flag, path.display())
}

fn model_config_path(config: &RuntimeConfig) -> Option<PathBuf> {
    let path = config.config_dir().join(MODEL_CONFIG_FILE);
    path.is_file().then_some(path)
}

/// Analytics worker command for `job`. Temporary files it references are
/// added to `artifacts`.
pub fn autodetect_command(
    config: &RuntimeConfig,
    job: &JobDetails,
    state: Option<&PersistedState>,
    artifacts: &mut TempArtifacts,
) -> Result<WorkerCommand> {
    let analysis = job.analysis_config.as_ref().ok_or_else(|| {
        Error::Configuration(format!("Job '{}' has no analysis configuration", job.id))
    })?;
    if analysis.detectors.is_empty() {
        return Err(Error::Configuration(format!(
            "Job '{}' has no detectors configured",
            job.id
        )));
    }

    let installation = Installation::new(&config.home);
    let temp_dir = config.temp_dir();
    let mut command = WorkerCommand::new(installation.program(&config.autodetect_program));

    if let Some(span) = analysis.bucket_span {
        command.arg(format!("{}{}", BUCKET_SPAN_ARG, span));
    }
    if let Some(span) = analysis.batch_span {
        command.arg(format!("{}{}", BATCH_SPAN_ARG, span));
    }
    if let Some(period) = analysis.period {
        command.arg(format!("{}{}", PERIOD_ARG, period));
    }

    if let Some(limits) = &job.analysis_limits {
        let contents = files::limits_contents(limits);
        let path = artifacts.push_file(files::write_temp_file(
            &temp_dir,
            "limitconfig",
            ".conf",
            &contents,
        )?);
        command.arg(path_arg(LIMIT_CONFIG_ARG, &path));
    }

    if let Some(path) = model_config_path(config) {
        command.arg(path_arg(MODEL_CONFIG_ARG, &path));
    }

    command.arg(LENGTH_ENCODED_INPUT_ARG);

    if let Some(max) = config.max_anomaly_records {
        command.arg(format!("{}{}", MAX_ANOMALY_RECORDS_ARG, max));
    }

    let description = &job.data_description;
    if description.field_delimiter != DEFAULT_DELIMITER {
        command.arg(format!("{}{}", DELIMITER_ARG, description.field_delimiter));
    }
    command.arg(format!("{}{}", TIME_FIELD_ARG, description.time_field));
    // Transformed records always carry epoch seconds
    if !description.transform && description.time_format != TimeFormat::EpochSeconds {
        command.arg(format!("{}{}", TIME_FORMAT_ARG, description.time_format));
    }

    if let Some(state) = state.filter(|s| !s.is_empty()) {
        tracing::info!("Restoring {} detector states for job '{}'", state.len(), job.id);
        let (dir, prefix) = files::write_state_files(&temp_dir, state)?;
        artifacts.push_dir(dir);
        command.arg(path_arg(RESTORE_STATE_ARG, &prefix));
        command.arg(DELETE_STATE_FILES_ARG);
    }

    command.arg(PERSIST_STATE_ARG);
    command.arg(format!("{}{}", LOG_ID_ARG, job.id));

    match analysis.detectors.as_slice() {
        [single] if single.exclude_frequent_value().is_none() => {
            for token in detector_args(single) {
                command.arg(token);
            }
        }
        detectors => {
            let contents = files::field_config_contents(detectors);
            tracing::debug!("Field config for job '{}':\n{}", job.id, contents);
            let path = artifacts.push_file(files::write_temp_file(
                &temp_dir,
                "fieldconfig",
                ".conf",
                &contents,
            )?);
            command.arg(path_arg(FIELD_CONFIG_ARG, &path));
        }
    }

    Ok(command)
}

/// Command line tokens describing a single detector
pub fn detector_args(detector: &Detector) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(use_null) = detector.use_null {
        args.push(format!("{}{}", USE_NULL_ARG, use_null));
    }
    args.push(detector.function_token());
    if let Some(by) = detector.by_field() {
        args.push("by".to_string());
        args.push(by.to_string());
    }
    if let Some(over) = detector.over_field() {
        args.push("over".to_string());
        args.push(over.to_string());
    }
    if let Some(partition) = detector.partition_field() {
        args.push(format!("{}{}", PARTITION_FIELD_ARG, partition));
    }
    args
}

/// Normalizer command for `job_id`, writing any supplied init-state tables
pub fn normalizer_command(
    config: &RuntimeConfig,
    job_id: &str,
    init_state: &NormalizerInitState,
    bucket_span: Option<u64>,
    artifacts: &mut TempArtifacts,
) -> Result<WorkerCommand> {
    let installation = Installation::new(&config.home);
    let temp_dir = config.temp_dir();
    let mut command = WorkerCommand::new(installation.program(&config.normalize_program));

    if let Some(rows) = &init_state.sys_change {
        let path = artifacts.push_file(files::write_csv_table(
            &temp_dir,
            &format!("{}_sys_change_", job_id),
            &["t", "a"],
            rows,
        )?);
        command.arg(path_arg(SYS_CHANGE_STATE_ARG, &path));
    }
    if let Some(rows) = &init_state.unusual {
        let path = artifacts.push_file(files::write_csv_table(
            &temp_dir,
            &format!("{}_unusual_", job_id),
            &["t", "p", "d"],
            rows,
        )?);
        command.arg(path_arg(UNUSUAL_STATE_ARG, &path));
    }
    if init_state.sys_change.is_some() || init_state.unusual.is_some() {
        command.arg(DELETE_STATE_FILES_ARG);
    }

    if let Some(span) = bucket_span {
        command.arg(format!("{}{}", BUCKET_SPAN_ARG, span));
    }
    command.arg(format!("{}{}", LOG_ID_ARG, job_id));
    command.arg(LENGTH_ENCODED_INPUT_ARG);
    if let Some(path) = model_config_path(config) {
        command.arg(path_arg(MODEL_CONFIG_ARG, &path));
    }

    Ok(command)
}

/// `program --version` or `program --info`
pub fn query_command(config: &RuntimeConfig, flag: &str) -> WorkerCommand {
    let installation = Installation::new(&config.home);
    let mut command = WorkerCommand::new(installation.program(&config.autodetect_program));
    command.arg(flag);
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AnalysisConfig;

    #[test]
    fn test_detector_args() {
        let detector = Detector::new("mean", Some("responsetime"))
            .by("airline")
            .over("region")
            .partition("dc")
            .use_null(true);
        assert_eq!(
            detector_args(&detector),
            vec![
                "--usenull=true",
                "mean(responsetime)",
                "by",
                "airline",
                "over",
                "region",
                "--partitionfield=dc"
            ]
        );
        assert_eq!(detector_args(&Detector::default()), vec!["count"]);
    }

    #[test]
    fn test_missing_detectors_is_configuration_error() {
        let config = RuntimeConfig::new("/opt/engine");
        let mut artifacts = TempArtifacts::default();

        let job = JobDetails::new("j", AnalysisConfig::default());
        let err = autodetect_command(&config, &job, None, &mut artifacts).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let mut job = JobDetails::new("j", AnalysisConfig::default());
        job.analysis_config = None;
        let err = autodetect_command(&config, &job, None, &mut artifacts).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_display_joins_arguments() {
        let mut command = WorkerCommand::new("/opt/engine/bin/worker");
        command.arg("--logid=j").arg(LENGTH_ENCODED_INPUT_ARG);
        assert_eq!(
            command.to_string(),
            "/opt/engine/bin/worker --logid=j --lengthEncodedInput"
        );
        assert!(command.has_arg(LOG_ID_ARG));
        assert_eq!(command.arg_value(LOG_ID_ARG), Some("j"));
        assert!(!command.has_arg(PERSIST_STATE_ARG));
    }
}
