//! Integration tests for worker command lines, temporary files and queries

mod common;

use common::{FakeHome, AUTODETECT};
use jobproc_core::process::command::{
    self, DELETE_STATE_FILES_ARG, FIELD_CONFIG_ARG, LENGTH_ENCODED_INPUT_ARG, LIMIT_CONFIG_ARG,
    MODEL_CONFIG_ARG, PERSIST_STATE_ARG, RESTORE_STATE_ARG, SYS_CHANGE_STATE_ARG,
    TIME_FORMAT_ARG, UNUSUAL_STATE_ARG,
};
use jobproc_core::process::{
    SysChangeStateRow, TempArtifacts, UnusualStateRow, EMPTY_INFO, UNKNOWN_VERSION,
};
use jobproc_core::{
    AnalysisConfig, AnalysisLimits, DataDescription, Detector, Error, JobDetails,
    LoggingResultsReaderFactory, NormalizerInitState, PersistedState, RuntimeConfig, TimeFormat,
    WorkerLauncher,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn config(home: &FakeHome) -> RuntimeConfig {
    RuntimeConfig::new(home.path()).with_temp_dir(home.temp_dir())
}

fn single_detector_job() -> JobDetails {
    JobDetails::new(
        "farequote",
        AnalysisConfig::with_detectors(vec![Detector::new("mean", Some("responsetime"))
            .by("airline")]),
    )
}

#[test]
fn test_state_restore_writes_one_file_per_detector() {
    let home = FakeHome::new();
    let mut state = PersistedState::new();
    state.insert("mean(responsetime)-airline", "<state a/>");
    state.insert("count", "<state b/>");
    state.insert("max(bytes)", "<state c/>");

    let mut artifacts = TempArtifacts::default();
    let cmd = command::autodetect_command(
        &config(&home),
        &single_detector_job(),
        Some(&state),
        &mut artifacts,
    )
    .unwrap();

    let restore: Vec<&String> = cmd
        .args()
        .iter()
        .filter(|a| a.starts_with(RESTORE_STATE_ARG))
        .collect();
    assert_eq!(restore.len(), 1);
    assert!(cmd.has_arg(DELETE_STATE_FILES_ARG));

    let prefix = Path::new(cmd.arg_value(RESTORE_STATE_ARG).unwrap());
    let dir = prefix.parent().unwrap();
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["model_state1.xml", "model_state2.xml", "model_state3.xml"]
    );
    assert_eq!(
        fs::read_to_string(dir.join("model_state1.xml")).unwrap(),
        "<state b/>\n"
    );
}

#[test]
fn test_no_state_means_no_restore_arguments() {
    let home = FakeHome::new();
    let mut artifacts = TempArtifacts::default();
    let cmd = command::autodetect_command(
        &config(&home),
        &single_detector_job(),
        Some(&PersistedState::new()),
        &mut artifacts,
    )
    .unwrap();

    assert!(!cmd.has_arg(RESTORE_STATE_ARG));
    assert!(!cmd.has_arg(DELETE_STATE_FILES_ARG));
    assert!(cmd.has_arg(PERSIST_STATE_ARG));
    assert!(cmd.has_arg(LENGTH_ENCODED_INPUT_ARG));
    assert_eq!(artifacts.files().count(), 0);
    assert_eq!(artifacts.dirs().count(), 0);
}

#[test]
fn test_single_detector_uses_plain_tokens() {
    let home = FakeHome::new();
    let job = JobDetails::new(
        "j1",
        AnalysisConfig {
            bucket_span: Some(300),
            period: Some(86400),
            ..AnalysisConfig::with_detectors(vec![Detector::new("count", None)
                .by("status")
                .partition("host")])
        },
    );
    let mut artifacts = TempArtifacts::default();
    let cmd = command::autodetect_command(&config(&home), &job, None, &mut artifacts).unwrap();

    let args = cmd.args();
    assert_eq!(args[0], "--bucketspan=300");
    assert_eq!(args[1], "--period=86400");
    assert!(!cmd.has_arg(FIELD_CONFIG_ARG));
    assert!(!cmd.has_arg(LIMIT_CONFIG_ARG));
    assert!(!cmd.has_arg("--batchspan="));
    assert_eq!(cmd.arg_value("--logid="), Some("j1"));
    assert_eq!(cmd.arg_value("--timefield="), Some("time"));
    assert_eq!(cmd.arg_value("--maxAnomalyRecords="), Some("500"));
    assert_eq!(
        &args[args.len() - 4..],
        &["count", "by", "status", "--partitionfield=host"]
    );
}

#[test]
fn test_multiple_detectors_write_field_config() {
    let home = FakeHome::new();
    let job = JobDetails::new(
        "j2",
        AnalysisConfig::with_detectors(vec![
            Detector::new("mean", Some("responsetime")).by("airline"),
            Detector::new("count", None),
            Detector::new("mean", Some("responsetime")).by("airline"),
            Detector::new("sum", Some("bytes"))
                .over("client")
                .use_null(true),
        ]),
    );
    let mut artifacts = TempArtifacts::default();
    let cmd = command::autodetect_command(&config(&home), &job, None, &mut artifacts).unwrap();

    let path = cmd.arg_value(FIELD_CONFIG_ARG).unwrap();
    assert_eq!(
        fs::read_to_string(path).unwrap(),
        "mean(responsetime)-airline.by = airline\n\
         count.isEnabled = true\n\
         sum(bytes)-client.useNull = true\n\
         sum(bytes)-client.over = client\n"
    );
    assert!(!cmd.has_arg("count"));
}

#[test]
fn test_exclude_frequent_forces_field_config() {
    let home = FakeHome::new();
    let mut detector = Detector::new("rare", None).by("process");
    detector.exclude_frequent = Some("all".to_string());
    let job = JobDetails::new("j3", AnalysisConfig::with_detectors(vec![detector]));

    let mut artifacts = TempArtifacts::default();
    let cmd = command::autodetect_command(&config(&home), &job, None, &mut artifacts).unwrap();
    let contents = fs::read_to_string(cmd.arg_value(FIELD_CONFIG_ARG).unwrap()).unwrap();
    assert_eq!(
        contents,
        "rare-process.excludefrequent = all\nrare-process.by = process\n"
    );
}

#[test]
fn test_missing_detectors_is_configuration_error() {
    let home = FakeHome::new();
    let mut artifacts = TempArtifacts::default();

    let empty = JobDetails::new("j4", AnalysisConfig::default());
    assert!(matches!(
        command::autodetect_command(&config(&home), &empty, None, &mut artifacts),
        Err(Error::Configuration(_))
    ));

    let mut no_config = empty.clone();
    no_config.analysis_config = None;
    assert!(matches!(
        command::autodetect_command(&config(&home), &no_config, None, &mut artifacts),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn test_limits_file_and_cleanup() {
    let home = FakeHome::new();
    let job = single_detector_job().with_limits(AnalysisLimits {
        max_field_values: Some(1000),
        max_time_buckets: Some(0),
    });

    let mut artifacts = TempArtifacts::default();
    let cmd = command::autodetect_command(&config(&home), &job, None, &mut artifacts).unwrap();
    let path = cmd.arg_value(LIMIT_CONFIG_ARG).unwrap().to_string();
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "[anomaly]\nmaxfieldvalues = 1000\n"
    );
    assert_eq!(home.temp_entries(), 1);

    drop(artifacts);
    assert!(!Path::new(&path).exists());
    assert_eq!(home.temp_entries(), 0);
}

#[test]
fn test_model_config_only_when_present() {
    let home = FakeHome::new();
    let mut artifacts = TempArtifacts::default();
    let cmd = command::autodetect_command(&config(&home), &single_detector_job(), None, &mut artifacts)
        .unwrap();
    assert!(!cmd.has_arg(MODEL_CONFIG_ARG));

    let model_config = home.path().join("config").join(command::MODEL_CONFIG_FILE);
    fs::write(&model_config, "[model]\n").unwrap();
    let cmd = command::autodetect_command(&config(&home), &single_detector_job(), None, &mut artifacts)
        .unwrap();
    assert_eq!(
        cmd.arg_value(MODEL_CONFIG_ARG),
        Some(model_config.to_str().unwrap())
    );
}

#[test]
fn test_time_format_only_for_untransformed_patterns() {
    let home = FakeHome::new();
    let mut artifacts = TempArtifacts::default();
    let pattern = TimeFormat::Pattern("%Y-%m-%dT%H:%M:%S".to_string());

    let transformed = single_detector_job().with_data_description(
        DataDescription::delimited(',').with_time_format(pattern.clone()),
    );
    let cmd = command::autodetect_command(&config(&home), &transformed, None, &mut artifacts)
        .unwrap();
    assert!(!cmd.has_arg(TIME_FORMAT_ARG));
    assert_eq!(cmd.arg_value("--delimiter="), Some(","));

    let raw = single_detector_job().with_data_description(
        DataDescription::default()
            .with_time_format(pattern)
            .with_transform(false),
    );
    let cmd = command::autodetect_command(&config(&home), &raw, None, &mut artifacts).unwrap();
    assert_eq!(cmd.arg_value(TIME_FORMAT_ARG), Some("%Y-%m-%dT%H:%M:%S"));
    assert!(!cmd.has_arg("--delimiter="));
}

#[test]
fn test_normalizer_tables() {
    let home = FakeHome::new();
    let init = NormalizerInitState {
        sys_change: Some(vec![SysChangeStateRow {
            time: 1350824400,
            anomaly_score: 12.5,
        }]),
        unusual: Some(vec![UnusualStateRow {
            time: 1350824400,
            probability: 0.01,
            deviation: 3.0,
        }]),
    };

    let mut artifacts = TempArtifacts::default();
    let cmd =
        command::normalizer_command(&config(&home), "j5", &init, Some(600), &mut artifacts).unwrap();
    assert!(cmd.program().ends_with("bin/prelert_normalize_api"));
    assert!(cmd.has_arg(DELETE_STATE_FILES_ARG));
    assert_eq!(cmd.arg_value("--bucketspan="), Some("600"));

    let sys_change = fs::read_to_string(cmd.arg_value(SYS_CHANGE_STATE_ARG).unwrap()).unwrap();
    assert_eq!(sys_change, "t,a\n1350824400,12.5\n");
    let unusual = fs::read_to_string(cmd.arg_value(UNUSUAL_STATE_ARG).unwrap()).unwrap();
    assert_eq!(unusual, "t,p,d\n1350824400,0.01,3.0\n");

    let mut artifacts = TempArtifacts::default();
    let cmd = command::normalizer_command(
        &config(&home),
        "j5",
        &NormalizerInitState::default(),
        None,
        &mut artifacts,
    )
    .unwrap();
    assert!(!cmd.has_arg(SYS_CHANGE_STATE_ARG));
    assert!(!cmd.has_arg(UNUSUAL_STATE_ARG));
    assert!(!cmd.has_arg(DELETE_STATE_FILES_ARG));
}

#[test]
fn test_queries_fall_back_without_binary() {
    let home = FakeHome::new();
    let launcher = WorkerLauncher::new(config(&home), Arc::new(LoggingResultsReaderFactory));
    assert_eq!(launcher.version(), UNKNOWN_VERSION);
    assert_eq!(launcher.info(), EMPTY_INFO);
}

#[cfg(unix)]
#[test]
fn test_version_is_cached_after_first_success() {
    let home = FakeHome::new();
    let launcher = WorkerLauncher::new(config(&home), Arc::new(LoggingResultsReaderFactory));

    home.install(AUTODETECT, "#!/bin/sh\necho 'broken install' >&2\nexit 3\n");
    assert_eq!(launcher.version(), UNKNOWN_VERSION);

    home.install(
        AUTODETECT,
        "#!/bin/sh\necho '' >&2\necho 'Model State Version 20' >&2\n",
    );
    assert_eq!(launcher.version(), "Model State Version 20");

    home.install(AUTODETECT, "#!/bin/sh\necho 'Model State Version 21' >&2\n");
    assert_eq!(launcher.version(), "Model State Version 20");
}

#[cfg(target_os = "linux")]
#[test]
fn test_worker_environment_is_replaced() {
    let home = FakeHome::new();
    home.install(
        AUTODETECT,
        "#!/bin/sh\necho \"$PRELERT_HOME|$LD_LIBRARY_PATH|${HOME:-unset}\"\n",
    );
    let launcher = WorkerLauncher::new(config(&home), Arc::new(LoggingResultsReaderFactory));

    let home_path = home.path().display().to_string();
    assert_eq!(
        launcher.info(),
        format!("{0}|{0}/lib:{0}/cots/lib|unset", home_path)
    );
}

#[cfg(unix)]
#[test]
fn test_create_worker_wires_handle() {
    let home = FakeHome::new();
    home.install(AUTODETECT, common::CONSUME_INPUT);
    let launcher = WorkerLauncher::new(config(&home), Arc::new(LoggingResultsReaderFactory));
    let job = single_detector_job().with_data_description(DataDescription::delimited(','));

    let handle = launcher.create_worker(&job, None).unwrap();
    assert_eq!(handle.job_id(), "farequote");
    assert_eq!(handle.required_fields(), &["time", "responsetime", "airline"]);
    assert!(handle.command().program().ends_with(AUTODETECT));
    assert!(!handle.is_busy());

    let guard = handle.try_acquire().unwrap();
    assert!(matches!(
        handle.try_acquire(),
        Err(Error::ConcurrencyViolation { .. })
    ));
    assert!(guard.close_and_wait().unwrap().success());
    drop(guard);
    assert!(!handle.is_busy());
}
