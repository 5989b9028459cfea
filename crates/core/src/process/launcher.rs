//! Starting analytics and normalizer workers

use super::command::{self, WorkerCommand, INFO_ARG, VERSION_ARG};
use super::environment::Installation;
use super::files::TempArtifacts;
use super::handle::{StderrCapture, WorkerHandle, WorkerParts};
use crate::collaborators::ResultsReaderFactory;
use crate::config::RuntimeConfig;
use crate::job::{JobDetails, PersistedState};
use crate::pipeline::DataPipeline;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::process::{Child, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::thread;

/// Returned by [`WorkerLauncher::version`] when the worker cannot report one
pub const UNKNOWN_VERSION: &str = "Unknown version of the analytics";

/// Returned by [`WorkerLauncher::info`] when the worker cannot report any
pub const EMPTY_INFO: &str = "{}";

/// One row of the normalizer's system change table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SysChangeStateRow {
    /// Bucket time, epoch seconds
    #[serde(rename = "t")]
    pub time: i64,
    /// Anomaly score
    #[serde(rename = "a")]
    pub anomaly_score: f64,
}

/// One row of the normalizer's unusual behaviour table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnusualStateRow {
    /// Bucket time, epoch seconds
    #[serde(rename = "t")]
    pub time: i64,
    /// Probability
    #[serde(rename = "p")]
    pub probability: f64,
    /// Deviation
    #[serde(rename = "d")]
    pub deviation: f64,
}

/// Tables a normalizer is initialised from; either may be absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizerInitState {
    /// System change table
    pub sys_change: Option<Vec<SysChangeStateRow>>,
    /// Unusual behaviour table
    pub unusual: Option<Vec<UnusualStateRow>>,
}

/// A running normalizer. The caller writes to its stdin and reads its
/// stdout; [`NormalizerHandle::finish`] closes stdin and waits for exit.
#[derive(Debug)]
pub struct NormalizerHandle {
    job_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: StderrCapture,
    command: WorkerCommand,
    _artifacts: TempArtifacts,
}

impl NormalizerHandle {
    /// OS process id
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Command the normalizer was started with
    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Normalizer stdin, until [`NormalizerHandle::finish`] is called
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// Take the normalizer's stdout for reading results
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Close stdin and wait for the normalizer to exit
    pub fn finish(mut self) -> Result<ExitStatus> {
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| Error::launch_io("Failed waiting for normalizer", e))?;
        if status.success() {
            return Ok(status);
        }
        self.stderr.wait_for_eof(std::time::Duration::from_millis(500));
        Err(Error::ProcessLifecycle {
            job_id: self.job_id.clone(),
            message: format!("normalizer exited with {}", status),
            exit_code: status.code(),
            stderr: self.stderr.contents(),
        })
    }
}

/// Builds command lines and starts worker processes
pub struct WorkerLauncher {
    config: RuntimeConfig,
    installation: Installation,
    results: Arc<dyn ResultsReaderFactory>,
    version: OnceLock<String>,
}

impl WorkerLauncher {
    /// Launcher using `results` to consume each worker's stdout
    pub fn new(config: RuntimeConfig, results: Arc<dyn ResultsReaderFactory>) -> Self {
        let installation = Installation::new(&config.home);
        Self {
            config,
            installation,
            results,
            version: OnceLock::new(),
        }
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start the analytics worker for `job`, restoring `state` if given.
    ///
    /// The worker's stdout is handed to a results reader running on its own
    /// thread; its stderr is captured for error reports.
    pub fn create_worker(
        &self,
        job: &JobDetails,
        state: Option<&PersistedState>,
    ) -> Result<WorkerHandle> {
        let span = tracing::info_span!("job", job_id = %job.id);
        let _entered = span.enter();

        let mut artifacts = TempArtifacts::default();
        let command = command::autodetect_command(&self.config, job, state, &mut artifacts)?;
        tracing::info!("Starting analytics worker: {}", command);

        let mut child = command
            .to_command(&self.installation)?
            .spawn()
            .map_err(|e| {
                Error::launch_io(format!("Failed to start {}", command.program().display()), e)
            })?;

        let (stdin, stdout, stderr) = match take_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                abandon(&mut child);
                return Err(e);
            }
        };

        let stderr = match StderrCapture::spawn(
            stderr,
            self.config.stderr_capture_lines,
            format!("stderr-{}", job.id),
            span.clone(),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                abandon(&mut child);
                return Err(Error::launch_io("Failed to start stderr reader", e));
            }
        };

        let reader = self.results.new_results_reader(&job.id, stdout, span.clone());
        if let Err(e) = thread::Builder::new()
            .name(format!("results-{}", job.id))
            .spawn(move || reader.read_results())
        {
            abandon(&mut child);
            return Err(Error::launch_io("Failed to start results reader", e));
        }

        tracing::info!("Analytics worker {} started", child.id());

        let pipeline = DataPipeline::new(
            job.id.clone(),
            job.data_description.clone(),
            &job.analysis_fields(),
            self.config.byte_order,
        );

        Ok(WorkerHandle::new(WorkerParts {
            job_id: job.id.clone(),
            child,
            stdin,
            stderr,
            pipeline,
            timeout: job.timeout,
            span: span.clone(),
            command,
            artifacts,
        }))
    }

    /// Start a normalizer for `job_id`
    pub fn create_normalizer(
        &self,
        job_id: &str,
        init_state: &NormalizerInitState,
        bucket_span: Option<u64>,
    ) -> Result<NormalizerHandle> {
        let span = tracing::info_span!("normalizer", job_id = %job_id);
        let _entered = span.enter();

        let mut artifacts = TempArtifacts::default();
        let command =
            command::normalizer_command(&self.config, job_id, init_state, bucket_span, &mut artifacts)?;
        tracing::info!("Starting normalizer: {}", command);

        let mut child = command
            .to_command(&self.installation)?
            .spawn()
            .map_err(|e| {
                Error::launch_io(format!("Failed to start {}", command.program().display()), e)
            })?;

        let (stdin, stdout, stderr) = match take_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                abandon(&mut child);
                return Err(e);
            }
        };
        let stderr = match StderrCapture::spawn(
            stderr,
            self.config.stderr_capture_lines,
            format!("normalizer-stderr-{}", job_id),
            span.clone(),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                abandon(&mut child);
                return Err(Error::launch_io("Failed to start stderr reader", e));
            }
        };

        Ok(NormalizerHandle {
            job_id: job_id.to_string(),
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr,
            command,
            _artifacts: artifacts,
        })
    }

    /// Version string the worker prints on stderr for `--version`.
    ///
    /// The first successful answer is kept for the life of the launcher;
    /// failures return [`UNKNOWN_VERSION`] and are retried on the next call.
    pub fn version(&self) -> String {
        if let Some(version) = self.version.get() {
            return version.clone();
        }

        match self.query(VERSION_ARG, |output| first_line(&output.stderr)) {
            Some(version) => self.version.get_or_init(|| version).clone(),
            None => UNKNOWN_VERSION.to_string(),
        }
    }

    /// JSON document the worker prints on stdout for `--info`, or
    /// [`EMPTY_INFO`]
    pub fn info(&self) -> String {
        self.query(INFO_ARG, |output| first_line(&output.stdout))
            .unwrap_or_else(|| EMPTY_INFO.to_string())
    }

    fn query<F>(&self, flag: &str, extract: F) -> Option<String>
    where
        F: FnOnce(&std::process::Output) -> Option<String>,
    {
        let command = command::query_command(&self.config, flag);
        tracing::info!("Querying worker: {}", command);

        let mut os_command = match command.to_command(&self.installation) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Cannot query worker: {}", e);
                return None;
            }
        };
        let output = match os_command.stdin(Stdio::null()).output() {
            Ok(output) => output,
            Err(e) => {
                tracing::error!("Failed to run {}: {}", command, e);
                return None;
            }
        };

        if !output.status.success() {
            tracing::error!(
                "{} exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
            return None;
        }
        let value = extract(&output);
        tracing::debug!("{} returned {:?}", command, value);
        value
    }
}

fn first_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn take_pipes(
    child: &mut Child,
) -> Result<(ChildStdin, ChildStdout, std::process::ChildStderr)> {
    match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
        (Some(stdin), Some(stdout), Some(stderr)) => Ok((stdin, stdout, stderr)),
        _ => Err(Error::launch_io(
            "Worker started without piped stdio",
            std::io::Error::other("missing pipe"),
        )),
    }
}

/// Stop a worker that was started but could not be wired up
fn abandon(child: &mut Child) {
    tracing::warn!("Killing worker {} after failed start", child.id());
    if let Err(e) = child.kill() {
        tracing::warn!("Failed to kill worker {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line_skips_blank_lines() {
        assert_eq!(
            first_line(b"\n  Model State Version 20\nbuild 7\n"),
            Some("Model State Version 20".to_string())
        );
        assert_eq!(first_line(b"\n\n"), None);
    }
}
