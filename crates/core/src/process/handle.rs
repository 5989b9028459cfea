//! A running worker process and the state that guards access to it

use super::command::WorkerCommand;
use super::files::TempArtifacts;
use crate::collaborators::StatusReporter;
use crate::job::DataDescription;
use crate::pipeline::{DataCounts, DataPipeline};
use crate::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, ChildStdin, ExitStatus};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Time allowed for the stderr reader to catch the last lines of an exited
/// worker before an error report is built
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// Whether a caller currently owns the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusyState {
    /// No Feed or Finish in progress
    Idle = 0,
    /// A Feed or Finish owns the worker
    Busy = 1,
}

impl BusyState {
    fn from_u8(value: u8) -> Self {
        if value == BusyState::Busy as u8 {
            BusyState::Busy
        } else {
            BusyState::Idle
        }
    }
}

/// Bounded tail of a worker's stderr, filled by a background thread
#[derive(Debug)]
pub struct StderrCapture {
    lines: Arc<Mutex<VecDeque<String>>>,
    eof: Receiver<()>,
}

impl StderrCapture {
    /// Start draining `stderr`, keeping the last `capacity` lines
    pub fn spawn(
        stderr: ChildStderr,
        capacity: usize,
        thread_name: String,
        span: tracing::Span,
    ) -> io::Result<Self> {
        Self::spawn_reader(stderr, capacity, thread_name, span)
    }

    fn spawn_reader<R: Read + Send + 'static>(
        stderr: R,
        capacity: usize,
        thread_name: String,
        span: tracing::Span,
    ) -> io::Result<Self> {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024))));
        let (eof_tx, eof) = channel::bounded(1);
        let sink = lines.clone();

        thread::Builder::new().name(thread_name).spawn(move || {
            let _entered = span.enter();
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                        tracing::debug!("stderr: {}", line);
                        let mut lines = sink.lock();
                        if capacity > 0 && lines.len() == capacity {
                            lines.pop_front();
                        }
                        if capacity > 0 {
                            lines.push_back(line);
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Stopped reading worker stderr: {}", e);
                        break;
                    }
                }
            }
            let _ = eof_tx.send(());
        })?;

        Ok(Self { lines, eof })
    }

    /// Captured lines joined with newlines
    pub fn contents(&self) -> String {
        self.lines
            .lock()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Wait up to `timeout` for stderr to reach end of file
    pub fn wait_for_eof(&self, timeout: Duration) -> bool {
        match self.eof.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// A live worker: the OS process plus everything needed to feed and
/// finish it
pub struct WorkerHandle {
    job_id: String,
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    pipeline: Mutex<DataPipeline>,
    description: DataDescription,
    required_fields: Vec<String>,
    busy: AtomicU8,
    timeout: Duration,
    span: tracing::Span,
    stderr: StderrCapture,
    command: WorkerCommand,
    // Removed with the handle
    _artifacts: TempArtifacts,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("job_id", &self.job_id)
            .field("pid", &self.pid)
            .field("busy", &self.busy_state())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Everything a [`WorkerHandle`] is assembled from
pub(crate) struct WorkerParts {
    pub job_id: String,
    pub child: Child,
    pub stdin: ChildStdin,
    pub stderr: StderrCapture,
    pub pipeline: DataPipeline,
    pub timeout: Duration,
    pub span: tracing::Span,
    pub command: WorkerCommand,
    pub artifacts: TempArtifacts,
}

impl WorkerHandle {
    pub(crate) fn new(parts: WorkerParts) -> Self {
        Self {
            pid: parts.child.id(),
            job_id: parts.job_id,
            child: Mutex::new(parts.child),
            stdin: Mutex::new(Some(parts.stdin)),
            description: parts.pipeline.description().clone(),
            required_fields: parts.pipeline.required_fields().to_vec(),
            pipeline: Mutex::new(parts.pipeline),
            busy: AtomicU8::new(BusyState::Idle as u8),
            timeout: parts.timeout,
            span: parts.span,
            stderr: parts.stderr,
            command: parts.command,
            _artifacts: parts.artifacts,
        }
    }

    /// Job this worker belongs to
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Idle time after which the job is finished automatically
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Logging span of the job
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Command the worker was started with
    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Input layout
    pub fn data_description(&self) -> &DataDescription {
        &self.description
    }

    /// Field order sent to the worker (time field first)
    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    /// Current busy state
    pub fn busy_state(&self) -> BusyState {
        BusyState::from_u8(self.busy.load(Ordering::Acquire))
    }

    /// True while a Feed or Finish owns the worker
    pub fn is_busy(&self) -> bool {
        self.busy_state() == BusyState::Busy
    }

    /// Claim the worker. Fails without waiting if another caller owns it.
    pub fn try_acquire(&self) -> Result<BusyGuard<'_>> {
        self.busy
            .compare_exchange(
                BusyState::Idle as u8,
                BusyState::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| BusyGuard { handle: self })
            .map_err(|_| Error::ConcurrencyViolation {
                job_id: self.job_id.clone(),
            })
    }

    /// Exit status if the process has exited, without blocking
    pub fn exit_status(&self) -> Result<Option<ExitStatus>> {
        self.child
            .lock()
            .try_wait()
            .map_err(|e| Error::launch_io(format!("Failed to poll worker {}", self.pid), e))
    }

    /// Trailing stderr lines captured so far
    pub fn stderr_tail(&self) -> String {
        self.stderr.contents()
    }

    /// Lifecycle error for this worker with its captured stderr attached
    pub(crate) fn lifecycle_error(&self, message: impl Into<String>, exit_code: Option<i32>) -> Error {
        self.stderr.wait_for_eof(STDERR_SETTLE);
        Error::ProcessLifecycle {
            job_id: self.job_id.clone(),
            message: message.into(),
            exit_code,
            stderr: self.stderr.contents(),
        }
    }

    fn exited_error(&self, status: ExitStatus) -> Error {
        self.lifecycle_error(
            format!("worker process {} exited unexpectedly ({})", self.pid, status),
            status.code(),
        )
    }
}

/// Exclusive access to a worker; resets the busy state when dropped
#[must_use = "the worker is released as soon as the guard is dropped"]
pub struct BusyGuard<'a> {
    handle: &'a WorkerHandle,
}

impl BusyGuard<'_> {
    /// Worker owned by this guard
    pub fn handle(&self) -> &WorkerHandle {
        self.handle
    }

    /// Fail if the worker has already exited
    pub fn ensure_running(&self) -> Result<()> {
        match self.handle.exit_status()? {
            Some(status) => Err(self.handle.exited_error(status)),
            None => Ok(()),
        }
    }

    /// Stream `input` into the worker's stdin, then check that the worker
    /// survived it
    pub fn feed<R: Read>(&self, input: R, reporter: &dyn StatusReporter) -> Result<DataCounts> {
        self.ensure_running()?;

        let result = {
            let mut stdin = self.handle.stdin.lock();
            let stdin = stdin
                .as_mut()
                .ok_or_else(|| self.handle.lifecycle_error("worker input is already closed", None))?;
            self.handle.pipeline.lock().run(input, stdin, reporter)
        };

        match result {
            Err(Error::ProcessLifecycle { message, .. }) => {
                let exit_code = self.handle.exit_status().ok().flatten().and_then(|s| s.code());
                Err(self.handle.lifecycle_error(message, exit_code))
            }
            Err(e) => Err(e),
            Ok(counts) => {
                self.ensure_running()?;
                Ok(counts)
            }
        }
    }

    /// Close the worker's stdin, which asks it to finish, and wait for it
    /// to exit
    pub fn close_and_wait(&self) -> Result<ExitStatus> {
        drop(self.handle.stdin.lock().take());
        let status = self
            .handle
            .child
            .lock()
            .wait()
            .map_err(|e| Error::launch_io(format!("Failed waiting for worker {}", self.handle.pid), e))?;
        self.handle.stderr.wait_for_eof(STDERR_SETTLE);
        Ok(status)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.handle
            .busy
            .store(BusyState::Idle as u8, Ordering::Release);
    }
}
