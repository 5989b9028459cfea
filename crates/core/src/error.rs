//! Error types for jobproc-core

use thiserror::Error;

/// Result type alias for jobproc-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes surfaced to API callers.
///
/// The numeric values are part of the external contract and must not be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Job configuration cannot produce a worker launch
    Configuration = 10101,
    /// No job with the requested id
    UnknownJob = 10102,
    /// Required field missing from the input header
    MissingField = 20101,
    /// Input is not a stream of records at all
    MalformedInput = 20102,
    /// Status tracker rejected the stream (too many bad records)
    DataQuality = 20103,
    /// Feed or Finish while the job is busy
    ConcurrencyViolation = 30101,
    /// Worker exited unexpectedly or with a non-zero code
    ProcessLifecycle = 30102,
    /// OS failure spawning or talking to the worker
    LaunchIo = 30103,
    /// Registry is draining and accepts no new work
    ShuttingDown = 30104,
    /// Other I/O failure (reading the caller's input)
    Io = 40101,
}

impl ErrorCode {
    /// Numeric value of the code
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Error types that can occur while managing workers
#[derive(Debug, Error)]
pub enum Error {
    /// Job configuration cannot produce a valid worker launch
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Job details could not be found
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// A required field is absent from the input header
    #[error("Missing field '{field}': {message}")]
    MissingField {
        /// Name of the first field that could not be resolved
        field: String,
        /// Human readable description
        message: String,
    },

    /// Input is not shaped as a record stream (e.g. a JSON scalar)
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The status tracker decided the discard rate is too high
    #[error("Data quality check failed: {0}")]
    DataQuality(String),

    /// Feed or Finish invoked while another caller owns the worker
    #[error("Job '{job_id}' is busy with another operation")]
    ConcurrencyViolation {
        /// Job that was busy
        job_id: String,
    },

    /// Worker exited unexpectedly, could not be written, or exited non-zero
    #[error("Worker for job '{job_id}' failed: {message}{}", format_stderr(.stderr))]
    ProcessLifecycle {
        /// Job owning the worker
        job_id: String,
        /// What went wrong
        message: String,
        /// Exit code if the process has exited with one
        exit_code: Option<i32>,
        /// Trailing stderr output of the worker
        stderr: String,
    },

    /// OS failure spawning the worker or preparing its files
    #[error("{context}: {source}")]
    LaunchIo {
        /// Operation that failed
        context: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Registry is shutting down
    #[error("Registry is shutting down")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\n{}", stderr.trim_end())
    }
}

impl Error {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Configuration(_) => ErrorCode::Configuration,
            Error::UnknownJob(_) => ErrorCode::UnknownJob,
            Error::MissingField { .. } => ErrorCode::MissingField,
            Error::MalformedInput(_) => ErrorCode::MalformedInput,
            Error::DataQuality(_) => ErrorCode::DataQuality,
            Error::ConcurrencyViolation { .. } => ErrorCode::ConcurrencyViolation,
            Error::ProcessLifecycle { .. } => ErrorCode::ProcessLifecycle,
            Error::LaunchIo { .. } => ErrorCode::LaunchIo,
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            Error::Io(_) => ErrorCode::Io,
        }
    }

    /// True if the caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyViolation { .. })
    }

    pub(crate) fn launch_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::LaunchIo {
            context: context.into(),
            source,
        }
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            match err.into_kind() {
                csv::ErrorKind::Io(io) => Error::Io(io),
                other => Error::MalformedInput(format!("{:?}", other)),
            }
        } else {
            Error::MalformedInput(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Error::Io(err.into())
        } else {
            Error::MalformedInput(err.to_string())
        }
    }
}
