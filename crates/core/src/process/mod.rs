//! Worker process management
//!
//! - [`environment`]: installation layout and the two variables a worker
//!   inherits
//! - [`files`]: temporary limits, field config and state files
//! - [`command`]: command lines of the analytics worker and the normalizer
//! - [`launcher`]: starting workers and querying version/info
//! - [`handle`]: a running worker with its busy flag and stderr tail

pub mod command;
pub mod environment;
pub mod files;
pub mod handle;
pub mod launcher;

pub use command::WorkerCommand;
pub use environment::{library_path_var, Installation};
pub use files::TempArtifacts;
pub use handle::{BusyGuard, BusyState, StderrCapture, WorkerHandle};
pub use launcher::{
    NormalizerHandle, NormalizerInitState, SysChangeStateRow, UnusualStateRow, WorkerLauncher,
    EMPTY_INFO, UNKNOWN_VERSION,
};
