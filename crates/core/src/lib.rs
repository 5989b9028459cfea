//! Jobproc Core - lifecycle management for external analytics workers
//!
//! Each analysis job is backed by at most one native worker process. This
//! crate starts those workers with the right command line, environment and
//! temporary files, streams client data into them as length-prefixed
//! records, retires them after an idle timeout and drains them on shutdown.
//!
//! # Architecture
//!
//! - [`registry`]: job id to worker map, Feed/Finish exclusion, idle timeouts
//!   and shutdown drain
//! - [`process`]: command lines, environment, temp files and running handles
//! - [`pipeline`]: CSV/JSON/raw input to the worker's wire format
//! - [`collaborators`]: traits for job storage, results parsing and status
//!   reporting
//!
//! # Example
//!
//! ```ignore
//! use jobproc_core::{JobProcessRegistry, RuntimeConfig};
//! use std::sync::Arc;
//!
//! let registry = JobProcessRegistry::builder(RuntimeConfig::from_default_file()?)
//!     .job_provider(Arc::new(my_job_store))
//!     .build()?;
//!
//! let counts = registry.feed("farequote", std::fs::File::open("data.csv")?)?;
//! println!("processed {} records", counts.processed_records);
//! registry.finish("farequote")?;
//! ```

#![warn(clippy::all)]

pub mod collaborators;
pub mod config;
mod error;
pub mod job;
pub mod pipeline;
pub mod process;
pub mod registry;

pub use collaborators::{
    JobDetailsProvider, LoggingResultsReaderFactory, LoggingStatusReporter, ResultsReader,
    ResultsReaderFactory, StatusReporter,
};
pub use config::{ByteOrder, RetryPolicy, RuntimeConfig};
pub use error::{Error, ErrorCode, Result};
pub use job::{
    AnalysisConfig, AnalysisLimits, DataDescription, DataFormat, Detector, JobDetails, JobStatus,
    PersistedState, TimeFormat,
};
pub use pipeline::{DataCounts, DataPipeline, MalformedRecord};
pub use process::{
    NormalizerHandle, NormalizerInitState, WorkerCommand, WorkerHandle, WorkerLauncher,
};
pub use registry::{DrainReport, FinishOutcome, JobProcessRegistry, RegistryBuilder};

/// Initialize logging
///
/// Installs a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
/// Calling it again, or after the host application installed its own
/// subscriber, is harmless.
pub fn init() -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Jobproc core initialized");
    }
    Ok(())
}
