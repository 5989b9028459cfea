//! Job to worker registry
//!
//! [`JobProcessRegistry`] owns at most one [`WorkerHandle`] per job. It
//! serialises Feed and Finish per job through the handle's busy flag,
//! retires idle workers through a [`TimeoutScheduler`] and drains every
//! worker on [`JobProcessRegistry::shutdown`].

pub mod timeout;

pub use timeout::TimeoutScheduler;

use crate::collaborators::{
    JobDetailsProvider, LoggingResultsReaderFactory, LoggingStatusReporter, ResultsReaderFactory,
    StatusReporter,
};
use crate::config::RuntimeConfig;
use crate::job::JobStatus;
use crate::pipeline::DataCounts;
use crate::process::{NormalizerHandle, NormalizerInitState, WorkerHandle, WorkerLauncher};
use crate::{Error, Result};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Result of a successful Finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The worker exited cleanly
    Completed,
    /// No worker was running for the job
    NotRunning,
}

/// What [`JobProcessRegistry::shutdown`] managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs whose workers finished cleanly
    pub finished: Vec<String>,
    /// Jobs whose workers failed while finishing
    pub failed: Vec<String>,
    /// Jobs still busy when the retry budget ran out
    pub still_busy: Vec<String>,
}

/// Builder for [`JobProcessRegistry`]
pub struct RegistryBuilder {
    config: RuntimeConfig,
    jobs: Option<Arc<dyn JobDetailsProvider>>,
    results: Arc<dyn ResultsReaderFactory>,
    reporter: Option<Arc<dyn StatusReporter>>,
}

impl RegistryBuilder {
    /// Set the job configuration provider (required)
    pub fn job_provider(mut self, jobs: Arc<dyn JobDetailsProvider>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Set the worker stdout consumer (default: log each line)
    pub fn results_reader_factory(mut self, results: Arc<dyn ResultsReaderFactory>) -> Self {
        self.results = results;
        self
    }

    /// Set the status reporter (default: [`LoggingStatusReporter`] with the
    /// configured discard limit)
    pub fn status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Build the registry and start its timer runtime
    pub fn build(self) -> Result<JobProcessRegistry> {
        let jobs = self.jobs.ok_or_else(|| {
            Error::Configuration("a job details provider is required".to_string())
        })?;
        let reporter = self.reporter.unwrap_or_else(|| {
            Arc::new(LoggingStatusReporter::new(self.config.max_discard_percent))
        });

        tracing::info!(
            "Worker registry using home {}",
            self.config.home.display()
        );

        Ok(JobProcessRegistry {
            inner: Arc::new(RegistryInner {
                launcher: WorkerLauncher::new(self.config, self.results),
                jobs,
                reporter,
                workers: DashMap::new(),
                timeouts: TimeoutScheduler::new()?,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }
}

/// Maps job ids to running workers
pub struct JobProcessRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    launcher: WorkerLauncher,
    jobs: Arc<dyn JobDetailsProvider>,
    reporter: Arc<dyn StatusReporter>,
    workers: DashMap<String, Arc<WorkerHandle>>,
    timeouts: TimeoutScheduler,
    shutting_down: AtomicBool,
}

impl JobProcessRegistry {
    /// Start building a registry with `config`
    pub fn builder(config: RuntimeConfig) -> RegistryBuilder {
        RegistryBuilder {
            config,
            jobs: None,
            results: Arc::new(LoggingResultsReaderFactory),
            reporter: None,
        }
    }

    /// Stream `input` to the worker of `job_id`, starting the worker first
    /// if needed.
    ///
    /// Fails with [`Error::ConcurrencyViolation`] without blocking if another
    /// Feed or Finish is in progress for the job. The idle timeout is
    /// cancelled for the duration of the call and rescheduled afterwards,
    /// whether or not streaming succeeded.
    pub fn feed<R: Read>(&self, job_id: &str, input: R) -> Result<DataCounts> {
        self.inner.ensure_accepting()?;
        self.inner.timeouts.cancel(job_id);

        let result = self.inner.feed(job_id, input);
        if !matches!(result, Err(Error::ConcurrencyViolation { .. })) {
            schedule_idle_timeout(&self.inner, job_id);
        }
        result
    }

    /// Close the worker of `job_id` and wait for it to exit.
    ///
    /// Finishing a job without a worker succeeds with
    /// [`FinishOutcome::NotRunning`].
    pub fn finish(&self, job_id: &str) -> Result<FinishOutcome> {
        self.inner.finish(job_id)
    }

    /// Start the worker of `job_id` without sending data
    pub fn create_worker(&self, job_id: &str) -> Result<()> {
        self.inner.ensure_accepting()?;
        self.inner.timeouts.cancel(job_id);
        let result = self.inner.worker_for(job_id).map(|_| ());
        schedule_idle_timeout(&self.inner, job_id);
        result
    }

    /// Stop accepting work and finish every worker.
    ///
    /// Busy jobs are retried every `stop_retry.interval` up to
    /// `stop_retry.max_attempts` rounds; each round tries every remaining
    /// job, so one slow job does not hold up the others. Failures are
    /// logged and reported, never returned.
    pub fn shutdown(&self) -> DrainReport {
        self.inner.shutdown()
    }

    /// Ids of jobs with a worker, sorted
    pub fn active_jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self
            .inner
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        jobs.sort();
        jobs
    }

    /// True if a Feed or Finish is in progress for `job_id`
    pub fn is_busy(&self, job_id: &str) -> bool {
        self.inner
            .workers
            .get(job_id)
            .is_some_and(|handle| handle.is_busy())
    }

    /// True if `job_id` has an idle timeout pending
    pub fn has_pending_timeout(&self, job_id: &str) -> bool {
        self.inner.timeouts.is_pending(job_id)
    }

    /// Worker of `job_id`, if running
    pub fn worker(&self, job_id: &str) -> Option<Arc<WorkerHandle>> {
        self.inner.workers.get(job_id).map(|h| Arc::clone(h.value()))
    }

    /// True once [`JobProcessRegistry::shutdown`] has started
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Analytics version, see [`WorkerLauncher::version`]
    pub fn analytics_version(&self) -> String {
        self.inner.launcher.version()
    }

    /// Analytics info document, see [`WorkerLauncher::info`]
    pub fn analytics_info(&self) -> String {
        self.inner.launcher.info()
    }

    /// Start a normalizer for `job_id`
    pub fn create_normalizer(
        &self,
        job_id: &str,
        init_state: &NormalizerInitState,
        bucket_span: Option<u64>,
    ) -> Result<NormalizerHandle> {
        self.inner
            .launcher
            .create_normalizer(job_id, init_state, bucket_span)
    }
}

impl RegistryInner {
    fn ensure_accepting(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn is_registered(&self, job_id: &str, handle: &Arc<WorkerHandle>) -> bool {
        self.workers
            .get(job_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), handle))
    }

    /// Existing worker of `job_id`, or a new one started with the job's
    /// configuration and persisted state
    fn worker_for(&self, job_id: &str) -> Result<Arc<WorkerHandle>> {
        if let Some(handle) = self.workers.get(job_id) {
            return Ok(Arc::clone(handle.value()));
        }

        self.ensure_accepting()?;
        let details = self.jobs.job_details(job_id)?;
        let state = self.jobs.persisted_state(job_id)?;
        if state.is_none() {
            tracing::debug!(job_id = %job_id, "No persisted state");
        }

        // Launched outside the map so results readers may call back into it
        let handle = Arc::new(self.launcher.create_worker(&details, state.as_ref())?);
        match self.workers.entry(job_id.to_string()) {
            Entry::Occupied(existing) => {
                let winner = Arc::clone(existing.get());
                drop(existing);
                retire_duplicate(job_id, &handle);
                Ok(winner)
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    fn feed<R: Read>(&self, job_id: &str, input: R) -> Result<DataCounts> {
        loop {
            self.ensure_accepting()?;
            let handle = self.worker_for(job_id)?;
            let guard = handle.try_acquire()?;
            // Finished and removed between lookup and acquire
            if !self.is_registered(job_id, &handle) {
                continue;
            }

            let _entered = handle.span().enter();
            let result = guard.feed(input, self.reporter.as_ref());
            match &result {
                Ok(counts) => tracing::debug!(
                    "Wrote {} records ({} bytes read)",
                    counts.processed_records,
                    counts.input_bytes
                ),
                Err(e) => tracing::error!("Feed failed: {}", e),
            }
            return result;
        }
    }

    fn finish(&self, job_id: &str) -> Result<FinishOutcome> {
        let Some(handle) = self.workers.get(job_id).map(|h| Arc::clone(h.value())) else {
            self.timeouts.cancel(job_id);
            tracing::debug!(job_id = %job_id, "Finish requested but no worker is running");
            return Ok(FinishOutcome::NotRunning);
        };

        let guard = handle.try_acquire()?;
        self.timeouts.cancel(job_id);
        if !self.is_registered(job_id, &handle) {
            return Ok(FinishOutcome::NotRunning);
        }

        let _entered = handle.span().enter();
        tracing::info!("Finishing worker {}", handle.pid());

        let result = match guard.handle().exit_status() {
            Ok(Some(status)) if status.success() => {
                tracing::info!("Worker had already exited cleanly");
                Ok(FinishOutcome::Completed)
            }
            Ok(Some(status)) => Err(handle.lifecycle_error(
                format!("worker exited before finish ({})", status),
                status.code(),
            )),
            Ok(None) => match guard.close_and_wait() {
                Ok(status) if status.success() => Ok(FinishOutcome::Completed),
                Ok(status) => Err(handle.lifecycle_error(
                    format!("worker exited with {}", status),
                    status.code(),
                )),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        self.workers
            .remove_if(job_id, |_, current| Arc::ptr_eq(current, &handle));
        drop(guard);

        let status = match &result {
            Ok(_) => {
                tracing::info!("Worker finished");
                JobStatus::Closed
            }
            Err(e) => {
                tracing::error!("Worker failed: {}", e);
                JobStatus::Failed
            }
        };
        if let Err(e) = self.jobs.set_finished(job_id, Utc::now(), status) {
            tracing::warn!("Could not record job completion: {}", e);
        }

        result
    }

    fn shutdown(&self) -> DrainReport {
        self.shutting_down.store(true, Ordering::Release);
        self.timeouts.cancel_all();

        let policy = self.launcher.config().stop_retry;
        let mut report = DrainReport::default();
        tracing::info!("Shutting down {} workers", self.workers.len());

        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            let mut busy = Vec::new();
            let jobs: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
            for job_id in jobs {
                match self.finish(&job_id) {
                    Ok(FinishOutcome::Completed) => report.finished.push(job_id),
                    Ok(FinishOutcome::NotRunning) => {}
                    Err(Error::ConcurrencyViolation { .. }) => busy.push(job_id),
                    Err(e) => {
                        tracing::error!(job_id = %job_id, "Error finishing job during shutdown: {}", e);
                        report.failed.push(job_id);
                    }
                }
            }

            if busy.is_empty() {
                break;
            }
            if attempt == attempts {
                tracing::warn!("Giving up on busy jobs {:?}", busy);
                report.still_busy = busy;
                break;
            }
            tracing::info!(
                "Jobs {:?} are busy, retrying in {:?} (attempt {} of {})",
                busy,
                policy.interval,
                attempt,
                attempts
            );
            thread::sleep(policy.interval);
        }

        report
    }
}

/// Stop a worker that lost the race to register for its job
fn retire_duplicate(job_id: &str, handle: &WorkerHandle) {
    tracing::debug!(
        job_id = %job_id,
        pid = handle.pid(),
        "Worker already registered, stopping duplicate"
    );
    let result = handle.try_acquire().and_then(|guard| guard.close_and_wait());
    if let Err(e) = result {
        tracing::warn!(job_id = %job_id, "Could not stop duplicate worker: {}", e);
    }
}

/// Schedule the job's own idle timeout if it has a worker
fn schedule_idle_timeout(inner: &Arc<RegistryInner>, job_id: &str) {
    let timeout = inner.workers.get(job_id).map(|h| h.timeout());
    if let Some(timeout) = timeout {
        schedule_timeout_in(inner, job_id, timeout);
    }
}

fn schedule_timeout_in(inner: &Arc<RegistryInner>, job_id: &str, delay: Duration) {
    if inner.shutting_down.load(Ordering::Acquire) {
        return;
    }
    let weak: Weak<RegistryInner> = Arc::downgrade(inner);
    let key = job_id.to_string();
    inner.timeouts.schedule(job_id, delay, move || {
        if let Some(inner) = weak.upgrade() {
            on_idle_timeout(&inner, &key);
        }
    });
}

fn on_idle_timeout(inner: &Arc<RegistryInner>, job_id: &str) {
    if inner.shutting_down.load(Ordering::Acquire) {
        return;
    }
    tracing::info!(job_id = %job_id, "Job idle timeout reached, finishing worker");
    match inner.finish(job_id) {
        Ok(_) => {}
        Err(Error::ConcurrencyViolation { .. }) => {
            let delay = inner.launcher.config().busy_reschedule;
            tracing::info!(job_id = %job_id, "Job is busy, retrying timeout in {:?}", delay);
            schedule_timeout_in(inner, job_id, delay);
        }
        Err(e) => tracing::error!(job_id = %job_id, "Failed to finish idle job: {}", e),
    }
}
