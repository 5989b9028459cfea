//! Per-job idle timeouts
//!
//! Timers run on a dedicated single-threaded tokio runtime. Each job has at
//! most one pending timer; scheduling a new one replaces (and aborts) the
//! old one. When a timer fires its callback runs on the blocking pool so
//! that waiting for a worker to exit never stalls other timers.

use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

struct PendingTimeout {
    id: u64,
    task: JoinHandle<()>,
}

/// Cancellable delayed callbacks keyed by job id
pub struct TimeoutScheduler {
    runtime: Option<Runtime>,
    handle: Handle,
    pending: Arc<DashMap<String, PendingTimeout>>,
    next_id: AtomicU64,
}

impl TimeoutScheduler {
    /// Start the timer runtime
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("job-timeouts")
            .enable_time()
            .build()
            .map_err(|e| Error::launch_io("Failed to start the timeout runtime", e))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Run `callback` after `delay` unless cancelled first. Replaces any
    /// timer already pending for `job_id`.
    pub fn schedule<F>(&self, job_id: &str, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let key = job_id.to_string();

        // The entry lock is held until the new timer is stored, so a timer
        // that fires immediately still finds its own entry.
        let entry = self.pending.entry(job_id.to_string());
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if pending.remove_if(&key, |_, p| p.id == id).is_some() {
                tracing::debug!(job_id = %key, "Idle timeout expired");
                drop(tokio::task::spawn_blocking(callback));
            }
        });

        let timeout = PendingTimeout { id, task };
        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.get().task.abort();
                occupied.insert(timeout);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(timeout);
            }
        }
        tracing::debug!(job_id = %job_id, "Idle timeout scheduled in {:?}", delay);
    }

    /// Cancel the pending timer of `job_id`; true if there was one
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.pending.remove(job_id) {
            Some((_, timeout)) => {
                timeout.task.abort();
                tracing::debug!(job_id = %job_id, "Idle timeout cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    /// True if `job_id` has a pending timer
    pub fn is_pending(&self, job_id: &str) -> bool {
        self.pending.contains_key(job_id)
    }

    /// Number of pending timers
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.cancel_all();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
