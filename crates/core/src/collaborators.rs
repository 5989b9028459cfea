//! Interfaces to the services that surround the worker registry
//!
//! The registry does not own job configuration, result parsing or status
//! tracking. It talks to them through the traits in this module so that the
//! embedding application can plug in its own storage and reporting.

use crate::job::{JobDetails, JobStatus, PersistedState};
use crate::pipeline::{DataCounts, MalformedRecord};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::io::{BufRead, BufReader};
use std::process::ChildStdout;

/// Supplies job configuration and persisted state, and records completion
pub trait JobDetailsProvider: Send + Sync {
    /// Configuration of `job_id`; `Error::UnknownJob` if there is none
    fn job_details(&self, job_id: &str) -> Result<JobDetails>;

    /// Model state saved by a previous worker, if any
    fn persisted_state(&self, job_id: &str) -> Result<Option<PersistedState>>;

    /// Record that the worker of `job_id` has finished
    fn set_finished(&self, job_id: &str, finished_at: DateTime<Utc>, status: JobStatus)
        -> Result<()>;
}

/// Consumer of one worker's stdout. Runs on its own thread for the whole
/// lifetime of the worker.
pub trait ResultsReader: Send {
    /// Read until the worker closes stdout
    fn read_results(self: Box<Self>);
}

/// Builds the stdout consumer for a newly started worker
pub trait ResultsReaderFactory: Send + Sync {
    /// Reader for `job_id`; `span` is the job's logging span
    fn new_results_reader(
        &self,
        job_id: &str,
        stdout: ChildStdout,
        span: tracing::Span,
    ) -> Box<dyn ResultsReader>;
}

/// Receives record-level problems and judges each finished stream
pub trait StatusReporter: Send + Sync {
    /// A record was dropped or flagged
    fn report_malformed_record(&self, job_id: &str, record: &MalformedRecord) {
        let _ = (job_id, record);
    }

    /// A record was sent with `field` empty because the input lacked it
    fn report_missing_field(&self, job_id: &str, field: &str) {
        let _ = (job_id, field);
    }

    /// Verdict on a completed stream; an error fails the Feed call
    fn finish_reporting(&self, job_id: &str, counts: &DataCounts) -> Result<()>;
}

/// Default reporter: logs problems and rejects streams whose dropped
/// record percentage exceeds a threshold
#[derive(Debug, Clone)]
pub struct LoggingStatusReporter {
    max_discard_percent: f64,
}

impl LoggingStatusReporter {
    /// Reporter rejecting streams above `max_discard_percent`
    pub fn new(max_discard_percent: f64) -> Self {
        Self {
            max_discard_percent,
        }
    }
}

impl Default for LoggingStatusReporter {
    fn default() -> Self {
        Self::new(25.0)
    }
}

impl StatusReporter for LoggingStatusReporter {
    fn report_malformed_record(&self, job_id: &str, record: &MalformedRecord) {
        tracing::debug!(job_id = %job_id, "Dropped record: {}", record);
    }

    fn report_missing_field(&self, job_id: &str, field: &str) {
        tracing::warn!(job_id = %job_id, field = %field, "Record is missing a required field");
    }

    fn finish_reporting(&self, job_id: &str, counts: &DataCounts) -> Result<()> {
        let percent = counts.dropped_percent();
        tracing::info!(
            job_id = %job_id,
            records = counts.input_records,
            processed = counts.processed_records,
            discarded = counts.discarded_records,
            date_parse_errors = counts.date_parse_errors,
            out_of_order = counts.out_of_order_records,
            bytes = counts.input_bytes,
            "Finished streaming data"
        );

        if percent > self.max_discard_percent {
            return Err(Error::DataQuality(format!(
                "{} of {} records ({:.1}%) were dropped, limit is {:.1}%",
                counts.dropped_records(),
                counts.input_records,
                percent,
                self.max_discard_percent
            )));
        }
        Ok(())
    }
}

/// Results reader factory that logs each stdout line at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingResultsReaderFactory;

struct LoggingResultsReader {
    stdout: ChildStdout,
    span: tracing::Span,
}

impl ResultsReader for LoggingResultsReader {
    fn read_results(self: Box<Self>) {
        let LoggingResultsReader { stdout, span } = *self;
        let _entered = span.enter();
        for line in BufReader::new(stdout).lines() {
            match line {
                Ok(line) => tracing::debug!("result: {}", line),
                Err(e) => {
                    tracing::warn!("Stopped reading worker output: {}", e);
                    break;
                }
            }
        }
    }
}

impl ResultsReaderFactory for LoggingResultsReaderFactory {
    fn new_results_reader(
        &self,
        _job_id: &str,
        stdout: ChildStdout,
        span: tracing::Span,
    ) -> Box<dyn ResultsReader> {
        Box::new(LoggingResultsReader { stdout, span })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_threshold() {
        let reporter = LoggingStatusReporter::new(10.0);
        let mut counts = DataCounts {
            input_records: 10,
            processed_records: 9,
            date_parse_errors: 1,
            ..DataCounts::default()
        };
        assert!(reporter.finish_reporting("j", &counts).is_ok());

        counts.processed_records = 8;
        counts.discarded_records = 1;
        let err = reporter.finish_reporting("j", &counts).unwrap_err();
        assert!(matches!(err, Error::DataQuality(_)));
    }

    #[test]
    fn test_empty_stream_passes() {
        let reporter = LoggingStatusReporter::new(0.0);
        assert!(reporter
            .finish_reporting("j", &DataCounts::default())
            .is_ok());
    }
}
