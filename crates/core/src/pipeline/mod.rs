//! Input transformation from caller streams to the worker wire format
//!
//! A [`DataPipeline`] lives as long as its worker. Each call to
//! [`DataPipeline::run`] streams one input into the worker's stdin:
//!
//! - delimited and JSON input is projected onto the required field order
//!   (time field first, then the analysis fields), the time value is
//!   converted to epoch seconds and each record is length-encoded
//! - with transformation disabled the bytes are copied through untouched
//!
//! The header record is written once per worker, before its first data
//! record.

mod delimited;
mod json;
mod raw;

pub mod counts;
pub mod time;
pub mod wire;

pub use counts::{CountingReader, DataCounts, MalformedRecord};
pub use time::{DateTransformer, TimestampParseError};
pub use wire::{encode_record, LengthEncodedWriter};

use crate::collaborators::StatusReporter;
use crate::config::ByteOrder;
use crate::job::{DataDescription, DataFormat};
use crate::{Error, Result};
use std::io::{self, Read, Write};

/// Required field order: the time field, then every analysis field that is
/// not the time field, in the given order
pub fn required_fields(time_field: &str, analysis_fields: &[String]) -> Vec<String> {
    let mut fields = Vec::with_capacity(analysis_fields.len() + 1);
    fields.push(time_field.to_string());
    for field in analysis_fields {
        if !fields.contains(field) {
            fields.push(field.clone());
        }
    }
    fields
}

/// Per-worker transformation state
#[derive(Debug)]
pub struct DataPipeline {
    job_id: String,
    description: DataDescription,
    required_fields: Vec<String>,
    byte_order: ByteOrder,
    transformer: DateTransformer,
    header_sent: bool,
}

impl DataPipeline {
    /// Pipeline for `job_id` reading input laid out as `description`
    pub fn new(
        job_id: impl Into<String>,
        description: DataDescription,
        analysis_fields: &[String],
        byte_order: ByteOrder,
    ) -> Self {
        let required_fields = required_fields(&description.time_field, analysis_fields);
        let transformer = DateTransformer::new(description.time_format.clone());
        Self {
            job_id: job_id.into(),
            description,
            required_fields,
            byte_order,
            transformer,
            header_sent: false,
        }
    }

    /// Field order of the header and of every record
    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    /// Input layout
    pub fn description(&self) -> &DataDescription {
        &self.description
    }

    /// True once the header record has been written
    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    /// Stream `input` into `output` and let `reporter` judge the result.
    ///
    /// Write failures on `output` are reported as
    /// [`Error::ProcessLifecycle`]; failures reading `input` as
    /// [`Error::Io`].
    pub fn run<R: Read, W: Write>(
        &mut self,
        input: R,
        output: W,
        reporter: &dyn StatusReporter,
    ) -> Result<DataCounts> {
        let mut tracker = WriteTracker::new(output);
        let result = self.stream(input, &mut tracker, reporter);

        let counts = match result {
            Ok(counts) => counts,
            Err(Error::Io(e)) if tracker.failed => {
                return Err(Error::ProcessLifecycle {
                    job_id: self.job_id.clone(),
                    message: format!("Failed to write to worker: {}", e),
                    exit_code: None,
                    stderr: String::new(),
                })
            }
            Err(e) => return Err(e),
        };

        reporter.finish_reporting(&self.job_id, &counts)?;
        Ok(counts)
    }

    fn stream<R: Read, W: Write>(
        &mut self,
        input: R,
        output: W,
        reporter: &dyn StatusReporter,
    ) -> Result<DataCounts> {
        if !self.description.transform {
            let input_bytes = raw::pipe(input, output)?;
            return Ok(DataCounts {
                input_bytes,
                ..DataCounts::default()
            });
        }

        let header = if self.header_sent {
            None
        } else {
            Some(self.required_fields.as_slice())
        };
        let mut sink = RecordSink {
            job_id: &self.job_id,
            writer: LengthEncodedWriter::new(output, self.byte_order),
            transformer: &self.transformer,
            reporter,
            pending_header: header,
            last_epoch: None,
            counts: DataCounts::default(),
        };

        let result = match self.description.format {
            DataFormat::Delimited => {
                delimited::stream(input, &self.description, &self.required_fields, &mut sink)
            }
            DataFormat::Json => json::stream(input, &self.required_fields, &mut sink),
        };
        if sink.pending_header.is_none() {
            self.header_sent = true;
        }
        result?;
        sink.finish()
    }
}

/// Shared tail of the delimited and JSON readers: time conversion,
/// ordering, framing and counting
pub(crate) struct RecordSink<'a, W: Write> {
    job_id: &'a str,
    writer: LengthEncodedWriter<W>,
    transformer: &'a DateTransformer,
    reporter: &'a dyn StatusReporter,
    pending_header: Option<&'a [String]>,
    last_epoch: Option<i64>,
    counts: DataCounts,
}

impl<W: Write> RecordSink<'_, W> {
    pub(crate) fn ensure_header(&mut self) -> Result<()> {
        if let Some(header) = self.pending_header {
            self.writer.write_record(header)?;
            self.pending_header = None;
        }
        Ok(())
    }

    pub(crate) fn record_read(&mut self) {
        self.counts.input_records += 1;
    }

    pub(crate) fn set_input_bytes(&mut self, bytes: u64) {
        self.counts.input_bytes = bytes;
    }

    pub(crate) fn discard(&mut self, malformed: MalformedRecord) {
        self.counts.record(&malformed);
        self.reporter.report_malformed_record(self.job_id, &malformed);
    }

    pub(crate) fn missing_fields(&mut self, first: &str, count: usize) {
        self.counts.missing_fields += count as u64;
        self.reporter.report_missing_field(self.job_id, first);
    }

    /// Convert the time value in `record[0]` and write the record, or
    /// drop it if the time is unparsable or earlier than the last one
    pub(crate) fn write(&mut self, record: &mut [String]) -> Result<()> {
        let epoch = match self.transformer.transform(&record[0]) {
            Ok(epoch) => epoch,
            Err(e) => {
                self.discard(MalformedRecord::UnparsableTimestamp { value: e.value });
                return Ok(());
            }
        };

        if let Some(last_epoch) = self.last_epoch {
            if epoch < last_epoch {
                self.discard(MalformedRecord::OutOfOrder { epoch, last_epoch });
                return Ok(());
            }
        }
        self.last_epoch = Some(epoch);

        record[0] = epoch.to_string();
        self.writer.write_record(record)?;
        self.counts.processed_records += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<DataCounts> {
        self.writer.flush()?;
        Ok(self.counts)
    }
}

/// Remembers whether the wrapped writer ever failed
struct WriteTracker<W> {
    inner: W,
    failed: bool,
}

impl<W: Write> WriteTracker<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            failed: false,
        }
    }
}

impl<W: Write> Write for WriteTracker<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).inspect_err(|_| self.failed = true)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().inspect_err(|_| self.failed = true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LoggingStatusReporter;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_required_fields_put_time_first() {
        let fields = required_fields(
            "time",
            &["a".to_string(), "time".to_string(), "c".to_string()],
        );
        assert_eq!(fields, vec!["time", "a", "c"]);
    }

    #[test]
    fn test_header_written_once_per_worker() {
        let mut pipeline = DataPipeline::new(
            "j",
            DataDescription::delimited(','),
            &["a".to_string()],
            ByteOrder::BigEndian,
        );
        let reporter = LoggingStatusReporter::default();
        let header = encode_record(&["time", "a"], ByteOrder::BigEndian).unwrap();

        let mut first = Vec::new();
        pipeline
            .run(&b"time,a\n1,x\n"[..], &mut first, &reporter)
            .unwrap();
        assert!(first.starts_with(&header));
        assert!(pipeline.header_sent());

        let mut second = Vec::new();
        pipeline
            .run(&b"time,a\n2,y\n"[..], &mut second, &reporter)
            .unwrap();
        assert_eq!(
            second,
            encode_record(&["2", "y"], ByteOrder::BigEndian).unwrap()
        );
    }

    #[test]
    fn test_write_failure_is_lifecycle_error() {
        let mut pipeline = DataPipeline::new(
            "j",
            DataDescription::delimited(','),
            &[],
            ByteOrder::BigEndian,
        );
        let reporter = LoggingStatusReporter::default();
        let err = pipeline
            .run(&b"time\n1\n"[..], BrokenPipe, &reporter)
            .unwrap_err();
        assert!(matches!(err, Error::ProcessLifecycle { .. }));
    }

    #[test]
    fn test_missing_field_writes_nothing() {
        let mut pipeline = DataPipeline::new(
            "j",
            DataDescription::delimited(','),
            &["b".to_string()],
            ByteOrder::BigEndian,
        );
        let reporter = LoggingStatusReporter::default();
        let mut out = Vec::new();
        let err = pipeline
            .run(&b"time,a\n1,x\n"[..], &mut out, &reporter)
            .unwrap_err();
        match err {
            Error::MissingField { field, .. } => assert_eq!(field, "b"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(out.is_empty());
        assert!(!pipeline.header_sent());
    }
}
