//! Per-stream record counters and non-fatal record problems

use std::fmt;
use std::io::{self, Read};

/// A record that was dropped (or flagged) without aborting the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    /// Delimited row without enough columns to cover every required field
    ShortRow {
        /// Columns in the row
        columns: usize,
        /// Columns needed
        required: usize,
    },
    /// JSON object without the time field
    MissingTimeField,
    /// Time value that the configured format could not parse
    UnparsableTimestamp {
        /// Offending value
        value: String,
    },
    /// Record older than the last one written
    OutOfOrder {
        /// Epoch of the rejected record
        epoch: i64,
        /// Epoch of the last written record
        last_epoch: i64,
    },
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedRecord::ShortRow { columns, required } => write!(
                f,
                "record has {} columns, at least {} required",
                columns, required
            ),
            MalformedRecord::MissingTimeField => f.write_str("record has no time field"),
            MalformedRecord::UnparsableTimestamp { value } => {
                write!(f, "cannot parse timestamp '{}'", value)
            }
            MalformedRecord::OutOfOrder { epoch, last_epoch } => write!(
                f,
                "record time {} is before the previous record time {}",
                epoch, last_epoch
            ),
        }
    }
}

/// Counters accumulated while streaming one input to a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataCounts {
    /// Bytes read from the caller's input
    pub input_bytes: u64,
    /// Rows or objects read (header excluded)
    pub input_records: u64,
    /// Records written to the worker
    pub processed_records: u64,
    /// Records dropped for shape problems (short rows, no time field)
    pub discarded_records: u64,
    /// Records dropped because the time field did not parse
    pub date_parse_errors: u64,
    /// Records dropped because they were older than their predecessor
    pub out_of_order_records: u64,
    /// Required non-time fields absent from otherwise valid records
    pub missing_fields: u64,
}

impl DataCounts {
    /// Every record that was read but not written
    pub fn dropped_records(&self) -> u64 {
        self.discarded_records + self.date_parse_errors + self.out_of_order_records
    }

    /// Dropped records as a percentage of records read
    pub fn dropped_percent(&self) -> f64 {
        if self.input_records == 0 {
            0.0
        } else {
            self.dropped_records() as f64 * 100.0 / self.input_records as f64
        }
    }

    pub(crate) fn record(&mut self, malformed: &MalformedRecord) {
        match malformed {
            MalformedRecord::ShortRow { .. } | MalformedRecord::MissingTimeField => {
                self.discarded_records += 1
            }
            MalformedRecord::UnparsableTimestamp { .. } => self.date_parse_errors += 1,
            MalformedRecord::OutOfOrder { .. } => self.out_of_order_records += 1,
        }
    }
}

/// Reader adapter counting the bytes pulled through it
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    bytes_read: u64,
}

impl<R: Read> CountingReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_percent() {
        let mut counts = DataCounts {
            input_records: 8,
            ..DataCounts::default()
        };
        counts.record(&MalformedRecord::MissingTimeField);
        counts.record(&MalformedRecord::UnparsableTimestamp {
            value: "yesterday".to_string(),
        });
        assert_eq!(counts.discarded_records, 1);
        assert_eq!(counts.date_parse_errors, 1);
        assert_eq!(counts.dropped_records(), 2);
        assert_eq!(counts.dropped_percent(), 25.0);
        assert_eq!(DataCounts::default().dropped_percent(), 0.0);
    }

    #[test]
    fn test_counting_reader() {
        let mut reader = CountingReader::new(&b"hello world"[..]);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(reader.bytes_read(), 11);
    }
}
