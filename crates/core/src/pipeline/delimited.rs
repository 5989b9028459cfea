//! Delimited input with a header row

use super::{CountingReader, MalformedRecord, RecordSink};
use crate::job::DataDescription;
use crate::{Error, Result};
use csv::{ByteRecord, ReaderBuilder};
use std::io::{Read, Write};

pub(super) fn stream<R: Read, W: Write>(
    input: R,
    description: &DataDescription,
    required: &[String],
    sink: &mut RecordSink<'_, W>,
) -> Result<()> {
    let mut reader = ReaderBuilder::new()
        .delimiter(ascii_byte(description.field_delimiter, "field delimiter")?)
        .quote(ascii_byte(description.quote_character, "quote character")?)
        .has_headers(true)
        .flexible(true)
        .from_reader(CountingReader::new(input));

    let header = reader.byte_headers()?.clone();
    let indexes = resolve_indexes(&header, required)?;
    let max_index = indexes.iter().copied().max().unwrap_or(0);

    sink.ensure_header()?;

    let mut row = ByteRecord::new();
    let mut record = vec![String::new(); required.len()];
    while reader.read_byte_record(&mut row)? {
        sink.record_read();
        if row.len() <= max_index {
            sink.discard(MalformedRecord::ShortRow {
                columns: row.len(),
                required: max_index + 1,
            });
            continue;
        }

        for (slot, &index) in record.iter_mut().zip(&indexes) {
            slot.clear();
            slot.push_str(&String::from_utf8_lossy(&row[index]));
        }
        sink.write(&mut record)?;
    }

    sink.set_input_bytes(reader.get_ref().bytes_read());
    Ok(())
}

/// Column index of every required field, failing on the first one the
/// header does not contain
fn resolve_indexes(header: &ByteRecord, required: &[String]) -> Result<Vec<usize>> {
    required
        .iter()
        .map(|field| {
            header
                .iter()
                .position(|column| column == field.as_bytes())
                .ok_or_else(|| Error::MissingField {
                    field: field.clone(),
                    message: format!("field '{}' is not in the input header", field),
                })
        })
        .collect()
}

fn ascii_byte(c: char, what: &str) -> Result<u8> {
    u8::try_from(c)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| Error::Configuration(format!("{} '{}' is not an ASCII character", what, c)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_indexes_follows_required_order() {
        let header = ByteRecord::from(vec!["c", "time", "a", "b"]);
        let required = vec!["time".to_string(), "a".to_string(), "c".to_string()];
        assert_eq!(resolve_indexes(&header, &required).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_resolve_reports_first_missing() {
        let header = ByteRecord::from(vec!["time", "a"]);
        let required = vec!["time".to_string(), "x".to_string(), "y".to_string()];
        match resolve_indexes(&header, &required).unwrap_err() {
            Error::MissingField { field, .. } => assert_eq!(field, "x"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_non_ascii_delimiter_rejected() {
        assert_eq!(ascii_byte('\t', "delimiter").unwrap(), b'\t');
        assert!(matches!(
            ascii_byte('§', "delimiter"),
            Err(Error::Configuration(_))
        ));
    }
}
