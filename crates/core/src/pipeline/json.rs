//! JSON object streams, optionally wrapped in a single top-level array

use super::{CountingReader, MalformedRecord, RecordSink};
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};

pub(super) fn stream<R: Read, W: Write>(
    input: R,
    required: &[String],
    sink: &mut RecordSink<'_, W>,
) -> Result<()> {
    let mut reader = BufReader::new(CountingReader::new(input));
    let positions: HashMap<&str, usize> = required
        .iter()
        .enumerate()
        .map(|(i, field)| (field.as_str(), i))
        .collect();

    let in_array = match next_significant(&mut reader, false)? {
        None => {
            sink.set_input_bytes(reader.get_ref().bytes_read());
            return Ok(());
        }
        Some(b'[') => {
            reader.consume(1);
            true
        }
        Some(b'{') => false,
        Some(other) => return Err(unexpected(other)),
    };

    sink.ensure_header()?;

    let mut record = vec![String::new(); required.len()];
    let mut present = vec![false; required.len()];
    loop {
        match next_significant(&mut reader, in_array)? {
            None => break,
            Some(b']') if in_array => {
                reader.consume(1);
                break;
            }
            Some(b'{') => {}
            Some(other) => return Err(unexpected(other)),
        }

        let object = {
            let mut de = serde_json::Deserializer::from_reader(&mut reader);
            Map::<String, Value>::deserialize(&mut de)?
        };
        sink.record_read();

        record.iter_mut().for_each(String::clear);
        present.iter_mut().for_each(|p| *p = false);
        flatten("", &object, &positions, &mut record, &mut present);

        if !present[0] {
            sink.discard(MalformedRecord::MissingTimeField);
            continue;
        }
        let missing = present.iter().filter(|p| !**p).count();
        if let Some(first) = present.iter().position(|p| !*p) {
            sink.missing_fields(&required[first], missing);
        }
        sink.write(&mut record)?;
    }

    sink.set_input_bytes(reader.get_ref().bytes_read());
    Ok(())
}

/// Skip whitespace (and commas between array elements) and peek at the
/// next byte without consuming it
fn next_significant<B: BufRead>(reader: &mut B, skip_commas: bool) -> io::Result<Option<u8>> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        let skipped = buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace() || (skip_commas && **b == b','))
            .count();
        let found = buf.get(skipped).copied();
        reader.consume(skipped);
        if found.is_some() {
            return Ok(found);
        }
    }
}

fn unexpected(byte: u8) -> Error {
    Error::MalformedInput(format!(
        "expected a JSON object or an array of objects, found '{}'",
        char::from(byte).escape_default()
    ))
}

/// Copy the values of required fields into `record`, naming nested
/// fields `parent.child`
fn flatten(
    prefix: &str,
    object: &Map<String, Value>,
    positions: &HashMap<&str, usize>,
    record: &mut [String],
    present: &mut [bool],
) {
    for (key, value) in object {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match value {
            Value::Object(nested) => flatten(&name, nested, positions, record, present),
            Value::Array(_) => {
                if positions.contains_key(name.as_str()) {
                    tracing::warn!("Ignoring array value of field '{}'", name);
                }
            }
            scalar => {
                if let Some(&index) = positions.get(name.as_str()) {
                    record[index] = match scalar {
                        Value::String(s) => s.clone(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    present[index] = true;
                }
            }
        }
    }
}
