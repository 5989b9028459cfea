//! Length-encoded record framing consumed by the worker's input parser
//!
//! Every record, header included, is framed as
//!
//! ```text
//! field_count: u32 | len_0: u32 | bytes_0 | len_1: u32 | bytes_1 | ...
//! ```
//!
//! where each `bytes_i` is the UTF-8 encoding of one field value. The byte
//! order of the integer prefixes comes from [`ByteOrder`].

use crate::config::ByteOrder;
use std::io::{self, BufWriter, Write};

/// Buffered writer emitting length-encoded records
pub struct LengthEncodedWriter<W: Write> {
    inner: BufWriter<W>,
    byte_order: ByteOrder,
}

impl<W: Write> LengthEncodedWriter<W> {
    /// Wrap `inner`, framing prefixes in `byte_order`
    pub fn new(inner: W, byte_order: ByteOrder) -> Self {
        Self {
            inner: BufWriter::with_capacity(64 * 1024, inner),
            byte_order,
        }
    }

    /// Write one record
    pub fn write_record<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        self.write_prefix(fields.len())?;
        for field in fields {
            let bytes = field.as_ref().as_bytes();
            self.write_prefix(bytes.len())?;
            self.inner.write_all(bytes)?;
        }
        Ok(())
    }

    /// Flush buffered records to the underlying writer
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn write_prefix(&mut self, value: usize) -> io::Result<()> {
        let value = u32::try_from(value).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("length {} does not fit the 32-bit wire prefix", value),
            )
        })?;
        let bytes = match self.byte_order {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        };
        self.inner.write_all(&bytes)
    }
}

/// Encode a single record into a new buffer
pub fn encode_record<S: AsRef<str>>(fields: &[S], byte_order: ByteOrder) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = LengthEncodedWriter::new(&mut buf, byte_order);
        writer.write_record(fields)?;
        writer.flush()?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_framing() {
        let bytes = encode_record(&["time", "ab"], ByteOrder::BigEndian).unwrap();
        assert_eq!(
            bytes,
            vec![
                0, 0, 0, 2, // field count
                0, 0, 0, 4, b't', b'i', b'm', b'e', //
                0, 0, 0, 2, b'a', b'b',
            ]
        );
    }

    #[test]
    fn test_little_endian_and_empty_field() {
        let bytes = encode_record(&[""], ByteOrder::LittleEndian).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_lengths_are_utf8_byte_lengths() {
        let bytes = encode_record(&["é"], ByteOrder::BigEndian).unwrap();
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..], "é".as_bytes());
    }
}
