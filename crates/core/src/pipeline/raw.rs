//! Untransformed passthrough for pre-formatted feeds

use crate::Result;
use std::io::{ErrorKind, Read, Write};

/// Bytes moved per read
pub(super) const CHUNK_SIZE: usize = 128 * 1024;

/// Copy `input` to `output` chunk by chunk and return the byte count
pub(super) fn pipe<R: Read, W: Write>(mut input: R, mut output: W) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
    output.flush()?;
    Ok(total)
}
