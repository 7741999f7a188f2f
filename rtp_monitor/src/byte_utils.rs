use std::str;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ByteReadError {
  #[error("offset {offset} is past the end of a {len} byte buffer")]
  UnexpectedEof { offset: usize, len: usize },
  #[error("string is not valid UTF-8")]
  InvalidUtf8,
}

pub fn make_u16(h: u8, l: u8) -> u16 {
  return ((h as u16) << 8) | (l as u16);
}

/// Reads a NUL-terminated string starting at `offset`.
/// Returns the string and the offset just past the terminator (or the buffer end if there is none).
pub fn read_0term_str_from_buffer(buffer: &[u8], offset: usize) -> Result<(&str, usize), ByteReadError> {
  if offset >= buffer.len() {
    return Err(ByteReadError::UnexpectedEof { offset, len: buffer.len() });
  }
  let (ntpos, next) = match buffer[offset..].iter().position(|c| *c == 0) {
    Some(x) => (offset + x, offset + x + 1),
    None => (buffer.len(), buffer.len()),
  };
  let s = str::from_utf8(&buffer[offset..ntpos]).map_err(|_| ByteReadError::InvalidUtf8)?;
  return Ok((s, next));
}
