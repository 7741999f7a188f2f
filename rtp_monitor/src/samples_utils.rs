use crate::common::*;
use crate::stream::{ContentType, StreamDescription};
use thiserror::Error;

/// One sample per channel, in channel order.
pub type SampleFrame = Vec<Sample>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
  #[error("unsupported content type {0}")]
  UnsupportedContentType(ContentType),
  #[error("stream has no channels")]
  NoChannels,
}

macro_rules! sample_decoder {
  ($bytes: literal, $decode_function: ident, $to_sample: expr) => {
    #[inline(always)]
    pub fn $decode_function(b: &[u8]) -> Sample {
      debug_assert_eq!(b.len(), $bytes);
      let f: fn(&[u8]) -> USample = $to_sample;
      f(b) as Sample
    }
  };
}

sample_decoder!(2, decode_s16, |b|
  ((b[0] as USample) << 24) |
  ((b[1] as USample) << 16)
);
sample_decoder!(3, decode_s24, |b|
  ((b[0] as USample) << 24) |
  ((b[1] as USample) << 16) |
  ((b[2] as USample) << 8)
);

/// Splits a big-endian interleaved PCM payload into frames.
/// A trailing partial frame is dropped.
pub fn extract_samples(description: &StreamDescription, payload: &[u8]) -> Result<Vec<SampleFrame>, ExtractError> {
  let decode: fn(&[u8]) -> Sample = match description.content_type {
    ContentType::Pcm24 => decode_s24,
    ContentType::Pcm16 => decode_s16,
    other => return Err(ExtractError::UnsupportedContentType(other)),
  };
  let bytes_per_sample = description.content_type.bytes_per_sample().unwrap_or(1);
  let channels = description.channel_count as usize;
  if channels == 0 {
    return Err(ExtractError::NoChannels);
  }
  let frames = payload
    .chunks_exact(bytes_per_sample * channels)
    .map(|frame| frame.chunks_exact(bytes_per_sample).map(decode).collect())
    .collect();
  return Ok(frames);
}
