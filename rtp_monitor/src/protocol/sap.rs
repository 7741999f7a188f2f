use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4};
use thiserror::Error;

use crate::byte_utils::{make_u16, read_0term_str_from_buffer, ByteReadError};

pub const SAP_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 255), 9875);

const FLAG_IPV6: u8 = 0x10;
const FLAG_DELETION: u8 = 0x04;
const FLAG_ENCRYPTED: u8 = 0x02;
const FLAG_COMPRESSED: u8 = 0x01;
const SDP_MIME: &str = "application/sdp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SapError {
  #[error("SAP packet truncated")]
  Truncated,
  #[error("unsupported SAP version {0}")]
  UnsupportedVersion(u8),
  #[error("encrypted SAP payloads are not supported")]
  Encrypted,
  #[error("compressed SAP payloads are not supported")]
  Compressed,
  #[error("unsupported SAP payload type {0:?}")]
  UnsupportedPayloadType(String),
  #[error("invalid payload type: {0}")]
  InvalidPayloadType(#[from] ByteReadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SapMessageType {
  Announcement,
  Deletion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SapPacket<'a> {
  pub message_type: SapMessageType,
  pub message_id_hash: u16,
  pub origin: IpAddr,
  pub payload: &'a [u8],
}

pub fn decode(data: &[u8]) -> Result<SapPacket<'_>, SapError> {
  if data.len() < 4 {
    return Err(SapError::Truncated);
  }
  let flags = data[0];
  let version = flags >> 5;
  if version != 1 {
    return Err(SapError::UnsupportedVersion(version));
  }
  if flags & FLAG_ENCRYPTED != 0 {
    return Err(SapError::Encrypted);
  }
  if flags & FLAG_COMPRESSED != 0 {
    return Err(SapError::Compressed);
  }
  let auth_len = (data[1] as usize) * 4;
  let message_id_hash = make_u16(data[2], data[3]);

  let mut pos = 4;
  let origin = if flags & FLAG_IPV6 != 0 {
    let bytes: [u8; 16] = data.get(pos..pos + 16).ok_or(SapError::Truncated)?.try_into().map_err(|_| SapError::Truncated)?;
    pos += 16;
    IpAddr::V6(Ipv6Addr::from(bytes))
  } else {
    let bytes: [u8; 4] = data.get(pos..pos + 4).ok_or(SapError::Truncated)?.try_into().map_err(|_| SapError::Truncated)?;
    pos += 4;
    IpAddr::V4(Ipv4Addr::from(bytes))
  };
  pos += auth_len;
  if pos > data.len() {
    return Err(SapError::Truncated);
  }

  let rest = &data[pos..];
  let payload = if rest.starts_with(b"v=0") {
    rest
  } else {
    let (mime, next) = read_0term_str_from_buffer(data, pos)?;
    if !mime.eq_ignore_ascii_case(SDP_MIME) {
      return Err(SapError::UnsupportedPayloadType(mime.to_owned()));
    }
    &data[next..]
  };

  return Ok(SapPacket {
    message_type: if flags & FLAG_DELETION != 0 { SapMessageType::Deletion } else { SapMessageType::Announcement },
    message_id_hash,
    origin,
    payload,
  });
}
