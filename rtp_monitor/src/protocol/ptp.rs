use binary_layout::prelude::*;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

use crate::ptp_timestamp::ClockIdentity;

pub const HEADER_LENGTH: usize = 44;
pub const PTP_PRIMARY_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);
pub const EVENT_PORT: u16 = 319;
pub const GENERAL_PORT: u16 = 320;

pub const MSG_SYNC: u8 = 0x0;
pub const MSG_FOLLOW_UP: u8 = 0x8;

pub fn event_group() -> SocketAddrV4 {
  SocketAddrV4::new(PTP_PRIMARY_GROUP, EVENT_PORT)
}

pub fn general_group() -> SocketAddrV4 {
  SocketAddrV4::new(PTP_PRIMARY_GROUP, GENERAL_PORT)
}

// common header followed by the origin timestamp shared by Sync and Follow_Up bodies
define_layout!(ptp_header, BigEndian, {
  transport_and_type: u8,
  version: u8,
  message_length: u16,
  domain_number: u8,
  reserved1: u8,
  flags: u16,
  correction: i64,
  reserved2: [u8; 4],
  clock_identity: [u8; 8],
  source_port: u16,
  sequence_id: u16,
  control: u8,
  log_message_interval: i8,
  origin_timestamp: [u8; 10]
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PtpParseError {
  #[error("PTP datagram too short: {0} bytes")]
  TooShort(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpHeader {
  pub message_type: u8,
  pub domain: u8,
  pub clock_identity: ClockIdentity,
  pub sequence_id: u16,
  pub origin_timestamp: [u8; 10],
}

impl PtpHeader {
  pub fn carries_origin_time(&self) -> bool {
    self.message_type == MSG_SYNC || self.message_type == MSG_FOLLOW_UP
  }
}

pub fn parse(data: &[u8]) -> Result<PtpHeader, PtpParseError> {
  if data.len() < HEADER_LENGTH {
    return Err(PtpParseError::TooShort(data.len()));
  }
  let view = ptp_header::View::new(&data[..HEADER_LENGTH]);
  return Ok(PtpHeader {
    message_type: view.transport_and_type().read() & 0x0f,
    domain: view.domain_number().read(),
    clock_identity: ClockIdentity(*view.clock_identity()),
    sequence_id: view.sequence_id().read(),
    origin_timestamp: *view.origin_timestamp(),
  });
}


#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn make_message(msg_type: u8, domain: u8, identity: [u8; 8], ts: [u8; 10]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LENGTH];
    let mut view = ptp_header::View::new(&mut buf[..]);
    view.transport_and_type_mut().write(0x10 | msg_type);
    view.version_mut().write(2);
    view.message_length_mut().write(HEADER_LENGTH as u16);
    view.domain_number_mut().write(domain);
    view.clock_identity_mut().copy_from_slice(&identity);
    view.sequence_id_mut().write(77);
    view.origin_timestamp_mut().copy_from_slice(&ts);
    return buf;
  }

  #[test]
  fn offsets_match_ieee1588() {
    let id = [1, 2, 3, 4, 5, 6, 7, 8];
    let ts = [0, 0, 0x5f, 0x5e, 0x10, 0x00, 0, 0, 0, 9];
    let msg = make_message(MSG_FOLLOW_UP, 3, id, ts);
    assert_eq!(msg[0] & 0x0f, MSG_FOLLOW_UP);
    assert_eq!(msg[4], 3);
    assert_eq!(&msg[20..28], &id);
    assert_eq!(&msg[34..44], &ts);

    let hdr = parse(&msg).unwrap();
    assert_eq!(hdr.message_type, MSG_FOLLOW_UP);
    assert_eq!(hdr.domain, 3);
    assert_eq!(hdr.clock_identity, ClockIdentity(id));
    assert_eq!(hdr.sequence_id, 77);
    assert_eq!(hdr.origin_timestamp, ts);
    assert!(hdr.carries_origin_time());
  }

  #[test]
  fn transport_specific_nibble_is_ignored() {
    let mut msg = make_message(0xb, 0, [0; 8], [0; 10]);
    msg[0] = 0xfb;
    let hdr = parse(&msg).unwrap();
    assert_eq!(hdr.message_type, 0xb);
    assert!(!hdr.carries_origin_time());
  }

  #[test]
  fn short_datagrams_are_rejected() {
    assert_eq!(parse(&[0u8; 43]), Err(PtpParseError::TooShort(43)));
    assert_eq!(parse(&[]), Err(PtpParseError::TooShort(0)));
    assert!(parse(&[0u8; 64]).is_ok());
  }
}
