use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use crate::leap_seconds::convert_utc_to_tai;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// EUI-64 identity of a PTP clock port owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockIdentity(pub [u8; 8]);

impl fmt::Display for ClockIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let o = &self.0;
    write!(
      f,
      "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
      o[0], o[1], o[2], o[3], o[4], o[5], o[6], o[7]
    )
  }
}

/// PTP origin timestamp (48-bit seconds, 32-bit nanoseconds) together with the
/// local time the carrying message arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
  pub ptp: [u8; 10],
  pub received_at: DateTime<Utc>,
}

impl Timestamp {
  pub fn new(ptp: [u8; 10], received_at: DateTime<Utc>) -> Self {
    Self { ptp, received_at }
  }

  pub fn seconds(&self) -> u64 {
    let b = &self.ptp;
    ((b[0] as u64) << 40)
      | ((b[1] as u64) << 32)
      | ((b[2] as u64) << 24)
      | ((b[3] as u64) << 16)
      | ((b[4] as u64) << 8)
      | (b[5] as u64)
  }

  pub fn nanoseconds(&self) -> u64 {
    let b = &self.ptp;
    ((b[6] as u64) << 24) | ((b[7] as u64) << 16) | ((b[8] as u64) << 8) | (b[9] as u64)
  }

  pub fn is_zero(&self) -> bool {
    self.seconds() == 0 && self.nanoseconds() == 0
  }

  /// Exact: the largest possible value needs 80 bits.
  pub fn total_nanoseconds(&self) -> u128 {
    (self.seconds() as u128) * NANOS_PER_SECOND + (self.nanoseconds() as u128)
  }

  /// Media clock position at `sample_rate`, wrapped to 32 bits like an RTP timestamp.
  pub fn in_samples(&self, sample_rate: u32) -> u32 {
    let samples = self.total_nanoseconds() * (sample_rate as u128) / NANOS_PER_SECOND;
    samples as u32
  }

  fn as_datetime(&self) -> Option<DateTime<Utc>> {
    let ns = i64::try_from(self.total_nanoseconds()).ok()?;
    DateTime::<Utc>::UNIX_EPOCH.checked_add_signed(TimeDelta::nanoseconds(ns))
  }

  fn out_of_range(&self) -> String {
    format!("Timestamp out of range ({} s, {} ns)", self.seconds(), self.nanoseconds())
  }

  /// RFC 3339 rendering of the raw epoch-relative time, with as many fraction
  /// digits as needed (none for whole seconds).
  pub fn as_utc(&self) -> String {
    match self.as_datetime() {
      Some(dt) => rfc3339_trimmed(dt),
      None => self.out_of_range(),
    }
  }

  /// Like [`Self::as_utc`], shifted by the TAI-UTC offset in force at that instant.
  pub fn as_tai(&self) -> String {
    match self.as_datetime() {
      Some(dt) => rfc3339_trimmed(convert_utc_to_tai(dt)),
      None => self.out_of_range(),
    }
  }
}

fn rfc3339_trimmed(dt: DateTime<Utc>) -> String {
  let full = dt.to_rfc3339_opts(SecondsFormat::Nanos, true);
  let Some(stamp) = full.strip_suffix('Z') else {
    return full;
  };
  let stamp = stamp.trim_end_matches('0').trim_end_matches('.');
  return format!("{stamp}Z");
}


#[cfg(test)]
mod tests {
  use super::*;

  fn ts(seconds: u64, nanos: u32) -> Timestamp {
    let mut ptp = [0u8; 10];
    ptp[0..6].copy_from_slice(&seconds.to_be_bytes()[2..8]);
    ptp[6..10].copy_from_slice(&nanos.to_be_bytes());
    Timestamp::new(ptp, Utc::now())
  }

  #[test]
  fn clock_identity_format() {
    let id = ClockIdentity([0x00, 0x1d, 0xc1, 0xff, 0xfe, 0x0a, 0xb1, 0x02]);
    assert_eq!(id.to_string(), "00:1d:c1:ff:fe:0a:b1:02");
  }

  #[test]
  fn bit_fields() {
    let t = ts(0x0102_0304_0506, 0x0708_090a);
    assert_eq!(t.seconds(), 0x0102_0304_0506);
    assert_eq!(t.nanoseconds(), 0x0708_090a);
    assert!(!t.is_zero());
    assert!(ts(0, 0).is_zero());
    assert!(!ts(0, 1).is_zero());
  }

  #[test]
  fn total_nanoseconds_does_not_overflow() {
    let t = Timestamp::new([0xff; 10], Utc::now());
    let expected = (0xffff_ffff_ffffu128) * 1_000_000_000 + 0xffff_ffffu128;
    assert_eq!(t.total_nanoseconds(), expected);
    assert!(t.total_nanoseconds() > u64::MAX as u128);
    let _ = t.in_samples(192000);
  }

  #[test]
  fn one_second_in_samples() {
    for rate in [44100, 48000, 96000] {
      assert_eq!(ts(1, 0).in_samples(rate), rate);
    }
    assert_eq!(ts(0, 500_000_000).in_samples(48000), 24000);
    // floor
    assert_eq!(ts(0, 20_833).in_samples(48000), 0);
    assert_eq!(ts(0, 20_834).in_samples(48000), 1);
  }

  #[test]
  fn in_samples_wraps_to_32_bits() {
    let t = ts(100_000, 0);
    assert_eq!(t.in_samples(48000), (100_000u64 * 48000 % (1u64 << 32)) as u32);
  }

  #[test]
  fn utc_rendering() {
    assert_eq!(ts(1, 0).as_utc(), "1970-01-01T00:00:01Z");
    assert_eq!(ts(1_600_000_000, 500_000_000).as_utc(), "2020-09-13T12:26:40.5Z");
    assert_eq!(ts(1_600_000_000, 1_230).as_utc(), "2020-09-13T12:26:40.00000123Z");
    assert_eq!(ts(1_600_000_000, 10).as_utc(), "2020-09-13T12:26:40.00000001Z");
  }

  #[test]
  fn tai_rendering_adds_offset() {
    assert_eq!(ts(1_600_000_000, 0).as_tai(), "2020-09-13T12:27:17Z");
    // before 1972 no offset applies
    assert_eq!(ts(1, 0).as_tai(), "1970-01-01T00:00:01Z");
  }

  #[test]
  fn out_of_range_sentinel() {
    let t = ts(0xffff_ffff_ffff, 7);
    assert_eq!(t.as_utc(), "Timestamp out of range (281474976710655 s, 7 ns)");
    assert_eq!(t.as_tai(), t.as_utc());
  }
}
