//! TAI-UTC offset lookup.
//!
//! UTC started on 1972-01-01 with TAI 10 s ahead of it; every leap second inserted
//! since has added one more second. No insertion has been announced after 2016.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

const INITIAL_OFFSET_S: i64 = 10;

/// (year, month, last day of month, TAI-UTC after the insertion)
const INSERTIONS: [(i32, u32, u32, i64); 27] = [
  (1972, 6, 30, 11),
  (1972, 12, 31, 12),
  (1973, 12, 31, 13),
  (1974, 12, 31, 14),
  (1975, 12, 31, 15),
  (1976, 12, 31, 16),
  (1977, 12, 31, 17),
  (1978, 12, 31, 18),
  (1979, 12, 31, 19),
  (1981, 6, 30, 20),
  (1982, 6, 30, 21),
  (1983, 6, 30, 22),
  (1985, 6, 30, 23),
  (1987, 12, 31, 24),
  (1989, 12, 31, 25),
  (1990, 12, 31, 26),
  (1992, 6, 30, 27),
  (1993, 6, 30, 28),
  (1994, 6, 30, 29),
  (1995, 12, 31, 30),
  (1997, 6, 30, 31),
  (1998, 12, 31, 32),
  (2005, 12, 31, 33),
  (2008, 12, 31, 34),
  (2012, 6, 30, 35),
  (2015, 6, 30, 36),
  (2016, 12, 31, 37),
];

#[derive(Debug, Clone, Copy)]
struct LeapSecond {
  /// 23:59:59 UTC of the day the second was inserted after
  date: DateTime<Utc>,
  tai_offset: TimeDelta,
}

fn table() -> &'static [LeapSecond] {
  static TABLE: OnceLock<Vec<LeapSecond>> = OnceLock::new();
  TABLE.get_or_init(|| {
    INSERTIONS
      .iter()
      .filter_map(|&(y, m, d, offset)| {
        let date = NaiveDate::from_ymd_opt(y, m, d)?.and_hms_opt(23, 59, 59)?.and_utc();
        Some(LeapSecond { date, tai_offset: TimeDelta::seconds(offset) })
      })
      .collect()
  })
}

fn utc_start() -> DateTime<Utc> {
  DateTime::<Utc>::from_timestamp(63072000, 0).unwrap_or_default()
}

/// Offset between TAI and UTC in force at `utc`. Zero before 1972.
pub fn tai_offset(utc: DateTime<Utc>) -> TimeDelta {
  if utc < utc_start() {
    return TimeDelta::zero();
  }
  table()
    .iter()
    .take_while(|entry| utc >= entry.date)
    .last()
    .map(|entry| entry.tai_offset)
    .unwrap_or_else(|| TimeDelta::seconds(INITIAL_OFFSET_S))
}

pub fn current_tai_offset() -> TimeDelta {
  tai_offset(Utc::now())
}

/// Number of leap seconds inserted up to and including `utc`.
pub fn leap_second_count(utc: DateTime<Utc>) -> usize {
  if utc < utc_start() {
    return 0;
  }
  table().iter().take_while(|entry| utc >= entry.date).count()
}

/// True when `utc` is exactly the instant a leap second was inserted after.
pub fn is_leap_second(utc: DateTime<Utc>) -> bool {
  table().iter().any(|entry| entry.date == utc)
}

/// First insertion strictly after `utc`, `None` if none is scheduled.
pub fn next_leap_second(utc: DateTime<Utc>) -> Option<DateTime<Utc>> {
  table().iter().find(|entry| utc < entry.date).map(|entry| entry.date)
}

pub fn convert_utc_to_tai(utc: DateTime<Utc>) -> DateTime<Utc> {
  utc + tai_offset(utc)
}

/// Inverse of [`convert_utc_to_tai`].
///
/// Approximate within a second of an insertion: the offset is re-resolved at
/// `tai - current offset` rather than solved for exactly.
pub fn convert_tai_to_utc(tai: DateTime<Utc>) -> DateTime<Utc> {
  let approx = tai - current_tai_offset();
  tai - tai_offset(approx)
}
