use crate::common::*;
use crate::ring_buffer::RingBuffer;
use crate::rtp_receiver::{describe_rtcp_packet, RtcpPacket, RtpPacket};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::{
  collections::BTreeSet,
  net::SocketAddr,
  time::{Duration, Instant},
};

/// Counters for one source of a stream, fed from its RTP receiver callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceStatistics {
  pub packet_count: u64,
  pub sequence_errors: u64,
  /// packets per second over the last rate window
  pub packet_rate: f64,
  pub last_sequence: u16,
  pub last_rtp_timestamp: u32,
  pub senders: BTreeSet<SocketAddr>,
  rate_base_count: u64,
}

impl SourceStatistics {
  pub fn record(&mut self, sender: SocketAddr, sequence: u16, rtp_timestamp: u32) {
    self.packet_count += 1;
    self.last_rtp_timestamp = rtp_timestamp;
    self.senders.insert(sender);
    if self.packet_count > 1 && sequence != self.last_sequence.wrapping_add(1) {
      self.sequence_errors += 1;
    }
    self.last_sequence = sequence;
  }

  fn update_rate(&mut self, elapsed: Duration) {
    self.packet_rate = (self.packet_count - self.rate_base_count) as f64 / elapsed.as_secs_f64();
    self.rate_base_count = self.packet_count;
  }
}

struct StatsState {
  sources: Vec<SourceStatistics>,
  rate_window_start: Instant,
}

/// Per-source statistics of one stream. Packets for unknown source indices are ignored.
pub struct StreamStatistics {
  state: Mutex<StatsState>,
}

impl StreamStatistics {
  pub fn new(source_count: usize) -> Self {
    Self {
      state: Mutex::new(StatsState {
        sources: vec![SourceStatistics::default(); source_count],
        rate_window_start: Instant::now(),
      }),
    }
  }

  pub fn record_packet(&self, source_index: usize, sender: SocketAddr, packet: &RtpPacket) {
    let mut st = self.state.lock();
    match st.sources.get_mut(source_index) {
      Some(s) => s.record(sender, packet.header.sequence_number, packet.header.timestamp),
      None => trace!("packet for unknown source {source_index}"),
    }
  }

  /// Recomputes packet rates once at least a second has passed since the last time.
  pub fn update_rates_at(&self, now: Instant) {
    let mut st = self.state.lock();
    let elapsed = now.saturating_duration_since(st.rate_window_start);
    if elapsed < Duration::from_secs(1) {
      return;
    }
    st.sources.iter_mut().for_each(|s| s.update_rate(elapsed));
    st.rate_window_start = now;
  }

  pub fn snapshot(&self) -> Vec<SourceStatistics> {
    self.state.lock().sources.clone()
  }
}

/// Rolling, timestamped log of RTCP events.
pub struct RtcpEventLog {
  lines: RingBuffer<String>,
}

impl RtcpEventLog {
  pub fn new(capacity: usize) -> Self {
    Self { lines: RingBuffer::new(capacity) }
  }

  pub fn record_at(&self, now: DateTime<Utc>, sender: SocketAddr, packet: &RtcpPacket) {
    let ts = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    for line in describe_rtcp_packet(packet) {
      self.lines.push(format!("{ts} | {sender} | {line}"));
    }
  }

  pub fn record(&self, sender: SocketAddr, packet: &RtcpPacket) {
    self.record_at(Utc::now(), sender, packet);
  }

  pub fn lines(&self) -> Vec<String> {
    self.lines.to_vec()
  }

  /// Removes and returns the lines not yet taken.
  pub fn drain(&self) -> Vec<String> {
    std::iter::from_fn(|| self.lines.pop()).collect()
  }
}
