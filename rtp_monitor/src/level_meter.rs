use crate::common::*;
use crate::ring_buffer::RingBuffer;
use crate::samples_utils::SampleFrame;

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Samples averaged per channel.
pub const METER_WINDOW: usize = 10000;
pub const CLIP_LEVEL: f32 = 0.999;
pub const CLIP_HOLD: Duration = Duration::from_secs(2);

pub struct ChannelMeter {
  levels: RingBuffer<f32>,
  last_clip: Mutex<Option<Instant>>,
}

impl ChannelMeter {
  pub fn new(window: usize) -> Self {
    Self { levels: RingBuffer::new(window), last_clip: Mutex::new(None) }
  }

  pub fn push_at(&self, sample: Sample, now: Instant) {
    let level = ((sample as f32) / (Sample::MAX as f32)).abs().min(1.0);
    if level >= CLIP_LEVEL {
      *self.last_clip.lock() = Some(now);
    }
    self.levels.push(level);
  }

  /// Average absolute level over the window in dBFS. `-inf` for silence or no data.
  pub fn level_db(&self) -> f64 {
    let levels = self.levels.to_vec();
    if levels.is_empty() {
      return f64::NEG_INFINITY;
    }
    let avg = levels.iter().map(|&l| l as f64).sum::<f64>() / levels.len() as f64;
    if !(avg > 0.0) {
      return f64::NEG_INFINITY;
    }
    20.0 * avg.log10()
  }

  pub fn is_clipping_at(&self, now: Instant) -> bool {
    match *self.last_clip.lock() {
      Some(t) => now.saturating_duration_since(t) <= CLIP_HOLD,
      None => false,
    }
  }
}

/// Meters for every channel of every source of a stream.
pub struct StreamMeters {
  sources: Vec<Vec<ChannelMeter>>,
}

impl StreamMeters {
  pub fn new(source_count: usize, channel_count: usize, window: usize) -> Self {
    Self {
      sources: (0..source_count)
        .map(|_| (0..channel_count).map(|_| ChannelMeter::new(window)).collect())
        .collect(),
    }
  }

  /// Feeds decoded frames of one source; unknown sources and surplus channels are ignored.
  pub fn record_at(&self, source_index: usize, frames: &[SampleFrame], now: Instant) {
    let Some(channels) = self.sources.get(source_index) else {
      trace!("frames for unknown source {source_index}");
      return;
    };
    for frame in frames {
      for (meter, &sample) in channels.iter().zip(frame.iter()) {
        meter.push_at(sample, now);
      }
    }
  }

  pub fn record(&self, source_index: usize, frames: &[SampleFrame]) {
    self.record_at(source_index, frames, Instant::now());
  }

  pub fn channels(&self, source_index: usize) -> &[ChannelMeter] {
    self.sources.get(source_index).map(|c| c.as_slice()).unwrap_or(&[])
  }

  pub fn source_count(&self) -> usize {
    self.sources.len()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_and_silent_are_minus_infinity() {
    let m = ChannelMeter::new(4);
    assert_eq!(m.level_db(), f64::NEG_INFINITY);
    m.push_at(0, Instant::now());
    m.push_at(0, Instant::now());
    let db = m.level_db();
    assert!(db.is_infinite() && db < 0.0);
    assert!(!db.is_nan());
  }

  #[test]
  fn half_scale_is_about_minus_six() {
    let m = ChannelMeter::new(8);
    for s in [Sample::MAX / 2, -(Sample::MAX / 2)] {
      m.push_at(s, Instant::now());
    }
    assert!((m.level_db() - (-6.0206)).abs() < 0.01);
  }

  #[test]
  fn window_forgets_old_levels() {
    let m = ChannelMeter::new(2);
    let now = Instant::now();
    m.push_at(Sample::MAX, now);
    m.push_at(0, now);
    m.push_at(0, now);
    assert_eq!(m.level_db(), f64::NEG_INFINITY);
  }

  #[test]
  fn clip_indication_holds() {
    let m = ChannelMeter::new(4);
    let t0 = Instant::now();
    m.push_at(Sample::MIN, t0);
    assert_eq!(m.level_db(), 0.0);
    assert!(m.is_clipping_at(t0 + Duration::from_secs(1)));
    assert!(!m.is_clipping_at(t0 + CLIP_HOLD + Duration::from_millis(1)));
  }

  #[test]
  fn stream_meters_route_frames() {
    let meters = StreamMeters::new(2, 2, 16);
    let now = Instant::now();
    meters.record_at(1, &[vec![Sample::MAX, 0], vec![Sample::MAX, 0, 5]], now);
    meters.record_at(7, &[vec![1, 1]], now);

    assert_eq!(meters.source_count(), 2);
    assert_eq!(meters.channels(0)[0].level_db(), f64::NEG_INFINITY);
    assert_eq!(meters.channels(1)[0].level_db(), 0.0);
    assert_eq!(meters.channels(1)[1].level_db(), f64::NEG_INFINITY);
    assert!(meters.channels(3).is_empty());
  }
}
