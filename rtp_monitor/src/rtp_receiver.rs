use crate::common::*;
use crate::multicast::{ConsumerHandle, Datagram, DatagramHandler, MulticastError, MulticastListener};
use crate::samples_utils::{extract_samples, ExtractError, SampleFrame};
use crate::stream::Stream;

use itertools::Itertools;
use parking_lot::Mutex;
use rtcp::{
  goodbye::Goodbye, receiver_report::ReceiverReport, sender_report::SenderReport,
  source_description::SourceDescription,
};
use std::{
  net::{SocketAddr, SocketAddrV4},
  sync::Arc,
};
use thiserror::Error;
use webrtc_util::marshal::Unmarshal;

pub use rtp::packet::Packet as RtpPacket;
pub type RtcpPacket = dyn rtcp::packet::Packet + Send + Sync;

/// Called with the index of the source the packet came in on, and its sender.
pub type RtpCallback = Arc<dyn Fn(usize, SocketAddr, &RtpPacket) + Send + Sync>;
pub type RtcpCallback = Arc<dyn Fn(usize, SocketAddr, &RtcpPacket) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ReceiverError {
  #[error("cannot receive source {index} ({addr}): {error}")]
  Join {
    index: usize,
    addr: SocketAddr,
    #[source]
    error: MulticastError,
  },
}

type ErrorCounters = Arc<Mutex<Vec<u64>>>;

/// Consumers for every source of one stream, released together.
struct SourceConsumers {
  listener: Arc<MulticastListener>,
  handles: Mutex<Vec<ConsumerHandle>>,
  errors: ErrorCounters,
}

impl SourceConsumers {
  fn open(
    listener: Arc<MulticastListener>,
    stream: &Stream,
    port_offset: u16,
    make_handler: impl Fn(usize, ErrorCounters) -> DatagramHandler,
  ) -> Result<Self, ReceiverError> {
    let sources = &stream.description.sources;
    let errors: ErrorCounters = Arc::new(Mutex::new(vec![0; sources.len()]));
    let mut handles = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
      let addr = SocketAddr::new(source.destination_address, source.destination_port.wrapping_add(port_offset));
      match listener.add_consumer(addr, make_handler(index, errors.clone())) {
        Ok(handle) => handles.push(handle),
        Err(error) => {
          for handle in handles {
            listener.remove_consumer(handle);
          }
          return Err(ReceiverError::Join { index, addr, error });
        }
      }
    }
    debug!("receiving {} on {}", stream.name(), handles.iter().map(|h| h.group()).join(", "));
    return Ok(Self { listener, handles: Mutex::new(handles), errors });
  }

  fn errors(&self, index: usize) -> u64 {
    self.errors.lock().get(index).copied().unwrap_or(0)
  }

  fn groups(&self) -> Vec<SocketAddrV4> {
    self.handles.lock().iter().map(|h| h.group()).collect()
  }

  fn close(&self) {
    for handle in self.handles.lock().drain(..) {
      self.listener.remove_consumer(handle);
    }
  }
}

impl Drop for SourceConsumers {
  fn drop(&mut self) {
    self.close();
  }
}

fn count_error(errors: &ErrorCounters, index: usize) {
  if let Some(counter) = errors.lock().get_mut(index) {
    *counter += 1;
  }
}

fn dispatch_rtp(index: usize, datagram: &Datagram, errors: &ErrorCounters, callback: &RtpCallback) {
  let mut buf = datagram.payload.clone();
  match RtpPacket::unmarshal(&mut buf) {
    Ok(packet) => callback(index, datagram.source, &packet),
    Err(e) => {
      trace!("invalid RTP packet from {}: {e}", datagram.source);
      count_error(errors, index);
    }
  }
}

fn dispatch_rtcp(index: usize, datagram: &Datagram, errors: &ErrorCounters, callback: &RtcpCallback) {
  let mut buf = datagram.payload.clone();
  match rtcp::packet::unmarshal(&mut buf) {
    Ok(packets) => {
      for packet in &packets {
        callback(index, datagram.source, packet.as_ref());
      }
    }
    Err(e) => {
      trace!("invalid RTCP packet from {}: {e}", datagram.source);
      count_error(errors, index);
    }
  }
}

/// Receives the RTP media of every source of a stream.
pub struct RtpReceiver {
  stream: Arc<Stream>,
  consumers: SourceConsumers,
}

impl RtpReceiver {
  /// Joins every source of `stream`. If any join fails, the ones already made are
  /// released and the error is returned.
  pub fn open(listener: Arc<MulticastListener>, stream: Arc<Stream>, callback: RtpCallback) -> Result<Self, ReceiverError> {
    let consumers = SourceConsumers::open(listener, &stream, 0, |index, errors| {
      let callback = callback.clone();
      Arc::new(move |datagram: &Datagram| dispatch_rtp(index, datagram, &errors, &callback))
    })?;
    return Ok(Self { stream, consumers });
  }

  pub fn stream(&self) -> &Arc<Stream> {
    &self.stream
  }

  /// Datagrams on source `index` that did not parse as RTP.
  pub fn rtp_errors(&self, index: usize) -> u64 {
    self.consumers.errors(index)
  }

  pub fn groups(&self) -> Vec<SocketAddrV4> {
    self.consumers.groups()
  }

  pub fn extract_samples(&self, packet: &RtpPacket) -> Result<Vec<SampleFrame>, ExtractError> {
    extract_samples(&self.stream.description, &packet.payload)
  }

  pub fn close(&self) {
    self.consumers.close();
  }
}

/// Receives RTCP (media port + 1) of every source of a stream.
/// Compound packets are split, the callback sees each packet on its own.
pub struct RtcpReceiver {
  consumers: SourceConsumers,
}

impl RtcpReceiver {
  pub fn open(listener: Arc<MulticastListener>, stream: Arc<Stream>, callback: RtcpCallback) -> Result<Self, ReceiverError> {
    let consumers = SourceConsumers::open(listener, &stream, 1, |index, errors| {
      let callback = callback.clone();
      Arc::new(move |datagram: &Datagram| dispatch_rtcp(index, datagram, &errors, &callback))
    })?;
    return Ok(Self { consumers });
  }

  pub fn rtcp_errors(&self, index: usize) -> u64 {
    self.consumers.errors(index)
  }

  pub fn groups(&self) -> Vec<SocketAddrV4> {
    self.consumers.groups()
  }

  pub fn close(&self) {
    self.consumers.close();
  }
}

/// Human readable lines for one RTCP packet. Receiver reports without a sender SSRC
/// produce none.
pub fn describe_rtcp_packet(packet: &RtcpPacket) -> Vec<String> {
  let any = packet.as_any();
  if let Some(sr) = any.downcast_ref::<SenderReport>() {
    return vec![format!(
      "SenderReport from {:x}, NTPTime {}, RTPTime {}, PacketCount {}, OctetCount {}",
      sr.ssrc, sr.ntp_time, sr.rtp_time, sr.packet_count, sr.octet_count
    )];
  }
  if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
    if rr.ssrc == 0 {
      return vec![];
    }
    let mut lines = vec![format!("ReceiverReport from {:x}", rr.ssrc)];
    lines.extend(rr.reports.iter().map(|r| {
      format!(
        "  SSRC={:x}, fractionLost={}/{}, lastSequenceNumber={}",
        r.ssrc, r.fraction_lost, r.total_lost, r.last_sequence_number
      )
    }));
    return lines;
  }
  if let Some(sdes) = any.downcast_ref::<SourceDescription>() {
    let chunks = sdes
      .chunks
      .iter()
      .map(|c| {
        let items = c.items.iter().map(|i| String::from_utf8_lossy(&i.text)).join(", ");
        format!("Source {:x}: [{items}]", c.source)
      })
      .join(", ");
    return vec![format!("SourceDescription: {chunks}")];
  }
  if let Some(bye) = any.downcast_ref::<Goodbye>() {
    let sources = bye.sources.iter().map(|s| format!("{s:x}")).join(", ");
    return vec![format!("Goodbye from {sources}, reason {:?}", String::from_utf8_lossy(&bye.reason))];
  }
  return vec![format!("Unsupported packet type {:?}", packet.header().packet_type)];
}
