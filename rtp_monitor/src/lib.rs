// RTP-Monitor
// Copyright (C) 2024 The RTP-Monitor authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! RTP-Monitor - discovery and liveness monitoring of AES67 / RAVENNA audio streams
//!
//! Streams are discovered through SAP announcements, DNS-SD (with an RTSP
//! DESCRIBE for the SDP) or local SDP files, and kept in a [`StreamRegistry`].
//! Any known stream can then be opened with [`RtpReceiver`] / [`RtcpReceiver`]
//! to look at its packets, statistics and channel levels. [`PtpMonitor`]
//! passively lists the PTP clocks heard on the network.
//!
//! For example, this will print the stream list whenever it changes:
//! ```no_run
//! use std::sync::Arc;
//! use rtp_monitor::{multicast_interfaces, MulticastListener, SapListener, StreamRegistry};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!   let listener = Arc::new(MulticastListener::new(multicast_interfaces(&[]).unwrap()));
//!   let registry = Arc::new(StreamRegistry::new());
//!   registry.on_update(|streams| {
//!     for s in &streams {
//!       println!("{:<32} {:<24} {}", s.name(), s.address(), s.codec_info());
//!     }
//!   });
//!   let _sap = SapListener::start(listener, registry.clone()).unwrap();
//!   let _ = tokio::signal::ctrl_c().await;
//! }
//! ```
//!


mod byte_utils;
mod common;
mod config;
pub mod leap_seconds;
mod level_meter;
mod mdns_client;
mod mdns_discovery;
mod multicast;
mod net_utils;
mod protocol;
mod ptp_monitor;
mod ptp_timestamp;
mod ring_buffer;
mod rtp_receiver;
mod rtsp_client;
mod samples_utils;
mod sap_listener;
mod stream;
mod stream_registry;
mod stream_stats;

pub use common::Sample;
pub use config::{ConfigError, MonitorConfig};
pub use level_meter::{ChannelMeter, StreamMeters, CLIP_HOLD, METER_WINDOW};
pub use mdns_client::{MdnsBrowser, MdnsError, MdnsEvent, ResolvedService, RAVENNA_SESSION_SERVICE};
pub use mdns_discovery::{spawn_mdns_discovery, MdnsDiscovery, RTSP_TIMEOUT};
pub use multicast::{ConsumerHandle, Datagram, MulticastError, MulticastListener, CONSUMER_QUEUE};
pub use net_utils::{multicast_interfaces, InterfaceError, NetworkInterface};
pub use ptp_monitor::{PtpMonitor, Transmitter};
pub use ptp_timestamp::{ClockIdentity, Timestamp};
pub use ring_buffer::RingBuffer;
pub use rtp_receiver::{
  describe_rtcp_packet, ReceiverError, RtcpCallback, RtcpPacket, RtcpReceiver, RtpCallback, RtpPacket, RtpReceiver,
};
pub use rtsp_client::{describe, rtsp_url, DescribeError};
pub use samples_utils::{extract_samples, ExtractError, SampleFrame};
pub use sap_listener::{handle_sap_datagram, SapListener};
pub use stream::{parse_sdp, ContentType, Discovery, DiscoveryMethod, SdpError, Stream, StreamDescription, StreamSource};
pub use stream_registry::{spawn_eviction_sweep, RegistryError, StreamRegistry, CLEANUP_PERIOD, SAP_TIMEOUT};
pub use stream_stats::{RtcpEventLog, SourceStatistics, StreamStatistics};

pub mod utils {
  pub use crate::common::LogAndForget;
}
