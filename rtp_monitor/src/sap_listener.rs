use crate::common::*;
use crate::multicast::{ConsumerHandle, Datagram, MulticastError, MulticastListener};
use crate::protocol::sap::{self, SapMessageType};
use crate::stream::{parse_sdp, Discovery};
use crate::stream_registry::StreamRegistry;

use std::net::SocketAddr;
use std::sync::Arc;

/// Handles one datagram received on the SAP group. Malformed announcements are
/// logged and dropped.
pub fn handle_sap_datagram(registry: &StreamRegistry, datagram: &Datagram) {
  let packet = match sap::decode(&datagram.payload) {
    Ok(p) => p,
    Err(e) => {
      debug!("dropping SAP packet from {}: {e}", datagram.source);
      return;
    }
  };
  match packet.message_type {
    SapMessageType::Announcement => {
      let discovery = Discovery::Sap { interface: datagram.interface.clone() };
      if let Err(e) = registry.add_from_sdp(packet.payload, discovery) {
        warn!("invalid SDP announced by {} (origin {}): {e}", datagram.source, packet.origin);
      }
    }
    SapMessageType::Deletion => match parse_sdp(packet.payload) {
      Ok((_, id)) => {
        if registry.get(&id).is_some() {
          registry.remove(&id);
        }
      }
      Err(e) => debug!("cannot identify session in SAP deletion from {}: {e}", datagram.source),
    },
  }
}

/// Feeds SAP announcements heard on all monitored interfaces into the registry.
pub struct SapListener {
  listener: Arc<MulticastListener>,
  handle: Option<ConsumerHandle>,
}

impl SapListener {
  pub fn start(listener: Arc<MulticastListener>, registry: Arc<StreamRegistry>) -> Result<Self, MulticastError> {
    let handle = listener.add_consumer(
      SocketAddr::V4(sap::SAP_GROUP),
      Arc::new(move |d: &Datagram| handle_sap_datagram(&registry, d)),
    )?;
    info!("listening for SAP announcements on {}", sap::SAP_GROUP);
    return Ok(Self { listener, handle: Some(handle) });
  }

  pub fn close(&mut self) {
    if let Some(handle) = self.handle.take() {
      self.listener.remove_consumer(handle);
    }
  }
}

impl Drop for SapListener {
  fn drop(&mut self) {
    self.close();
  }
}
