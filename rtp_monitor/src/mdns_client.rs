use crate::common::*;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::{io, net::IpAddr};
use thiserror::Error;
use tokio::sync::mpsc;

/// DNS-SD subtype under which RAVENNA devices announce their RTSP sessions.
pub const RAVENNA_SESSION_SERVICE: &str = "_ravenna_session._sub._rtsp._tcp.local.";

#[derive(Debug, Error)]
pub enum MdnsError {
  #[error("mDNS daemon error: {0}")]
  Daemon(#[from] mdns_sd::Error),
  #[error("cannot start mDNS event thread: {0}")]
  Thread(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
  /// full service name, unique per announced session
  pub key: String,
  pub instance: String,
  pub addresses: Vec<IpAddr>,
  pub port: u16,
}

impl ResolvedService {
  /// Prefers an IPv4 address since sessions are reached over IPv4 multicast anyway.
  pub fn preferred_address(&self) -> Option<IpAddr> {
    self.addresses.iter().find(|a| a.is_ipv4()).or(self.addresses.first()).copied()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdnsEvent {
  Resolved(ResolvedService),
  Removed { key: String },
}

/// Instance label of a full service name, e.g. `Stage Box` out of
/// `Stage Box._rtsp._tcp.local.` when browsing a subtype of `_rtsp._tcp.local.`.
pub fn instance_name(fullname: &str, service_type: &str) -> String {
  let base_type = service_type.split_once("._sub.").map(|(_, t)| t).unwrap_or(service_type);
  for ty in [service_type, base_type] {
    if let Some(instance) = fullname.strip_suffix(ty).and_then(|s| s.strip_suffix('.')) {
      return instance.to_owned();
    }
  }
  fullname.split('.').next().unwrap_or(fullname).to_owned()
}

/// Browses one DNS-SD service type and turns daemon events into [`MdnsEvent`]s.
pub struct MdnsBrowser {
  daemon: ServiceDaemon,
  service_type: String,
  running: bool,
}

impl MdnsBrowser {
  pub fn start(service_type: &str) -> Result<(Self, mpsc::UnboundedReceiver<MdnsEvent>), MdnsError> {
    let daemon = ServiceDaemon::new()?;
    let events = daemon.browse(service_type)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let ty = service_type.to_owned();
    std::thread::Builder::new().name("mdns-browse".to_owned()).spawn(move || {
      while let Ok(event) = events.recv() {
        let event = match event {
          ServiceEvent::ServiceResolved(info) => MdnsEvent::Resolved(ResolvedService {
            key: info.get_fullname().to_owned(),
            instance: instance_name(info.get_fullname(), &ty),
            addresses: info.get_addresses().iter().map(|a| IpAddr::from(*a)).collect(),
            port: info.get_port(),
          }),
          ServiceEvent::ServiceRemoved(_, fullname) => MdnsEvent::Removed { key: fullname },
          other => {
            trace!("mDNS: {other:?}");
            continue;
          }
        };
        if tx.send(event).is_err() {
          break;
        }
      }
      debug!("mDNS browse of {ty} finished");
    })?;
    info!("browsing mDNS for {service_type}");
    return Ok((Self { daemon, service_type: service_type.to_owned(), running: true }, rx));
  }

  pub fn shutdown(&mut self) {
    if !std::mem::replace(&mut self.running, false) {
      return;
    }
    self.daemon.stop_browse(&self.service_type).log_and_forget();
    self.daemon.shutdown().log_and_forget();
  }
}

impl Drop for MdnsBrowser {
  fn drop(&mut self) {
    self.shutdown();
  }
}
