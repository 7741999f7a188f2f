use crate::common::*;
use crate::mdns_client::{MdnsBrowser, MdnsError, MdnsEvent, ResolvedService, RAVENNA_SESSION_SERVICE};
use crate::net_utils::{interface_for_peer, NetworkInterface};
use crate::rtsp_client::{describe, rtsp_url};
use crate::stream::Discovery;
use crate::stream_registry::StreamRegistry;

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
  select,
  sync::{broadcast::Receiver as BroadcastReceiver, mpsc},
  task::JoinHandle,
};

/// Default limit for one RTSP DESCRIBE round-trip.
pub const RTSP_TIMEOUT: Duration = Duration::from_secs(60);

/// Adds streams announced over DNS-SD by fetching their SDP with RTSP DESCRIBE.
///
/// Keeps its own index of service name -> stream identity so a service goodbye
/// can remove the right stream. A service still in the index with no identity
/// has a DESCRIBE in flight.
pub struct MdnsDiscovery {
  registry: Arc<StreamRegistry>,
  interfaces: Vec<NetworkInterface>,
  rtsp_timeout: Duration,
  services: Mutex<HashMap<String, Option<String>>>,
}

impl MdnsDiscovery {
  pub fn new(registry: Arc<StreamRegistry>, interfaces: Vec<NetworkInterface>, rtsp_timeout: Duration) -> Self {
    Self { registry, interfaces, rtsp_timeout, services: Mutex::new(HashMap::new()) }
  }

  /// Fetches and registers the session of a resolved service. Failures are
  /// logged; a service seen for the first time is then forgotten, one that
  /// was already registered keeps its stream.
  pub async fn service_found(&self, service: ResolvedService) {
    let Some(host) = service.preferred_address() else {
      warn!("mDNS service {:?} resolved without addresses", service.key);
      return;
    };
    self.services.lock().entry(service.key.clone()).or_insert(None);

    let sdp = match rtsp_url(host, service.port, &service.instance) {
      Ok(url) => {
        debug!("fetching {url}");
        describe(&url, self.rtsp_timeout).await.map_err(|e| format!("DESCRIBE {url} failed: {e}"))
      }
      Err(e) => Err(e.to_string()),
    };
    let sdp = match sdp {
      Ok(sdp) => sdp,
      Err(e) => {
        warn!("mDNS service {:?}: {e}", service.key);
        self.forget_pending(&service.key);
        return;
      }
    };

    if !self.services.lock().contains_key(&service.key) {
      debug!("mDNS service {:?} went away during DESCRIBE", service.key);
      return;
    }
    let interface = interface_for_peer(&self.interfaces, host);
    let stream = match self.registry.add_from_sdp(&sdp, Discovery::Mdns { interface }) {
      Ok(stream) => stream,
      Err(e) => {
        warn!("invalid SDP from mDNS service {:?}: {e}", service.key);
        self.forget_pending(&service.key);
        return;
      }
    };

    let stale = {
      let mut services = self.services.lock();
      match services.get_mut(&service.key) {
        Some(entry) => entry.replace(stream.id.clone()).filter(|old| *old != stream.id),
        None => {
          debug!("mDNS service {:?} went away while being added", service.key);
          Some(stream.id.clone())
        }
      }
    };
    if let Some(id) = stale {
      self.registry.remove(&id);
    }
  }

  fn forget_pending(&self, key: &str) {
    let mut services = self.services.lock();
    if matches!(services.get(key), Some(None)) {
      services.remove(key);
    }
  }

  pub fn service_lost(&self, key: &str) {
    let removed = self.services.lock().remove(key);
    if let Some(Some(id)) = removed {
      self.registry.remove(&id);
    }
  }

  pub fn service_count(&self) -> usize {
    self.services.lock().values().filter(|id| id.is_some()).count()
  }

  /// Consumes browser events until the channel closes or `shutdown` fires.
  /// Each DESCRIBE runs in its own task so a slow device does not hold up others.
  pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MdnsEvent>, mut shutdown: BroadcastReceiver<()>) {
    loop {
      select! {
        event = events.recv() => {
          match event {
            Some(MdnsEvent::Resolved(service)) => {
              let this = self.clone();
              tokio::spawn(async move { this.service_found(service).await });
            },
            Some(MdnsEvent::Removed { key }) => self.service_lost(&key),
            None => break,
          }
        },
        _ = shutdown.recv() => break,
      }
    }
    debug!("mDNS discovery stopped");
  }
}

/// Starts browsing for RAVENNA sessions and feeds them into `registry`.
pub fn spawn_mdns_discovery(
  registry: Arc<StreamRegistry>,
  interfaces: Vec<NetworkInterface>,
  rtsp_timeout: Duration,
  shutdown: BroadcastReceiver<()>,
) -> Result<JoinHandle<()>, MdnsError> {
  let (mut browser, events) = MdnsBrowser::start(RAVENNA_SESSION_SERVICE)?;
  let discovery = Arc::new(MdnsDiscovery::new(registry, interfaces, rtsp_timeout));
  return Ok(tokio::spawn(async move {
    discovery.run(events, shutdown).await;
    browser.shutdown();
  }));
}
