use crate::common::*;
use crate::stream::{parse_sdp, Discovery, DiscoveryMethod, SdpError, Stream};

use parking_lot::Mutex;
use std::{
  collections::BTreeMap,
  fs, io,
  path::{Path, PathBuf},
  sync::Arc,
  time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
  select,
  sync::broadcast::Receiver as BroadcastReceiver,
  task::JoinHandle,
  time::{interval, MissedTickBehavior},
};

/// SAP announced streams not re-announced for this long are dropped.
pub const SAP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("failed to parse SDP: {0}")]
  Sdp(#[from] SdpError),
  #[error("cannot read {path:?}: {source}")]
  Io { path: PathBuf, source: io::Error },
}

pub type UpdateCallback = Arc<dyn Fn(Vec<Arc<Stream>>) + Send + Sync>;

/// All currently known streams, one per session identity.
///
/// Every insertion or removal hands a name-sorted snapshot to the registered
/// update callback, outside of the registry lock.
#[derive(Default)]
pub struct StreamRegistry {
  streams: Mutex<BTreeMap<String, Arc<Stream>>>,
  update_callback: Mutex<Option<UpdateCallback>>,
}

fn sorted_by_name(mut streams: Vec<Arc<Stream>>) -> Vec<Arc<Stream>> {
  streams.sort_by(|a, b| a.name().cmp(b.name()));
  streams
}

impl StreamRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers the single subscriber, replacing any previous one.
  pub fn on_update(&self, callback: impl Fn(Vec<Arc<Stream>>) + Send + Sync + 'static) {
    *self.update_callback.lock() = Some(Arc::new(callback));
  }

  fn publish(&self) {
    let Some(callback) = self.update_callback.lock().clone() else {
      return;
    };
    let snapshot = self.streams.lock().values().cloned().collect();
    callback(sorted_by_name(snapshot));
  }

  /// Inserts `stream`, replacing the entry with the same identity.
  pub fn add(&self, stream: Stream) -> Arc<Stream> {
    let stream = Arc::new(stream);
    let previous = self.streams.lock().insert(stream.id.clone(), stream.clone());
    if previous.is_none() {
      info!("new stream {:?} ({}) via {} on {}", stream.name(), stream.id_hash(), stream.discovery.method(), stream.discovery.label());
    }
    self.publish();
    stream
  }

  pub fn add_from_sdp(&self, sdp: &[u8], discovery: Discovery) -> Result<Arc<Stream>, RegistryError> {
    let (description, id) = parse_sdp(sdp)?;
    return Ok(self.add(Stream::new(id, description, sdp.to_vec(), discovery)));
  }

  /// Removes the stream if present. Publishes either way.
  pub fn remove(&self, id: &str) -> Option<Arc<Stream>> {
    let removed = self.streams.lock().remove(id);
    if let Some(s) = &removed {
      info!("removed stream {:?} ({})", s.name(), s.id_hash());
    }
    self.publish();
    removed
  }

  pub fn get(&self, id: &str) -> Option<Arc<Stream>> {
    self.streams.lock().get(id).cloned()
  }

  /// Looks a stream up by identity, identity hash or name.
  pub fn find(&self, key: &str) -> Option<Arc<Stream>> {
    let streams = self.streams.lock();
    if let Some(s) = streams.get(key) {
      return Some(s.clone());
    }
    streams.values().find(|s| s.id_hash() == key || s.name() == key).cloned()
  }

  pub fn all(&self) -> Vec<Arc<Stream>> {
    sorted_by_name(self.streams.lock().values().cloned().collect())
  }

  pub fn count(&self) -> usize {
    self.streams.lock().len()
  }

  /// Drops SAP-announced streams older than `max_age` as of `now`; other discovery
  /// methods never expire. Publishes once if anything was removed.
  pub fn evict_stale_at(&self, now: Instant, max_age: Duration) -> usize {
    let removed = {
      let mut streams = self.streams.lock();
      let before = streams.len();
      streams.retain(|_, s| !(s.discovery.method() == DiscoveryMethod::Sap && s.is_stale_at(now, max_age)));
      before - streams.len()
    };
    if removed > 0 {
      info!("evicted {removed} stale SAP stream(s)");
      self.publish();
    }
    removed
  }

  pub fn evict_stale(&self, max_age: Duration) -> usize {
    self.evict_stale_at(Instant::now(), max_age)
  }

  pub fn load_sdp_file(&self, path: &Path) -> Result<Arc<Stream>, RegistryError> {
    let data = fs::read(path).map_err(|source| RegistryError::Io { path: path.to_owned(), source })?;
    let stream = self.add_from_sdp(&data, Discovery::Manual { path: path.to_owned() })?;
    info!("loaded stream {:?} from {}", stream.name(), path.display());
    return Ok(stream);
  }

  /// Loads each file independently; a failing file does not affect the others.
  pub fn load_sdp_files<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<(PathBuf, Result<Arc<Stream>, RegistryError>)> {
    paths
      .iter()
      .map(|p| {
        let p = p.as_ref();
        let r = self.load_sdp_file(p);
        if let Err(e) = &r {
          error!("failed to load SDP file {}: {e}", p.display());
        }
        (p.to_owned(), r)
      })
      .collect()
  }
}

/// Periodically evicts stale SAP streams until `shutdown` fires.
pub fn spawn_eviction_sweep(
  registry: Arc<StreamRegistry>,
  period: Duration,
  max_age: Duration,
  mut shutdown: BroadcastReceiver<()>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      select! {
        _ = ticker.tick() => {
          registry.evict_stale(max_age);
        },
        _ = shutdown.recv() => {
          debug!("eviction sweep shutting down");
          break;
        }
      }
    }
  })
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::stream::tests::{sdp_with_origin, AES67_SDP};
  use std::io::Write;
  use tokio::sync::{broadcast, mpsc};

  fn sap() -> Discovery {
    Discovery::Sap { interface: "eth0".to_owned() }
  }

  fn recording(registry: &StreamRegistry) -> Arc<Mutex<Vec<Vec<String>>>> {
    let published = Arc::new(Mutex::new(vec![]));
    let p = published.clone();
    registry.on_update(move |streams| p.lock().push(streams.iter().map(|s| s.name().to_owned()).collect()));
    published
  }

  fn seen_at(registry: &StreamRegistry, id: &str, at: Instant) {
    let mut streams = registry.streams.lock();
    let s = streams.get_mut(id).unwrap();
    let mut copy = (**s).clone();
    copy.last_seen = at;
    *s = Arc::new(copy);
  }

  #[test]
  fn same_identity_is_one_stream() {
    let registry = StreamRegistry::new();
    let published = recording(&registry);
    let a = registry.add_from_sdp(sdp_with_origin(1, 5004, "first").as_bytes(), sap()).unwrap();
    let b = registry.add_from_sdp(sdp_with_origin(1, 5006, "renamed").as_bytes(), sap()).unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(registry.count(), 1);
    assert_eq!(registry.get(&a.id).unwrap().name(), "renamed");
    assert_eq!(*published.lock(), vec![vec!["first".to_owned()], vec!["renamed".to_owned()]]);
  }

  #[test]
  fn snapshots_sorted_by_name() {
    let registry = StreamRegistry::new();
    for (i, name) in ["zeta", "alpha", "mid"].iter().enumerate() {
      registry.add_from_sdp(sdp_with_origin(i as u64, 5004, name).as_bytes(), sap()).unwrap();
    }
    let names: Vec<_> = registry.all().iter().map(|s| s.name().to_owned()).collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
  }

  #[test]
  fn remove_and_lookup() {
    let registry = StreamRegistry::new();
    let published = recording(&registry);
    let s = registry.add_from_sdp(AES67_SDP.as_bytes(), sap()).unwrap();
    assert!(registry.find(&s.id_hash()).is_some());
    assert!(registry.find("Stage Box 1").is_some());
    assert!(registry.find(&s.id).is_some());
    assert!(registry.find("nope").is_none());

    assert!(registry.remove(&s.id).is_some());
    assert!(registry.remove(&s.id).is_none());
    assert_eq!(registry.count(), 0);
    assert_eq!(published.lock().len(), 3);
  }

  #[test]
  fn parse_failure_does_not_publish() {
    let registry = StreamRegistry::new();
    let published = recording(&registry);
    assert!(matches!(registry.add_from_sdp(b"garbage", sap()), Err(RegistryError::Sdp(_))));
    assert!(published.lock().is_empty());
  }

  #[test]
  fn only_sap_streams_expire() {
    let registry = StreamRegistry::new();
    let published = recording(&registry);
    let old_sap = registry.add_from_sdp(sdp_with_origin(1, 5004, "sap").as_bytes(), sap()).unwrap();
    let old_mdns = registry
      .add_from_sdp(sdp_with_origin(2, 5004, "mdns").as_bytes(), Discovery::Mdns { interface: "eth0".to_owned() })
      .unwrap();
    let old_manual = registry
      .add_from_sdp(sdp_with_origin(3, 5004, "manual").as_bytes(), Discovery::Manual { path: "x.sdp".into() })
      .unwrap();
    let fresh_sap = registry.add_from_sdp(sdp_with_origin(4, 5004, "fresh").as_bytes(), sap()).unwrap();
    let later = Instant::now() + Duration::from_secs(11 * 60);
    seen_at(&registry, &fresh_sap.id, later);
    published.lock().clear();

    assert_eq!(registry.evict_stale_at(later, SAP_TIMEOUT), 1);
    assert!(registry.get(&old_sap.id).is_none());
    assert!(registry.get(&old_mdns.id).is_some());
    assert!(registry.get(&old_manual.id).is_some());
    assert!(registry.get(&fresh_sap.id).is_some());
    assert_eq!(published.lock().len(), 1);

    assert_eq!(registry.evict_stale_at(later, SAP_TIMEOUT), 0);
    assert_eq!(published.lock().len(), 1);
  }

  #[test]
  fn manual_files_load_independently() {
    let dir = std::env::temp_dir().join(format!("rtp_monitor_registry_{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let good = dir.join("good.sdp");
    let bad = dir.join("bad.sdp");
    let missing = dir.join("missing.sdp");
    fs::File::create(&good).unwrap().write_all(AES67_SDP.as_bytes()).unwrap();
    fs::File::create(&bad).unwrap().write_all(b"not sdp").unwrap();

    let registry = StreamRegistry::new();
    let results = registry.load_sdp_files(&[&bad, &good, &missing]);
    assert!(matches!(results[0].1, Err(RegistryError::Sdp(_))));
    assert!(results[1].1.is_ok());
    assert!(matches!(results[2].1, Err(RegistryError::Io { .. })));
    assert_eq!(registry.count(), 1);

    let stream = registry.all().remove(0);
    assert_eq!(stream.discovery, Discovery::Manual { path: good.clone() });
    assert_eq!(stream.sdp, AES67_SDP.as_bytes());
    fs::remove_dir_all(&dir).unwrap();
  }

  #[tokio::test]
  async fn sweep_runs_until_shutdown() {
    let registry = Arc::new(StreamRegistry::new());
    registry.add_from_sdp(AES67_SDP.as_bytes(), sap()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.on_update(move |streams| {
      let _ = tx.send(streams.len());
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweep = spawn_eviction_sweep(registry.clone(), Duration::from_millis(10), Duration::from_millis(50), shutdown_rx);
    let published = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(published, Some(0));
    assert_eq!(registry.count(), 0);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), sweep).await.unwrap().unwrap();
  }
}
