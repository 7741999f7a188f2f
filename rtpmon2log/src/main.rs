use std::{net::SocketAddr, path::PathBuf, process::exit, sync::Arc, time::{Duration, Instant}};
use log::{debug, error, info, warn};
use clap::Parser;
use tokio::{select, sync::broadcast, time::interval};

use rtp_monitor::{
  multicast_interfaces, spawn_eviction_sweep, spawn_mdns_discovery, MonitorConfig, MulticastListener, PtpMonitor,
  ReceiverError, RtcpEventLog, RtcpPacket, RtcpReceiver, RtpPacket, RtpReceiver, SapListener, Stream, StreamMeters, StreamRegistry, StreamStatistics,
  METER_WINDOW,
};

const REPORT_PERIOD: Duration = Duration::from_secs(5);
const RTCP_LOG_LINES: usize = 256;
const WATCH_RETRY: Duration = Duration::from_secs(60);

/// Logs AES67 / RAVENNA streams and PTP clocks seen on the network
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// interface to listen on, may be repeated (default: every multicast capable one)
  #[arg(long, short)]
  interface: Vec<String>,
  /// SDP file to load, may be repeated
  #[arg(long, short)]
  sdp: Vec<PathBuf>,
  #[arg(long, short)]
  config: Option<PathBuf>,
  /// name or id hash of a stream to receive and report in detail
  #[arg(long, short)]
  watch: Option<String>,
}

/// Receivers and counters attached to the watched stream.
struct Watch {
  stream: Arc<Stream>,
  rtp: RtpReceiver,
  rtcp: RtcpReceiver,
  stats: Arc<StreamStatistics>,
  meters: Arc<StreamMeters>,
  rtcp_log: Arc<RtcpEventLog>,
}

impl Watch {
  fn open(listener: &Arc<MulticastListener>, stream: Arc<Stream>) -> Result<Self, ReceiverError> {
    let sources = stream.description.sources.len();
    let stats = Arc::new(StreamStatistics::new(sources));
    let meters = Arc::new(StreamMeters::new(sources, stream.description.channel_count as usize, METER_WINDOW));
    let rtcp_log = Arc::new(RtcpEventLog::new(RTCP_LOG_LINES));

    let description = stream.description.clone();
    let (st, mt) = (stats.clone(), meters.clone());
    let rtp = RtpReceiver::open(listener.clone(), stream.clone(), Arc::new(move |index: usize, sender: SocketAddr, packet: &RtpPacket| {
      st.record_packet(index, sender, packet);
      match rtp_monitor::extract_samples(&description, &packet.payload) {
        Ok(frames) => mt.record(index, &frames),
        Err(e) => log::trace!("no levels: {e}"),
      }
    }));
    let log = rtcp_log.clone();
    let rtcp = RtcpReceiver::open(listener.clone(), stream.clone(), Arc::new(move |_index: usize, sender: SocketAddr, packet: &RtcpPacket| {
      log.record(sender, packet);
    }));
    let (rtp, rtcp) = (rtp?, rtcp?);
    info!("watching {:?} at {}", stream.name(), stream.address());
    Ok(Self { stream, rtp, rtcp, stats, meters, rtcp_log })
  }

  fn report(&self) {
    self.stats.update_rates_at(std::time::Instant::now());
    for (index, s) in self.stats.snapshot().iter().enumerate() {
      let senders = s.senders.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ");
      info!(
        "{} source {index}: {} packets, {:.1} pkt/s, {} sequence errors, {} bad packets, last ts {}, from [{senders}]",
        self.stream.name(), s.packet_count, s.packet_rate, s.sequence_errors,
        self.rtp.rtp_errors(index) + self.rtcp.rtcp_errors(index), s.last_rtp_timestamp
      );
      let levels = self.meters.channels(index).iter().map(|ch| {
        let db = ch.level_db();
        if db.is_finite() {
          format!("{db:>+6.1} ")
        } else {
          "------ ".to_owned()
        }
      }).collect::<String>();
      info!("{} source {index} levels: {levels}", self.stream.name());
    }
    for line in self.rtcp_log.drain() {
      info!("RTCP {line}");
    }
  }

  fn close(&self) {
    self.rtp.close();
    self.rtcp.close();
  }
}

/// Last stream the watch could not be opened on.
struct FailedWatch {
  stream_id: String,
  at: Instant,
}

impl FailedWatch {
  /// A stream that failed is tried again only after [`WATCH_RETRY`]; any other
  /// stream right away.
  fn may_retry(failed: Option<&Self>, stream_id: &str, now: Instant) -> bool {
    match failed {
      Some(f) if f.stream_id == stream_id => now.saturating_duration_since(f.at) >= WATCH_RETRY,
      _ => true,
    }
  }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
  let logenv = env_logger::Env::default().default_filter_or("info");
  env_logger::init_from_env(logenv);

  let args = Args::parse();

  let mut config = match MonitorConfig::load_or_default(args.config.as_deref()) {
    Ok(c) => c,
    Err(e) => {
      error!("{e}");
      exit(1);
    }
  };
  if !args.interface.is_empty() {
    config.interfaces = args.interface.clone();
  }
  config.sdp_files.extend(args.sdp.iter().cloned());

  let interfaces = match multicast_interfaces(&config.interfaces) {
    Ok(i) => i,
    Err(e) => {
      error!("{e}");
      exit(1);
    }
  };
  info!("listening on {}", interfaces.iter().map(|i| format!("{} ({})", i.name, i.address)).collect::<Vec<_>>().join(", "));

  let listener = Arc::new(MulticastListener::new(interfaces.clone()));
  let registry = Arc::new(StreamRegistry::new());
  registry.on_update(|streams| {
    info!("{} stream(s):", streams.len());
    for s in &streams {
      info!(
        "  {:<32} {} {:<28} {:<20} {} {}",
        s.name(), s.id_hash(), s.address(), s.codec_info(), s.discovery.method(), s.discovery.label()
      );
    }
  });

  let (shutdown_tx, _) = broadcast::channel(1);
  let mut tasks = vec![spawn_eviction_sweep(
    registry.clone(), config.cleanup_period(), config.sap_timeout(), shutdown_tx.subscribe(),
  )];

  let mut sap = None;
  if config.enable_sap {
    match SapListener::start(listener.clone(), registry.clone()) {
      Ok(s) => sap = Some(s),
      Err(e) => error!("SAP discovery disabled: {e}"),
    }
  }
  if config.enable_mdns {
    match spawn_mdns_discovery(registry.clone(), interfaces.clone(), config.rtsp_timeout(), shutdown_tx.subscribe()) {
      Ok(task) => tasks.push(task),
      Err(e) => error!("mDNS discovery disabled: {e}"),
    }
  }
  let ptp = if config.enable_ptp {
    PtpMonitor::start(listener.clone()).map_err(|e| error!("PTP monitor disabled: {e}")).ok()
  } else {
    None
  };

  for (path, result) in registry.load_sdp_files(&config.sdp_files) {
    if result.is_err() {
      warn!("skipped {}", path.display());
    }
  }

  let mut watch: Option<Watch> = None;
  let mut failed_watch: Option<FailedWatch> = None;
  let mut report = interval(REPORT_PERIOD);
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);
  loop {
    select! {
      _ = report.tick() => {
        if let Some(ptp) = &ptp {
          ptp.for_each_transmitter(|id, t| {
            info!("PTP {id} domain {} on {}: {} (TAI {})", t.domain, t.interface, t.last_timestamp.as_utc(), t.last_timestamp.as_tai());
          });
        }
        if let Some(key) = &args.watch {
          if watch.is_none() {
            let now = Instant::now();
            if let Some(stream) = registry.find(key).filter(|s| FailedWatch::may_retry(failed_watch.as_ref(), &s.id, now)) {
              let (name, id) = (stream.name().to_owned(), stream.id.clone());
              match Watch::open(&listener, stream) {
                Ok(w) => {
                  watch = Some(w);
                  failed_watch = None;
                },
                Err(e) => {
                  if failed_watch.as_ref().is_some_and(|f| f.stream_id == id) {
                    debug!("still cannot receive {name:?}: {e}");
                  } else {
                    error!("cannot receive {name:?}: {e}, retrying every {} s", WATCH_RETRY.as_secs());
                  }
                  failed_watch = Some(FailedWatch { stream_id: id, at: now });
                }
              }
            }
          }
        }
        if let Some(w) = &watch {
          w.report();
        }
      },
      _ = &mut ctrl_c => break,
    }
  }

  info!("shutting down");
  let _ = shutdown_tx.send(());
  if let Some(w) = watch {
    w.close();
  }
  if let Some(ptp) = ptp {
    ptp.close();
  }
  drop(sap);
  for task in tasks {
    let _ = task.await;
  }
}
