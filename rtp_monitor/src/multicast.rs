use crate::common::*;
use crate::net_utils::{open_multicast_socket, NetworkInterface};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::{
  collections::{hash_map::Entry, BTreeMap, HashMap},
  io,
  net::{SocketAddr, SocketAddrV4},
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};
use thiserror::Error;
use tokio::{
  net::UdpSocket,
  sync::mpsc,
  task::JoinHandle,
  time::sleep,
};

/// Datagrams buffered per consumer before new ones are dropped.
pub const CONSUMER_QUEUE: usize = 256;
const RECV_BUFFER_SIZE: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
  /// interface the datagram was received on
  pub interface: String,
  pub source: SocketAddr,
  pub payload: Bytes,
}

pub type DatagramHandler = Arc<dyn Fn(&Datagram) + Send + Sync>;

#[derive(Debug, Error)]
pub enum MulticastError {
  #[error("{0} is not an IPv4 multicast group")]
  NotIpv4Multicast(SocketAddr),
  #[error("cannot join {group}: {source}")]
  Join { group: SocketAddrV4, source: io::Error },
}

/// Returned by [`MulticastListener::add_consumer`], hand it back to stop receiving.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ConsumerHandle {
  group: SocketAddrV4,
  id: usize,
}

impl ConsumerHandle {
  pub fn group(&self) -> SocketAddrV4 {
    self.group
  }
}

type ConsumerQueues = Arc<RwLock<BTreeMap<usize, mpsc::Sender<Datagram>>>>;

struct Group {
  queues: ConsumerQueues,
  deliveries: HashMap<usize, JoinHandle<()>>,
  receivers: Vec<JoinHandle<()>>,
}

impl Group {
  fn shutdown(self) {
    for r in self.receivers {
      r.abort();
    }
    for (_, d) in self.deliveries {
      d.abort();
    }
  }
}

/// Multicast groups shared between consumers. Each `address:port` gets one socket
/// and receive task per configured interface, so every datagram is labelled with
/// the interface it came in on.
pub struct MulticastListener {
  interfaces: Vec<NetworkInterface>,
  groups: Mutex<HashMap<SocketAddrV4, Group>>,
  next_id: AtomicUsize,
}

impl MulticastListener {
  pub fn new(interfaces: Vec<NetworkInterface>) -> Self {
    Self {
      interfaces,
      groups: Mutex::new(HashMap::new()),
      next_id: AtomicUsize::new(0),
    }
  }

  pub fn interfaces(&self) -> &[NetworkInterface] {
    &self.interfaces
  }

  /// Starts delivering datagrams sent to `addr` to `handler`.
  ///
  /// The handler runs on its own task, in arrival order, and never blocks the socket:
  /// when it falls [`CONSUMER_QUEUE`] datagrams behind, newer datagrams are dropped.
  /// Must be called within a tokio runtime.
  pub fn add_consumer(&self, addr: SocketAddr, handler: DatagramHandler) -> Result<ConsumerHandle, MulticastError> {
    let group = match addr {
      SocketAddr::V4(v4) if v4.ip().is_multicast() => v4,
      _ => return Err(MulticastError::NotIpv4Multicast(addr)),
    };
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);

    let mut groups = self.groups.lock();
    let g = match groups.entry(group) {
      Entry::Occupied(e) => e.into_mut(),
      Entry::Vacant(e) => {
        let queues = ConsumerQueues::default();
        let receivers = self.join_group(group, &queues)?;
        e.insert(Group { queues, deliveries: HashMap::new(), receivers })
      }
    };
    let (tx, delivery) = spawn_delivery(handler);
    g.queues.write().insert(id, tx);
    g.deliveries.insert(id, delivery);
    return Ok(ConsumerHandle { group, id });
  }

  /// Joins `group` on every interface that accepts it; fails only if none does.
  fn join_group(&self, group: SocketAddrV4, queues: &ConsumerQueues) -> Result<Vec<JoinHandle<()>>, MulticastError> {
    let mut receivers = vec![];
    let mut joined = vec![];
    let mut last_error = None;
    for iface in &self.interfaces {
      match open_multicast_socket(group, iface) {
        Ok(socket) => {
          receivers.push(tokio::spawn(receive_loop(socket, group, iface.name.clone(), queues.clone())));
          joined.push(iface.name.as_str());
        }
        Err(e) => {
          warn!("cannot join {group} on {}: {e}", iface.name);
          last_error = Some(e);
        }
      }
    }
    if receivers.is_empty() {
      let source = last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no interfaces to join on"));
      return Err(MulticastError::Join { group, source });
    }
    info!("joined {group} on {}", joined.join(", "));
    return Ok(receivers);
  }

  /// Stops delivery to the consumer. The group is left once its last consumer is gone.
  pub fn remove_consumer(&self, handle: ConsumerHandle) {
    let mut groups = self.groups.lock();
    let Some(g) = groups.get_mut(&handle.group) else {
      return;
    };
    g.queues.write().remove(&handle.id);
    if let Some(delivery) = g.deliveries.remove(&handle.id) {
      delivery.abort();
    }
    if g.deliveries.is_empty() {
      if let Some(g) = groups.remove(&handle.group) {
        debug!("leaving {}", handle.group);
        g.shutdown();
      }
    }
  }

  pub fn group_count(&self) -> usize {
    self.groups.lock().len()
  }
}

impl Drop for MulticastListener {
  fn drop(&mut self) {
    for (_, g) in self.groups.lock().drain() {
      g.shutdown();
    }
  }
}

fn spawn_delivery(handler: DatagramHandler) -> (mpsc::Sender<Datagram>, JoinHandle<()>) {
  let (tx, mut rx) = mpsc::channel::<Datagram>(CONSUMER_QUEUE);
  let task = tokio::spawn(async move {
    while let Some(datagram) = rx.recv().await {
      handler(&datagram);
    }
  });
  (tx, task)
}

/// Queues a copy of `datagram` for every consumer. Returns how many were dropped
/// because a queue was full.
fn fan_out(queues: &ConsumerQueues, datagram: Datagram) -> usize {
  let mut dropped = 0;
  for (id, tx) in queues.read().iter() {
    match tx.try_send(datagram.clone()) {
      Ok(()) => {}
      Err(mpsc::error::TrySendError::Full(_)) => {
        warn!("consumer {id} is not keeping up, dropping datagram from {}", datagram.source);
        dropped += 1;
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
  }
  dropped
}

async fn receive_loop(socket: UdpSocket, group: SocketAddrV4, interface: String, queues: ConsumerQueues) {
  let mut buf = vec![0u8; RECV_BUFFER_SIZE];
  loop {
    match socket.recv_from(&mut buf).await {
      Ok((len, source)) => {
        let datagram = Datagram {
          interface: interface.clone(),
          source,
          payload: Bytes::copy_from_slice(&buf[..len]),
        };
        fan_out(&queues, datagram);
      }
      Err(e) => {
        error!("error receiving from {group} on {interface}: {e:?}");
        sleep(Duration::from_secs(1)).await;
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use std::net::{Ipv4Addr, Ipv6Addr};

  fn datagram(n: u8) -> Datagram {
    Datagram {
      interface: "eth0".to_owned(),
      source: SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 5004),
      payload: Bytes::from(vec![n]),
    }
  }

  #[tokio::test]
  async fn delivers_in_order_to_every_consumer() {
    let seen_a = Arc::new(Mutex::new(vec![]));
    let seen_b = Arc::new(Mutex::new(vec![]));
    let queues = ConsumerQueues::default();

    let (tx_a, task_a) = spawn_delivery({
      let seen = seen_a.clone();
      Arc::new(move |d: &Datagram| seen.lock().push(d.payload[0]))
    });
    let (tx_b, task_b) = spawn_delivery({
      let seen = seen_b.clone();
      Arc::new(move |d: &Datagram| seen.lock().push(d.payload[0]))
    });
    queues.write().insert(0, tx_a);
    queues.write().insert(1, tx_b);

    for n in 0..10 {
      assert_eq!(fan_out(&queues, datagram(n)), 0);
    }
    // closing the queues lets the delivery tasks finish
    queues.write().clear();
    task_a.await.unwrap();
    task_b.await.unwrap();

    assert_eq!(*seen_a.lock(), (0..10).collect::<Vec<u8>>());
    assert_eq!(*seen_b.lock(), (0..10).collect::<Vec<u8>>());
  }

  #[tokio::test]
  async fn full_queue_drops_instead_of_blocking() {
    let queues = ConsumerQueues::default();
    let (tx, mut rx) = mpsc::channel(CONSUMER_QUEUE);
    queues.write().insert(7, tx);

    for n in 0..CONSUMER_QUEUE {
      assert_eq!(fan_out(&queues, datagram(n as u8)), 0);
    }
    assert_eq!(fan_out(&queues, datagram(0)), 1);
    assert_eq!(rx.recv().await.map(|d| d.payload[0]), Some(0));
  }

  #[tokio::test]
  async fn closed_consumer_is_not_counted_as_drop() {
    let queues = ConsumerQueues::default();
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    queues.write().insert(0, tx);
    assert_eq!(fan_out(&queues, datagram(1)), 0);
  }

  #[tokio::test]
  async fn datagrams_carry_the_receiving_interface() {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let group = SocketAddrV4::new(Ipv4Addr::new(239, 69, 0, 1), addr.port());
    let queues = ConsumerQueues::default();
    let (tx, mut rx) = mpsc::channel(CONSUMER_QUEUE);
    queues.write().insert(0, tx);
    let receiver = tokio::spawn(receive_loop(socket, group, "eth1".to_owned(), queues.clone()));

    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    sender.send_to(&[1, 2, 3], addr).await.unwrap();
    let datagram = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    receiver.abort();

    assert_eq!(datagram.interface, "eth1");
    assert_eq!(datagram.source, sender.local_addr().unwrap());
    assert_eq!(&datagram.payload[..], &[1, 2, 3]);
  }

  #[tokio::test]
  async fn group_is_joined_once_per_interface() {
    let lo = NetworkInterface { name: "lo".to_owned(), address: Ipv4Addr::LOCALHOST };
    let unknown = NetworkInterface { name: "eth9".to_owned(), address: Ipv4Addr::new(203, 0, 113, 9) };
    let listener = MulticastListener::new(vec![lo, unknown]);
    let handler: DatagramHandler = Arc::new(|_| {});
    let addr = SocketAddr::new(Ipv4Addr::new(239, 69, 0, 2).into(), 5306);

    let a = listener.add_consumer(addr, handler.clone()).unwrap();
    let b = listener.add_consumer(addr, handler).unwrap();
    assert_eq!(listener.group_count(), 1);
    assert_eq!(listener.groups.lock()[&a.group()].receivers.len(), 1);

    listener.remove_consumer(a);
    assert_eq!(listener.group_count(), 1);
    listener.remove_consumer(b);
    assert_eq!(listener.group_count(), 0);
  }

  #[tokio::test]
  async fn rejects_non_multicast_addresses() {
    let listener = MulticastListener::new(vec![]);
    let handler: DatagramHandler = Arc::new(|_| {});
    let unicast = SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 5004);
    let v6 = SocketAddr::new(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1).into(), 5004);
    assert!(matches!(listener.add_consumer(unicast, handler.clone()), Err(MulticastError::NotIpv4Multicast(_))));
    assert!(matches!(listener.add_consumer(v6, handler.clone()), Err(MulticastError::NotIpv4Multicast(_))));
    assert!(matches!(
      listener.add_consumer(SocketAddr::new(Ipv4Addr::new(239, 1, 2, 3).into(), 5004), handler),
      Err(MulticastError::Join { .. })
    ));
    assert_eq!(listener.group_count(), 0);
  }
}
