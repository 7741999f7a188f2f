use crate::common::*;
use crate::multicast::{ConsumerHandle, Datagram, MulticastError, MulticastListener};
use crate::protocol::ptp;
use crate::ptp_timestamp::{ClockIdentity, Timestamp};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
  collections::BTreeMap,
  net::SocketAddr,
  sync::Arc,
};

/// Last known state of a PTP clock seen on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmitter {
  pub domain: u8,
  pub last_timestamp: Timestamp,
  pub interface: String,
}

/// Transmitters keyed by clock identity. Byte order of the identities is the
/// order of their rendered form, so iteration is sorted by identity string.
#[derive(Default)]
struct TransmitterTable {
  transmitters: Mutex<BTreeMap<ClockIdentity, Transmitter>>,
}

impl TransmitterTable {
  fn handle_datagram(&self, interface: &str, data: &[u8], received_at: DateTime<Utc>) {
    let header = match ptp::parse(data) {
      Ok(h) => h,
      Err(e) => {
        trace!("ignoring PTP datagram: {e}");
        return;
      }
    };
    if !header.carries_origin_time() {
      return;
    }
    let timestamp = Timestamp::new(header.origin_timestamp, received_at);
    if timestamp.is_zero() {
      return;
    }
    let mut transmitters = self.transmitters.lock();
    match transmitters.get_mut(&header.clock_identity) {
      Some(t) => {
        t.domain = header.domain;
        t.last_timestamp = timestamp;
        if t.interface != interface {
          t.interface = interface.to_owned();
        }
      }
      None => {
        info!("new PTP transmitter {} in domain {} on {interface}", header.clock_identity, header.domain);
        transmitters.insert(
          header.clock_identity,
          Transmitter { domain: header.domain, last_timestamp: timestamp, interface: interface.to_owned() },
        );
      }
    }
  }
}

/// Passive observer of PTP Sync and Follow_Up messages. Does not take part in
/// the protocol.
pub struct PtpMonitor {
  listener: Arc<MulticastListener>,
  table: Arc<TransmitterTable>,
  consumers: Mutex<Vec<ConsumerHandle>>,
}

impl PtpMonitor {
  pub fn start(listener: Arc<MulticastListener>) -> Result<Self, MulticastError> {
    let table = Arc::new(TransmitterTable::default());
    let mut consumers = vec![];
    for group in [ptp::event_group(), ptp::general_group()] {
      let table = table.clone();
      let handler = Arc::new(move |d: &Datagram| table.handle_datagram(&d.interface, &d.payload, Utc::now()));
      match listener.add_consumer(SocketAddr::V4(group), handler) {
        Ok(handle) => consumers.push(handle),
        Err(e) => {
          for handle in consumers {
            listener.remove_consumer(handle);
          }
          return Err(e);
        }
      }
    }
    return Ok(Self { listener, table, consumers: Mutex::new(consumers) });
  }

  /// Calls `f` for each transmitter, sorted by identity. The table is locked meanwhile.
  pub fn for_each_transmitter(&self, mut f: impl FnMut(&ClockIdentity, &Transmitter)) {
    for (id, t) in self.table.transmitters.lock().iter() {
      f(id, t);
    }
  }

  pub fn transmitters(&self) -> Vec<(ClockIdentity, Transmitter)> {
    self.table.transmitters.lock().iter().map(|(id, t)| (*id, t.clone())).collect()
  }

  pub fn close(&self) {
    for handle in self.consumers.lock().drain(..) {
      self.listener.remove_consumer(handle);
    }
  }
}

impl Drop for PtpMonitor {
  fn drop(&mut self) {
    self.close();
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::ptp::tests::make_message;
  use crate::protocol::ptp::{MSG_FOLLOW_UP, MSG_SYNC};

  const TS: [u8; 10] = [0, 0, 0x65, 0x00, 0x00, 0x00, 0, 0, 0x01, 0x00];

  fn table_ids(table: &TransmitterTable) -> Vec<String> {
    table.transmitters.lock().keys().map(|id| id.to_string()).collect()
  }

  #[test]
  fn sync_and_follow_up_create_and_update() {
    let table = TransmitterTable::default();
    let id = [0x00, 0x1d, 0xc1, 0xff, 0xfe, 0x0e, 0x10, 0xc4];
    let t0 = Utc::now();
    table.handle_datagram("eth0", &make_message(MSG_SYNC, 0, id, TS), t0);

    let mut later = TS;
    later[5] = 1;
    table.handle_datagram("eth1", &make_message(MSG_FOLLOW_UP, 2, id, later), t0);

    let transmitters = table.transmitters.lock();
    assert_eq!(transmitters.len(), 1);
    let t = &transmitters[&ClockIdentity(id)];
    assert_eq!(t.domain, 2);
    assert_eq!(t.last_timestamp.ptp, later);
    assert_eq!(t.interface, "eth1");
  }

  #[test]
  fn other_messages_and_garbage_are_ignored() {
    let table = TransmitterTable::default();
    // Announce
    table.handle_datagram("eth0", &make_message(0xb, 0, [1; 8], TS), Utc::now());
    // Delay_Req
    table.handle_datagram("eth0", &make_message(0x1, 0, [2; 8], TS), Utc::now());
    table.handle_datagram("eth0", &make_message(MSG_SYNC, 0, [3; 8], TS)[..43], Utc::now());
    // two-step Sync carries no time
    table.handle_datagram("eth0", &make_message(MSG_SYNC, 0, [4; 8], [0; 10]), Utc::now());
    assert!(table_ids(&table).is_empty());
  }

  #[test]
  fn iteration_is_sorted_by_identity_string() {
    let table = TransmitterTable::default();
    for first in [0xb0, 0x0a, 0x3f, 0xff] {
      table.handle_datagram("eth0", &make_message(MSG_SYNC, 0, [first, 0, 0, 0, 0, 0, 0, 1], TS), Utc::now());
    }
    let ids = table_ids(&table);
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert_eq!(ids[0], "0a:00:00:00:00:00:00:01");
  }
}
