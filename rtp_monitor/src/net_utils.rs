use crate::common::*;

use std::{
  io,
  net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
};
use itertools::Itertools;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;

pub const UNKNOWN_INTERFACE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
  pub name: String,
  pub address: Ipv4Addr,
}

#[derive(Debug, Error)]
pub enum InterfaceError {
  #[error("cannot list network interfaces: {0}")]
  Listing(String),
  #[error("interface {0:?} not found or has no IPv4 address")]
  UnknownInterface(String),
  #[error("no multicast capable interface found")]
  NoneUsable,
}

/// Filters `(name, address)` pairs down to the interfaces the monitor listens on.
///
/// Without `names`, every non-loopback interface with an IPv4 address is used;
/// otherwise exactly the named ones, in the given order.
pub fn select_interfaces(all: &[(String, IpAddr)], names: &[String]) -> Result<Vec<NetworkInterface>, InterfaceError> {
  let usable = all
    .iter()
    .filter_map(|(name, addr)| match addr {
      IpAddr::V4(v4) if !v4.is_loopback() => Some(NetworkInterface { name: name.clone(), address: *v4 }),
      _ => None,
    })
    .unique_by(|iface| iface.name.clone())
    .collect_vec();

  let selected = if names.is_empty() {
    usable
  } else {
    names
      .iter()
      .map(|wanted| {
        usable
          .iter()
          .find(|iface| &iface.name == wanted)
          .cloned()
          .ok_or_else(|| InterfaceError::UnknownInterface(wanted.clone()))
      })
      .collect::<Result<Vec<_>, _>>()?
  };
  if selected.is_empty() {
    return Err(InterfaceError::NoneUsable);
  }
  return Ok(selected);
}

pub fn multicast_interfaces(names: &[String]) -> Result<Vec<NetworkInterface>, InterfaceError> {
  let all = local_ip_address::list_afinet_netifas().map_err(|e| InterfaceError::Listing(e.to_string()))?;
  let selected = select_interfaces(&all, names)?;
  for iface in &selected {
    debug!("using interface {} ({})", iface.name, iface.address);
  }
  return Ok(selected);
}

/// Best guess of the interface `peer` is reachable through: the one sharing the
/// longest address prefix with it. Only for peers not heard on a multicast
/// socket, those carry the interface they were received on.
pub fn interface_for_peer(interfaces: &[NetworkInterface], peer: IpAddr) -> String {
  if let [only] = interfaces {
    return only.name.clone();
  }
  let IpAddr::V4(peer) = peer else {
    return UNKNOWN_INTERFACE.to_owned();
  };
  interfaces
    .iter()
    .max_by_key(|iface| (u32::from(iface.address) ^ u32::from(peer)).leading_zeros())
    .map(|iface| iface.name.clone())
    .unwrap_or_else(|| UNKNOWN_INTERFACE.to_owned())
}

/// Opens a socket receiving `group` on `iface` only.
///
/// Several of these may share the group's port, one per interface. On Linux the
/// socket is kept to its own membership (`IP_MULTICAST_ALL` off), so it never sees
/// the group as joined on another interface.
pub fn open_multicast_socket(group: SocketAddrV4, iface: &NetworkInterface) -> io::Result<UdpSocket> {
  let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
  socket.set_reuse_address(true)?;
  #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
  socket.set_reuse_port(true)?;
  #[cfg(target_os = "linux")]
  socket.set_multicast_all_v4(false)?;
  socket.set_nonblocking(true)?;

  // binding to the group keeps other groups on the same port out of this socket
  #[cfg(unix)]
  let bind_addr = group;
  #[cfg(not(unix))]
  let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
  socket.bind(&SocketAddr::V4(bind_addr).into())?;
  socket.join_multicast_v4(group.ip(), &iface.address)?;

  return UdpSocket::from_std(socket.into());
}


#[cfg(test)]
mod tests {
  use super::*;

  fn listing() -> Vec<(String, IpAddr)> {
    vec![
      ("lo".to_owned(), IpAddr::V4(Ipv4Addr::LOCALHOST)),
      ("eth0".to_owned(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))),
      ("eth0".to_owned(), "fe80::1".parse().unwrap()),
      ("eth1".to_owned(), IpAddr::V4(Ipv4Addr::new(10, 10, 0, 5))),
      ("wg0".to_owned(), "fd00::5".parse().unwrap()),
    ]
  }

  #[test]
  fn all_usable_interfaces_by_default() {
    let sel = select_interfaces(&listing(), &[]).unwrap();
    assert_eq!(sel.iter().map(|i| i.name.as_str()).collect_vec(), vec!["eth0", "eth1"]);
    assert_eq!(sel[0].address, Ipv4Addr::new(192, 168, 1, 20));
  }

  #[test]
  fn named_interfaces_only() {
    let sel = select_interfaces(&listing(), &["eth1".to_owned()]).unwrap();
    assert_eq!(sel, vec![NetworkInterface { name: "eth1".to_owned(), address: Ipv4Addr::new(10, 10, 0, 5) }]);

    assert!(matches!(
      select_interfaces(&listing(), &["wg0".to_owned()]),
      Err(InterfaceError::UnknownInterface(name)) if name == "wg0"
    ));
    assert!(matches!(select_interfaces(&listing()[..1], &[]), Err(InterfaceError::NoneUsable)));
  }

  #[tokio::test]
  async fn socket_joins_on_one_interface() {
    let lo = NetworkInterface { name: "lo".to_owned(), address: Ipv4Addr::LOCALHOST };
    let group = SocketAddrV4::new(Ipv4Addr::new(239, 69, 0, 7), 5304);
    let socket = open_multicast_socket(group, &lo).unwrap();
    assert_eq!(socket.local_addr().unwrap().port(), 5304);
    #[cfg(target_os = "linux")]
    assert!(!socket2::SockRef::from(&socket).multicast_all_v4().unwrap());

    let unknown = NetworkInterface { name: "eth9".to_owned(), address: Ipv4Addr::new(203, 0, 113, 9) };
    assert!(open_multicast_socket(group, &unknown).is_err());
  }

  #[test]
  fn peer_interface_guess() {
    let ifaces = select_interfaces(&listing(), &[]).unwrap();
    assert_eq!(interface_for_peer(&ifaces, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77))), "eth0");
    assert_eq!(interface_for_peer(&ifaces, IpAddr::V4(Ipv4Addr::new(10, 10, 3, 1))), "eth1");
    assert_eq!(interface_for_peer(&ifaces, "fe80::2".parse().unwrap()), UNKNOWN_INTERFACE);
    assert_eq!(interface_for_peer(&ifaces[..1], "fe80::2".parse().unwrap()), "eth0");
    assert_eq!(interface_for_peer(&[], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), UNKNOWN_INTERFACE);
  }
}
