use std::{
  fmt,
  io::Cursor,
  net::IpAddr,
  path::PathBuf,
  time::{Duration, Instant},
};

use itertools::Itertools;
use sdp::description::common::{Attribute, ConnectionInformation};
use sdp::SessionDescription;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdpError {
  #[error("cannot decode SDP: {0}")]
  Parse(String),
  #[error("audio section {0} has no usable connection address")]
  MissingConnection(usize),
  #[error("invalid address {0:?}")]
  InvalidAddress(String),
  #[error("invalid port {0}")]
  InvalidPort(isize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
  #[default]
  Undefined,
  Pcm16,
  Pcm24,
}

impl ContentType {
  fn from_encoding_name(name: &str) -> Self {
    match name.to_ascii_uppercase().as_str() {
      "L24" => Self::Pcm24,
      "L16" => Self::Pcm16,
      _ => Self::Undefined,
    }
  }
  pub fn bytes_per_sample(&self) -> Option<usize> {
    match self {
      Self::Pcm16 => Some(2),
      Self::Pcm24 => Some(3),
      Self::Undefined => None,
    }
  }
}

impl fmt::Display for ContentType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Undefined => "Undefined",
      Self::Pcm16 => "PCM16",
      Self::Pcm24 => "PCM24",
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryMethod {
  Sap,
  Mdns,
  Manual,
}

impl fmt::Display for DiscoveryMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Sap => "SAP",
      Self::Mdns => "mDNS",
      Self::Manual => "Manual",
    })
  }
}

/// How a stream became known, with the interface or file it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
  Sap { interface: String },
  Mdns { interface: String },
  Manual { path: PathBuf },
}

impl Discovery {
  pub fn method(&self) -> DiscoveryMethod {
    match self {
      Self::Sap { .. } => DiscoveryMethod::Sap,
      Self::Mdns { .. } => DiscoveryMethod::Mdns,
      Self::Manual { .. } => DiscoveryMethod::Manual,
    }
  }
  pub fn label(&self) -> String {
    match self {
      Self::Sap { interface } | Self::Mdns { interface } => interface.clone(),
      Self::Manual { path } => path.display().to_string(),
    }
  }
}

/// One transport leg of a stream (AES67 streams may carry two for redundancy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
  /// `None` when the origin is a host name and no source filter names the sender
  pub sender_address: Option<IpAddr>,
  pub destination_address: IpAddr,
  pub destination_port: u16,
  pub ttl: u8,
  pub frames_per_packet: u32,
  pub clock_domain: String,
  pub reference_clock: String,
  pub media_clock: String,
  pub sync_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamDescription {
  pub name: String,
  pub sources: Vec<StreamSource>,
  pub sample_rate: u32,
  pub channel_count: u32,
  pub content_type: ContentType,
}

fn find_attribute<'a>(attributes: &'a [Attribute], key: &str) -> Option<&'a str> {
  attributes
    .iter()
    .find(|a| a.key == key)
    .map(|a| a.value.as_deref().unwrap_or("").trim())
}

fn parse_rtpmap(value: &str) -> Option<(ContentType, u32, u32)> {
  let (_payload_type, encoding) = value.split_once(' ')?;
  let parts = encoding.trim().split('/').collect_vec();
  let (name, rate, channels) = match parts.as_slice() {
    [name, rate] => (name, rate, "1"),
    [name, rate, channels] => (name, rate, *channels),
    _ => return None,
  };
  return Some((
    ContentType::from_encoding_name(name),
    rate.parse().unwrap_or(0),
    channels.parse().unwrap_or(0),
  ));
}

/// Parses an SDP document into a [`StreamDescription`] and the session identity
/// `<username>-<session id>-<nettype>-<addrtype>-<origin address>`.
///
/// The identity only depends on the origin and the session-level connection type,
/// so the legs of a redundant stream and re-announcements on other ports collapse
/// into one entry.
pub fn parse_sdp(bytes: &[u8]) -> Result<(StreamDescription, String), SdpError> {
  let session = SessionDescription::unmarshal(&mut Cursor::new(bytes))
    .map_err(|e| SdpError::Parse(e.to_string()))?;

  let origin = &session.origin;
  let (network_type, address_type) = match &session.connection_information {
    Some(c) => (c.network_type.as_str(), c.address_type.as_str()),
    None => (origin.network_type.as_str(), origin.address_type.as_str()),
  };
  let identity = format!(
    "{}-{}-{}-{}-{}",
    origin.username, origin.session_id, network_type, address_type, origin.unicast_address
  );
  let origin_address = origin.unicast_address.parse::<IpAddr>().ok();

  let mut desc = StreamDescription {
    name: session.session_name.clone(),
    ..Default::default()
  };

  for (index, media) in session.media_descriptions.iter().enumerate() {
    if media.media_name.media != "audio" {
      continue;
    }
    let attrs = &media.attributes;

    let connection: Option<&ConnectionInformation> = media
      .connection_information
      .as_ref()
      .filter(|c| c.address.is_some())
      .or(session.connection_information.as_ref());
    let address = connection
      .and_then(|c| c.address.as_ref())
      .ok_or(SdpError::MissingConnection(index))?;
    // "239.69.1.10/32" may come through unsplit
    let (host, inline_ttl) = match address.address.split_once('/') {
      Some((host, rest)) => (host, rest.split('/').next().and_then(|t| t.parse::<isize>().ok())),
      None => (address.address.as_str(), None),
    };
    let destination_address = host
      .parse::<IpAddr>()
      .map_err(|_| SdpError::InvalidAddress(address.address.clone()))?;
    let ttl = address.ttl.or(inline_ttl);
    let port = media.media_name.port.value;
    let destination_port = u16::try_from(port).map_err(|_| SdpError::InvalidPort(port))?;

    let mut source = StreamSource {
      sender_address: origin_address,
      destination_address,
      destination_port,
      ttl: ttl.map(|t| t.clamp(0, u8::MAX as isize) as u8).unwrap_or(0),
      frames_per_packet: find_attribute(attrs, "framecount").and_then(|v| v.parse().ok()).unwrap_or(0),
      clock_domain: find_attribute(attrs, "clock-domain")
        .or_else(|| find_attribute(&session.attributes, "clock-domain"))
        .unwrap_or("")
        .to_owned(),
      reference_clock: find_attribute(attrs, "ts-refclk")
        .or_else(|| find_attribute(&session.attributes, "ts-refclk"))
        .unwrap_or("")
        .to_owned(),
      media_clock: String::new(),
      sync_time: 0,
    };

    // a=source-filter: incl IN IP4 <destination> <sender>
    if let Some(filter) = find_attribute(attrs, "source-filter") {
      let tokens = filter.split_whitespace().collect_vec();
      if tokens.len() == 5 {
        if let Ok(sender) = tokens[4].parse() {
          source.sender_address = Some(sender);
        }
      }
    }

    if let Some(mediaclk) = find_attribute(attrs, "mediaclk") {
      source.media_clock = mediaclk.to_owned();
      if let Some(sync_time) = find_attribute(attrs, "sync-time").and_then(|v| v.parse().ok()) {
        source.sync_time = sync_time;
      }
    }

    if let Some((content_type, rate, channels)) = find_attribute(attrs, "rtpmap").and_then(parse_rtpmap) {
      desc.content_type = content_type;
      desc.sample_rate = rate;
      desc.channel_count = channels;
    }

    desc.sources.push(source);
  }

  return Ok((desc, identity));
}

/// A discovered stream as held by the registry.
#[derive(Debug, Clone)]
pub struct Stream {
  pub id: String,
  pub description: StreamDescription,
  pub sdp: Vec<u8>,
  pub last_seen: Instant,
  pub discovery: Discovery,
}

impl Stream {
  pub fn new(id: String, description: StreamDescription, sdp: Vec<u8>, discovery: Discovery) -> Self {
    Self { id, description, sdp, last_seen: Instant::now(), discovery }
  }

  pub fn name(&self) -> &str {
    &self.description.name
  }

  /// Short stable handle for the identity: first 10 hex digits of its SHA-256.
  pub fn id_hash(&self) -> String {
    let digest = Sha256::digest(self.id.as_bytes());
    let mut h = hex::encode(digest);
    h.truncate(10);
    h
  }

  /// `address:port` of every source, comma separated.
  pub fn address(&self) -> String {
    self
      .description
      .sources
      .iter()
      .map(|s| format!("{}:{}", s.destination_address, s.destination_port))
      .join(", ")
  }

  pub fn codec_info(&self) -> String {
    let d = &self.description;
    if d.sample_rate > 0 && d.channel_count > 0 {
      format!("{} {}Hz {}ch", d.content_type, d.sample_rate, d.channel_count)
    } else {
      d.content_type.to_string()
    }
  }

  pub fn is_stale_at(&self, now: Instant, max_age: Duration) -> bool {
    now.saturating_duration_since(self.last_seen) > max_age
  }

  pub fn is_stale(&self, max_age: Duration) -> bool {
    self.is_stale_at(Instant::now(), max_age)
  }
}
