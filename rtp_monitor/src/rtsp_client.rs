//! Minimal RTSP/1.0 client, just enough to DESCRIBE a session and get its SDP.

use crate::common::*;

use std::{
  io,
  net::{IpAddr, SocketAddr},
  time::Duration,
};
use thiserror::Error;
use tokio::{
  io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
  net::TcpStream,
  time::timeout,
};
use url::Url;

pub const RTSP_DEFAULT_PORT: u16 = 554;
const MAX_BODY: usize = 64 * 1024;
const MAX_HEADER_LINES: usize = 64;

#[derive(Debug, Error)]
pub enum DescribeError {
  #[error("invalid RTSP URL {0:?}")]
  InvalidUrl(String),
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
  #[error("no response within {0:?}")]
  Timeout(Duration),
  #[error("malformed response: {0}")]
  BadResponse(String),
  #[error("server replied {code} {reason}")]
  Status { code: u16, reason: String },
}

/// `rtsp://<host>:<port>/by-name/<name>` with the instance name percent-escaped as a
/// single path segment.
pub fn rtsp_url(host: IpAddr, port: u16, name: &str) -> Result<Url, DescribeError> {
  let base = format!("rtsp://{}/", SocketAddr::new(host, port));
  let mut url = Url::parse(&base).map_err(|_| DescribeError::InvalidUrl(base.clone()))?;
  url
    .path_segments_mut()
    .map_err(|_| DescribeError::InvalidUrl(base.clone()))?
    .clear()
    .push("by-name")
    .push(name);
  return Ok(url);
}

/// Sends a DESCRIBE for `url` and returns the response body.
pub async fn describe(url: &Url, limit: Duration) -> Result<Vec<u8>, DescribeError> {
  match timeout(limit, describe_inner(url)).await {
    Ok(r) => r,
    Err(_) => Err(DescribeError::Timeout(limit)),
  }
}

async fn describe_inner(url: &Url) -> Result<Vec<u8>, DescribeError> {
  let host = url.host_str().ok_or_else(|| DescribeError::InvalidUrl(url.to_string()))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  let port = url.port().unwrap_or(RTSP_DEFAULT_PORT);

  let mut stream = TcpStream::connect((host, port)).await?;
  let request = format!(
    "DESCRIBE {url} RTSP/1.0\r\nCSeq: 1\r\nAccept: application/sdp\r\nUser-Agent: rtp_monitor/{}\r\n\r\n",
    env!("CARGO_PKG_VERSION")
  );
  stream.write_all(request.as_bytes()).await?;
  trace!("sent DESCRIBE {url}");

  let mut reader = BufReader::new(stream);
  let mut line = String::new();
  reader.read_line(&mut line).await?;
  let (code, reason) = parse_status_line(&line)?;

  let mut content_length = None;
  for _ in 0..MAX_HEADER_LINES {
    line.clear();
    if reader.read_line(&mut line).await? == 0 {
      return Err(DescribeError::BadResponse("connection closed in headers".to_owned()));
    }
    let header = line.trim_end();
    if header.is_empty() {
      break;
    }
    if let Some((name, value)) = header.split_once(':') {
      if name.trim().eq_ignore_ascii_case("content-length") {
        let len = value
          .trim()
          .parse::<usize>()
          .map_err(|_| DescribeError::BadResponse(format!("bad Content-Length {:?}", value.trim())))?;
        content_length = Some(len);
      }
    }
  }

  if code != 200 {
    return Err(DescribeError::Status { code, reason });
  }

  let body = match content_length {
    Some(len) if len > MAX_BODY => {
      return Err(DescribeError::BadResponse(format!("body of {len} bytes is too large")));
    }
    Some(len) => {
      let mut body = vec![0u8; len];
      reader.read_exact(&mut body).await?;
      body
    }
    None => {
      let mut body = vec![];
      reader.take(MAX_BODY as u64).read_to_end(&mut body).await?;
      body
    }
  };
  return Ok(body);
}

fn parse_status_line(line: &str) -> Result<(u16, String), DescribeError> {
  let mut parts = line.trim_end().splitn(3, ' ');
  let version = parts.next().unwrap_or("");
  if !version.starts_with("RTSP/") {
    return Err(DescribeError::BadResponse(format!("unexpected status line {:?}", line.trim_end())));
  }
  let code = parts
    .next()
    .and_then(|c| c.parse().ok())
    .ok_or_else(|| DescribeError::BadResponse(format!("no status code in {:?}", line.trim_end())))?;
  return Ok((code, parts.next().unwrap_or("").to_owned()));
}
