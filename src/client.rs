//! Minimal HTTP/1.1 client used to reach origins from the relay, the
//! scanner and the repeat endpoint.
use crate::codec::{self, ParsedResponse, MAX_CHUNK_LINE};
use crate::errors::{new_io_error, Error, Result};
use crate::headers::HeaderTable;
use crate::record::{CapturedRecord, Protocol};
use crate::tls;
use bytes::Bytes;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Upper bound on a status line or header block read from an origin.
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Largest response body buffered unless configured otherwise.
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// A request addressed to an origin.
#[derive(Clone, Debug, Default)]
pub struct OutboundRequest {
  /// method
  pub method: String,
  /// origin host
  pub host: String,
  /// origin port
  pub port: u16,
  /// plain TCP or TLS
  pub protocol: Protocol,
  /// origin-form request-target
  pub path: String,
  /// headers written as-is
  pub headers: HeaderTable,
  /// request body
  pub body: Bytes,
}

impl OutboundRequest {
  /// Split a `Host` header value into host and port, defaulting the port
  /// from `protocol`.
  pub fn split_authority(authority: &str, protocol: Protocol) -> Result<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
      return Err(Error::malformed_target("empty host"));
    }
    // [v6]:port
    if let Some(rest) = authority.strip_prefix('[') {
      let (host, tail) = rest
        .split_once(']')
        .ok_or_else(|| Error::malformed_target(format!("invalid host {:?}", authority)))?;
      let port = match tail.strip_prefix(':') {
        Some(p) => parse_port(p)?,
        None if tail.is_empty() => protocol.default_port(),
        None => return Err(Error::malformed_target(format!("invalid host {:?}", authority))),
      };
      return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
      Some((host, port)) if !host.is_empty() && !host.contains(':') => {
        Ok((host.to_string(), parse_port(port)?))
      }
      Some(_) => Err(Error::malformed_target(format!("invalid host {:?}", authority))),
      None => Ok((authority.to_string(), protocol.default_port())),
    }
  }

  /// Rebuild the request a stored record describes: origin from its `Host`
  /// header and protocol, same method, path and headers, no body.
  pub fn for_record(record: &CapturedRecord) -> Result<Self> {
    let authority = record
      .headers
      .get(http::header::HOST.as_str())
      .ok_or_else(|| Error::malformed_target(format!("record {} has no host header", record.path)))?;
    let (host, port) = Self::split_authority(authority, record.protocol)?;
    let mut headers = record.headers.clone();
    headers.remove(http::header::CONTENT_LENGTH.as_str());
    headers.remove(http::header::TRANSFER_ENCODING.as_str());
    headers.insert(http::header::CONNECTION.as_str(), "close");
    Ok(Self {
      method: record.method.clone(),
      host,
      port,
      protocol: record.protocol,
      path: record.path.clone(),
      headers,
      body: Bytes::new(),
    })
  }

  fn address(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }

  /// Wire form: head, then the body. `Content-Length` follows the body.
  pub fn to_raw(&self) -> Vec<u8> {
    let mut headers = self.headers.clone();
    if !self.body.is_empty() || headers.contains(http::header::CONTENT_LENGTH.as_str()) {
      headers.insert(
        http::header::CONTENT_LENGTH.as_str(),
        self.body.len().to_string(),
      );
    }
    let mut raw = codec::write_request_head(&self.method, &self.path, &headers);
    raw.extend_from_slice(&self.body);
    raw
  }
}

pub(crate) fn parse_port(port: &str) -> Result<u16> {
  match port.parse::<u16>() {
    Ok(p) if p != 0 => Ok(p),
    _ => Err(Error::malformed_target(format!("invalid port {:?}", port))),
  }
}

/// A fully buffered origin response.
#[derive(Clone, Debug, Default)]
pub struct OriginResponse {
  /// status code
  pub status: u16,
  /// headers as received
  pub headers: HeaderTable,
  /// de-framed body, still content-encoded
  pub body: Bytes,
}

impl OriginResponse {
  /// Body with `Content-Encoding: gzip` removed when the `gzip` feature is on.
  pub fn decoded_body(&self) -> Bytes {
    #[cfg(feature = "gzip")]
    if let Some(ce) = self.headers.get(http::header::CONTENT_ENCODING.as_str()) {
      if ce.trim().eq_ignore_ascii_case("gzip") {
        use std::io::Read;
        let mut gzip_body = Vec::new();
        let mut d = flate2::read::MultiGzDecoder::new(&self.body[..]);
        if d.read_to_end(&mut gzip_body).is_ok() {
          return Bytes::from(gzip_body);
        }
      }
    }
    self.body.clone()
  }

  /// The response as the codec records it.
  pub fn to_parsed(&self) -> ParsedResponse {
    ParsedResponse {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Sends one request per connection; never retries.
#[derive(Clone)]
pub struct OriginClient {
  connector: TlsConnector,
  connect_timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  max_body_size: usize,
}

impl OriginClient {
  /// Client without timeouts.
  pub fn new() -> Result<Self> {
    Ok(Self {
      connector: tls::origin_connector()?,
      connect_timeout: None,
      read_timeout: None,
      max_body_size: DEFAULT_MAX_BODY_SIZE,
    })
  }

  /// Bound connecting (TCP + TLS handshake) and reading the response.
  pub fn with_timeouts(mut self, connect: Option<Duration>, read: Option<Duration>) -> Self {
    self.connect_timeout = connect;
    self.read_timeout = read;
    self
  }

  /// Refuse response bodies larger than `limit` bytes.
  pub fn with_max_body_size(mut self, limit: usize) -> Self {
    self.max_body_size = limit;
    self
  }

  /// Send `request` and buffer the whole response.
  pub async fn send(&self, request: &OutboundRequest) -> Result<OriginResponse> {
    let address = request.address();
    let tcp = with_timeout(self.connect_timeout, TcpStream::connect(&address))
      .await
      .and_then(|r| r.map_err(Error::from))
      .map_err(|e| Error::origin_connect(format!("Failed to connect to {}: {}", address, e)))?;
    match request.protocol {
      Protocol::Http => self.exchange(tcp, request).await,
      Protocol::Https => {
        let domain = tls::server_name(&request.host)?;
        let stream = with_timeout(self.connect_timeout, self.connector.connect(domain, tcp))
          .await
          .and_then(|r| r.map_err(Error::from))
          .map_err(|e| Error::origin_connect(format!("TLS handshake with {} failed: {}", address, e)))?;
        self.exchange(stream, request).await
      }
    }
  }

  async fn exchange<S>(&self, mut stream: S, request: &OutboundRequest) -> Result<OriginResponse>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    stream.write_all(&request.to_raw()).await?;
    stream.flush().await?;
    let mut reader = BufReader::new(stream);
    with_timeout(self.read_timeout, read_response(&mut reader, &request.method, self.max_body_size)).await?
  }
}

pub(crate) async fn with_timeout<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Result<F::Output> {
  match limit {
    None => Ok(fut.await),
    Some(t) => tokio::time::timeout(t, fut)
      .await
      .map_err(|_| new_io_error(ErrorKind::TimedOut, "origin timed out")),
  }
}

/// `read_until(b'\n')` that fails as soon as `buf` grows past `max`
/// bytes, even in the middle of a line.
pub(crate) async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let allowance = (max.saturating_sub(buf.len()) as u64).saturating_add(1);
  let n = (&mut *reader).take(allowance).read_until(b'\n', buf).await?;
  if buf.len() > max {
    return Err(Error::MalformedMessage(format!("more than {} bytes without a line end", max)));
  }
  Ok(n)
}

/// Read exactly `n` body bytes. Lengths above `max` are refused before
/// anything is allocated.
pub(crate) async fn read_exact_body<R>(reader: &mut R, n: usize, max: usize) -> Result<Vec<u8>>
where
  R: AsyncRead + Unpin,
{
  if n > max {
    return Err(Error::body_too_large(format!("{} byte body exceeds the {} byte limit", n, max)));
  }
  let mut body = Vec::new();
  (&mut *reader).take(n as u64).read_to_end(&mut body).await?;
  if body.len() < n {
    return Err(new_io_error(ErrorKind::UnexpectedEof, "body shorter than its declared length"));
  }
  Ok(body)
}

async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut head = Vec::new();
  loop {
    let n = read_line_capped(reader, &mut head, MAX_HEAD_SIZE).await?;
    if n == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "origin closed before headers"));
    }
    if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
      return Ok(head);
    }
  }
}

/// Read one response, skipping interim 1xx responses. Bodies larger than
/// `max_body` are refused.
pub async fn read_response<R>(reader: &mut R, method: &str, max_body: usize) -> Result<OriginResponse>
where
  R: AsyncBufRead + Unpin,
{
  let head = loop {
    let raw = read_head(reader).await?;
    let head = codec::parse_response_head(&raw)?;
    if !(100..200).contains(&head.status) || head.status == 101 {
      break head;
    }
  };
  let body = if codec::response_has_no_body(method, head.status) {
    Vec::new()
  } else if head.headers.is_chunked() {
    read_chunked_body(reader, max_body).await?
  } else {
    match head.headers.content_length() {
      Some(Ok(n)) => read_exact_body(reader, n, max_body).await?,
      Some(Err(_)) => return Err(Error::MalformedMessage("invalid content-length".to_string())),
      None => {
        let mut body = Vec::new();
        (&mut *reader).take((max_body as u64).saturating_add(1)).read_to_end(&mut body).await?;
        if body.len() > max_body {
          return Err(Error::body_too_large(format!("body exceeds the {} byte limit", max_body)));
        }
        body
      }
    }
  };
  Ok(OriginResponse {
    status: head.status,
    headers: head.headers,
    body: Bytes::from(body),
  })
}

/// Read chunked transfer encoding body, at most `max` bytes of payload.
pub(crate) async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R, max: usize) -> Result<Vec<u8>> {
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if read_line_capped(reader, &mut line, MAX_CHUNK_LINE).await? == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
    }
    if line.iter().all(u8::is_ascii_whitespace) {
      continue;
    }
    let chunk = codec::parse_chunk_size(&line).ok_or_else(|| {
      Error::MalformedMessage(format!("invalid chunk size {:?}", String::from_utf8_lossy(&line).trim()))
    })?;
    if chunk == 0 {
      // drain trailers
      loop {
        line.clear();
        if read_line_capped(reader, &mut line, MAX_CHUNK_LINE).await? == 0
          || line.iter().all(u8::is_ascii_whitespace)
        {
          break;
        }
      }
      break;
    }
    let mut chunk_of_bytes = read_exact_body(reader, chunk, max - body.len()).await?;
    body.append(&mut chunk_of_bytes);
  }
  Ok(body)
}
