//! CONNECT interception: terminate TLS toward the client with an issued
//! leaf, re-encrypt toward the origin, and reconstruct the first exchange
//! from the plaintext flowing through.
use crate::client::{parse_port, with_timeout};
use crate::codec::{self, Decoded, ParsedRequest, Progress};
use crate::errors::{Error, Result};
use crate::record::{CapturedRecord, Protocol};
use crate::server::{write_error, ProxyContext};
use crate::store::Recorder;
use crate::tls;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const BUFFER_SIZE: usize = 8192;

/// Parse a CONNECT authority, `host[:port]` or `[v6][:port]`. The port
/// defaults to 443.
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
  let target = target.trim();
  let (host, port) = if let Some(rest) = target.strip_prefix('[') {
    let (host, tail) = rest
      .split_once(']')
      .ok_or_else(|| Error::malformed_target(format!("invalid CONNECT target {:?}", target)))?;
    match tail {
      "" => (host, None),
      t => match t.strip_prefix(':') {
        Some(port) => (host, Some(port)),
        None => return Err(Error::malformed_target(format!("invalid CONNECT target {:?}", target))),
      },
    }
  } else {
    match target.split_once(':') {
      Some((host, port)) => (host, Some(port)),
      None => (target, None),
    }
  };
  if host.is_empty() || host.contains(['/', ' ', '@']) {
    return Err(Error::malformed_target(format!("invalid CONNECT target {:?}", target)));
  }
  let port = match port {
    Some(port) => parse_port(port)?,
    None => Protocol::Https.default_port(),
  };
  Ok((host.to_string(), port))
}

/// Which way bytes are flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
  ClientToOrigin,
  OriginToClient,
}

/// Per-tunnel plaintext accumulation. Only the first exchange is
/// reconstructed; bytes after it are relayed but not kept.
#[derive(Debug)]
pub struct Capture {
  request: Vec<u8>,
  response: Vec<u8>,
  request_progress: Progress,
  response_progress: Progress,
  parsed: Option<ParsedRequest>,
  limit: usize,
  overflowed: bool,
  emitted: bool,
}

impl Capture {
  /// Empty capture keeping at most `limit` bytes per direction.
  pub fn new(limit: usize) -> Self {
    Self {
      request: Vec::new(),
      response: Vec::new(),
      request_progress: Progress::default(),
      response_progress: Progress::default(),
      parsed: None,
      limit,
      overflowed: false,
      emitted: false,
    }
  }

  fn observe(&mut self, direction: Direction, data: &[u8]) {
    if self.emitted || self.overflowed {
      return;
    }
    let buf = match direction {
      Direction::ClientToOrigin => &mut self.request,
      Direction::OriginToClient => &mut self.response,
    };
    if buf.len() + data.len() > self.limit {
      tracing::debug!("tunnel capture exceeded {} bytes, no longer recording", self.limit);
      self.overflowed = true;
      return;
    }
    buf.extend_from_slice(data);
  }

  /// Record bytes sent by the client.
  pub fn observe_request(&mut self, data: &[u8]) {
    self.observe(Direction::ClientToOrigin, data);
  }

  /// Record bytes sent by the origin.
  pub fn observe_response(&mut self, data: &[u8]) {
    self.observe(Direction::OriginToClient, data);
  }

  /// Whether the exchange was already handed off.
  pub fn is_emitted(&self) -> bool {
    self.emitted
  }

  /// Frames the request side; parses it once, the first time it completes.
  fn request_state(&mut self) -> Decoded<()> {
    if self.parsed.is_some() {
      return Decoded::Complete(());
    }
    match self.request_progress.request(&self.request) {
      Decoded::Complete(_) => match self.request_progress.parse_request(&self.request) {
        Some(request) => {
          self.parsed = Some(request);
          Decoded::Complete(())
        }
        None => Decoded::Malformed("unparsable request head".to_string()),
      },
      Decoded::Incomplete => Decoded::Incomplete,
      Decoded::Malformed(reason) => Decoded::Malformed(reason),
    }
  }

  fn record_for(&mut self, request: ParsedRequest) -> CapturedRecord {
    self
      .response_progress
      .response(&self.response, &request.head.method);
    let response = self.response_progress.parse_response(&self.response);
    codec::capture(&request, &response, Protocol::Https)
  }

  /// The record, once both the request and its response are complete.
  /// Returns it at most once.
  pub fn take_ready(&mut self) -> Option<CapturedRecord> {
    if self.emitted || self.overflowed {
      return None;
    }
    if !matches!(self.request_state(), Decoded::Complete(())) {
      return None;
    }
    let method = self.parsed.as_ref()?.head.method.clone();
    if !matches!(
      self.response_progress.response(&self.response, &method),
      Decoded::Complete(_)
    ) {
      return None;
    }
    self.emitted = true;
    let request = self.parsed.take()?;
    Some(self.record_for(request))
  }

  /// Called once the tunnel is closed: a complete request is recorded with
  /// whatever response arrived, anything else is discarded.
  pub fn finish(&mut self) -> Result<Option<CapturedRecord>> {
    if self.emitted {
      return Ok(None);
    }
    self.emitted = true;
    if self.overflowed {
      return Err(Error::incomplete("tunnel capture exceeded the size limit"));
    }
    match self.request_state() {
      Decoded::Complete(()) => match self.parsed.take() {
        Some(request) => Ok(Some(self.record_for(request))),
        None => Ok(None),
      },
      Decoded::Incomplete if self.request.is_empty() => Ok(None),
      Decoded::Incomplete => Err(Error::incomplete(format!(
        "tunnel closed after {} request bytes",
        self.request.len()
      ))),
      Decoded::Malformed(reason) => Err(Error::incomplete(format!("unparsable request: {}", reason))),
    }
  }
}

fn emit(recorder: &Recorder, record: CapturedRecord) {
  let recorder = recorder.clone();
  tokio::spawn(async move {
    recorder.record(&record).await;
  });
}

/// Copy `from` into `to` until end of stream, mirroring every chunk into the
/// capture. The write side of `to` is shut down when `from` ends.
async fn pump<R, W>(
  mut from: R,
  mut to: W,
  direction: Direction,
  capture: &Mutex<Capture>,
  recorder: &Recorder,
) -> std::io::Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; BUFFER_SIZE];
  loop {
    let n = from.read(&mut buf).await?;
    if n == 0 {
      to.shutdown().await?;
      return Ok(());
    }
    let ready = match capture.lock() {
      Ok(mut capture) => {
        capture.observe(direction, &buf[..n]);
        capture.take_ready()
      }
      Err(_) => None,
    };
    if let Some(record) = ready {
      emit(recorder, record);
    }
    to.write_all(&buf[..n]).await?;
    to.flush().await?;
  }
}

/// Relay both directions until one side closes. Once the client finishes
/// sending, the origin direction is drained unless the exchange was already
/// captured.
async fn relay<C, O>(client: C, origin: O, capture: &Mutex<Capture>, recorder: &Recorder)
where
  C: AsyncRead + AsyncWrite,
  O: AsyncRead + AsyncWrite,
{
  let (client_read, client_write) = tokio::io::split(client);
  let (origin_read, origin_write) = tokio::io::split(origin);
  let upstream = pump(
    client_read,
    origin_write,
    Direction::ClientToOrigin,
    capture,
    recorder,
  );
  let downstream = pump(
    origin_read,
    client_write,
    Direction::OriginToClient,
    capture,
    recorder,
  );
  tokio::pin!(upstream);
  tokio::pin!(downstream);
  tokio::select! {
    r = &mut upstream => {
      let captured = capture.lock().map(|c| c.is_emitted()).unwrap_or(true);
      match r {
        Ok(()) if !captured => {
          if let Err(e) = downstream.await {
            tracing::debug!("origin to client relay ended: {}", e);
          }
        }
        Ok(()) => {}
        Err(e) => tracing::debug!("client to origin relay ended: {}", e),
      }
    }
    r = &mut downstream => {
      if let Err(e) = r {
        tracing::debug!("origin to client relay ended: {}", e);
      }
    }
  }
}

/// Serve `CONNECT target` on `stream`.
pub(crate) async fn intercept<S>(mut stream: S, target: &str, context: Arc<ProxyContext>) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let (host, port) = match parse_connect_target(target) {
    Ok(parsed) => parsed,
    Err(e) => {
      write_error(&mut stream, &e).await;
      return Err(e);
    }
  };
  tracing::info!("CONNECT {}:{}", host, port);

  let issued = match context.certs.issue(&host).await {
    Ok(issued) => issued,
    Err(e) => {
      let _ = stream.write_all(BAD_GATEWAY).await;
      let _ = stream.shutdown().await;
      return Err(e);
    }
  };
  let acceptor = tls::client_acceptor(&issued)?;

  stream.write_all(CONNECTION_ESTABLISHED).await?;
  stream.flush().await?;

  let handshake_timeout = context.config.handshake_timeout();
  let origin = async {
    let address = if host.contains(':') {
      format!("[{}]:{}", host, port)
    } else {
      format!("{}:{}", host, port)
    };
    let tcp = TcpStream::connect(&address)
      .await
      .map_err(|e| Error::origin_connect(format!("Failed to connect to {}: {}", address, e)))?;
    let domain = tls::server_name(&host)?;
    context
      .connector
      .connect(domain, tcp)
      .await
      .map_err(|e| Error::origin_connect(format!("TLS handshake with {} failed: {}", address, e)))
  };
  let accepted = async {
    acceptor
      .accept(stream)
      .await
      .map_err(|e| Error::tls_error(format!("TLS handshake with client for {} failed: {}", host, e)))
  };
  let (origin, accepted) = tokio::join!(
    with_timeout(handshake_timeout, origin),
    with_timeout(handshake_timeout, accepted)
  );
  let mut client_tls = accepted.and_then(|r| r)?;
  let origin_tls = match origin.and_then(|r| r) {
    Ok(origin_tls) => origin_tls,
    Err(e) => {
      let _ = client_tls.write_all(BAD_GATEWAY).await;
      let _ = client_tls.shutdown().await;
      return Err(e);
    }
  };

  let capture = Mutex::new(Capture::new(context.config.max_capture_size));
  relay(client_tls, origin_tls, &capture, &context.recorder).await;

  let finished = capture
    .lock()
    .map_err(|_| Error::Other("tunnel capture poisoned".to_string()))?
    .finish();
  match finished {
    Ok(Some(record)) => {
      context.recorder.record(&record).await;
    }
    Ok(None) => {}
    Err(e) => tracing::debug!("{}:{} not recorded: {}", host, port, e),
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connect_targets_default_to_443() {
    assert_eq!(
      parse_connect_target("example.com:8443").unwrap(),
      ("example.com".to_string(), 8443)
    );
    assert_eq!(
      parse_connect_target("example.com").unwrap(),
      ("example.com".to_string(), 443)
    );
    assert_eq!(parse_connect_target("[::1]:9443").unwrap(), ("::1".to_string(), 9443));
  }

  #[test]
  fn malformed_connect_targets_are_rejected() {
    for target in ["", ":443", "example.com:https", "example.com:", "example.com:70000", "[::1"] {
      assert!(parse_connect_target(target).is_err(), "{:?} should be rejected", target);
    }
  }

  #[test]
  fn capture_emits_once_request_and_response_are_complete() {
    let mut capture = Capture::new(1024);
    capture.observe_request(b"POST /api HTTP/1.1\r\nHost: a.test\r\nContent-Length: 4\r\n\r\nab");
    capture.observe_response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    assert!(capture.take_ready().is_none());
    capture.observe_request(b"cd");
    let record = capture.take_ready().unwrap();
    assert_eq!(record.protocol, Protocol::Https);
    assert_eq!(record.body, "abcd");
    assert_eq!(record.response_body, "ok");
    assert!(capture.take_ready().is_none());
    assert!(capture.finish().unwrap().is_none());
  }

  #[test]
  fn incomplete_requests_are_discarded_at_close() {
    let mut capture = Capture::new(1024);
    capture.observe_request(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort");
    assert!(matches!(capture.finish(), Err(Error::IncompleteReconstruction(_))));

    let mut capture = Capture::new(1024);
    assert!(capture.finish().unwrap().is_none());
  }

  #[test]
  fn complete_request_without_status_line_records_200() {
    let mut capture = Capture::new(1024);
    capture.observe_request(b"GET /x HTTP/1.1\r\nHost: a.test\r\n\r\n");
    capture.observe_response(b"raw bytes");
    let record = capture.finish().unwrap().unwrap();
    assert_eq!(record.status, 200);
    assert!(record.response_headers.is_empty());
    assert_eq!(record.response_body, "raw bytes");
  }

  #[test]
  fn impossible_chunk_sizes_are_discarded() {
    let mut capture = Capture::new(1024);
    capture.observe_request(
      b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabcdefgh\r\n",
    );
    capture.observe_response(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n");
    assert!(capture.take_ready().is_none());
    assert!(matches!(capture.finish(), Err(Error::IncompleteReconstruction(_))));
  }

  #[test]
  fn requests_split_across_many_reads_are_reassembled() {
    let request: &[u8] = b"PUT /doc HTTP/1.1\r\nHost: a.test\r\nContent-Length: 11\r\n\r\nhello world";
    let response: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";
    let mut capture = Capture::new(1024);
    for piece in request.chunks(3) {
      capture.observe_request(piece);
      assert!(capture.take_ready().is_none());
    }
    for piece in response.chunks(5) {
      capture.observe_response(piece);
      if let Some(record) = capture.take_ready() {
        assert_eq!(record.body, "hello world");
        assert_eq!(record.status, 204);
        assert!(capture.is_emitted());
        return;
      }
    }
    panic!("exchange never completed");
  }

  #[test]
  fn oversized_captures_are_dropped() {
    let mut capture = Capture::new(8);
    capture.observe_request(b"GET / HTTP/1.1\r\n\r\n");
    assert!(capture.take_ready().is_none());
    assert!(capture.finish().is_err());
  }
}
