//! Plain-HTTP forward proxying of absolute `http://` requests.
use crate::client::{read_chunked_body, read_exact_body, with_timeout, OutboundRequest, OriginResponse};
use crate::codec::{self, ParsedRequest, RequestHead};
use crate::errors::{Error, Result};
use crate::headers::HeaderTable;
use crate::record::Protocol;
use crate::server::{write_error, ProxyContext};
use crate::CR_LF;
use bytes::Bytes;
use http::header;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

/// Headers never forwarded to the origin.
const STRIPPED_REQUEST_HEADERS: [&str; 2] = ["proxy-connection", "accept-encoding"];

/// An absolute-form request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteTarget {
  /// `host[:port]` exactly as written
  pub authority: String,
  /// host
  pub host: String,
  /// port, 80 unless given
  pub port: u16,
  /// origin-form target, `/` when the URI has no path
  pub path: String,
}

/// Parse `http://host[:port]/path...`. Anything else, including `https://`
/// and origin-form targets, is a malformed target.
pub fn parse_absolute_target(target: &str) -> Result<AbsoluteTarget> {
  let rest = match target.get(..7) {
    Some(scheme) if scheme.eq_ignore_ascii_case("http://") => &target[7..],
    _ => return Err(Error::malformed_target(format!("not an absolute http URI: {}", target))),
  };
  let split = rest.find(['/', '?', '#']).unwrap_or(rest.len());
  let (authority, path) = rest.split_at(split);
  // credentials are not forwarded
  let authority = authority.rsplit_once('@').map(|(_, a)| a).unwrap_or(authority);
  let (host, port) = OutboundRequest::split_authority(authority, Protocol::Http)?;
  let path = match path {
    "" => "/".to_string(),
    p if p.starts_with('/') => p.to_string(),
    p => format!("/{}", p),
  };
  let path = path.split('#').next().unwrap_or_default().to_string();
  Ok(AbsoluteTarget {
    authority: authority.to_string(),
    host,
    port,
    path,
  })
}

/// The header set sent to the origin: inbound headers without the stripped
/// ones, `Host` set to the target authority. The port stays in `Host` when
/// the target names one, so `http://example.com:8080/` is sent as
/// `Host: example.com:8080` and `http://example.com/` as `Host: example.com`.
pub fn forwarded_headers(inbound: &HeaderTable, target: &AbsoluteTarget) -> HeaderTable {
  let mut headers = inbound.clone();
  for name in STRIPPED_REQUEST_HEADERS {
    headers.remove(name);
  }
  // the body is forwarded de-chunked with a fresh length
  headers.remove(header::TRANSFER_ENCODING.as_str());
  headers.insert(header::HOST.as_str(), target.authority.clone());
  headers
}

/// Request body as declared by `headers`, refused past `max` bytes.
async fn read_body<R>(reader: &mut R, headers: &HeaderTable, max: usize) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  if headers.is_chunked() {
    return read_chunked_body(reader, max).await;
  }
  match headers.content_length() {
    Some(Ok(n)) => read_exact_body(reader, n, max).await,
    Some(Err(_)) => Err(Error::MalformedMessage("invalid content-length".to_string())),
    None => Ok(Vec::new()),
  }
}

/// Serve one proxied request on `stream`, record it, then close.
pub(crate) async fn forward<S>(mut stream: S, head: RequestHead, context: Arc<ProxyContext>) -> Result<()>
where
  S: AsyncBufRead + AsyncWrite + Unpin,
{
  let target = match parse_absolute_target(&head.target) {
    Ok(target) => target,
    Err(e) => {
      write_error(&mut stream, &e).await;
      return Err(e);
    }
  };
  let body = match with_timeout(
    context.config.body_read_timeout(),
    read_body(&mut stream, &head.headers, context.config.max_body_size),
  )
  .await
  .and_then(|r| r)
  {
    Ok(body) => Bytes::from(body),
    Err(e) => {
      write_error(&mut stream, &e).await;
      return Err(e);
    }
  };

  let outbound = OutboundRequest {
    method: head.method.clone(),
    host: target.host.clone(),
    port: target.port,
    protocol: Protocol::Http,
    path: target.path.clone(),
    headers: forwarded_headers(&head.headers, &target),
    body,
  };
  let response = match context.client.send(&outbound).await {
    Ok(response) => response,
    Err(e) => {
      tracing::warn!("{} {} failed: {}", outbound.method, head.target, e);
      write_error(&mut stream, &e).await;
      return Err(e);
    }
  };

  let mut sent = outbound.headers.clone();
  if !outbound.body.is_empty() || sent.contains(header::CONTENT_LENGTH.as_str()) {
    sent.insert(header::CONTENT_LENGTH.as_str(), outbound.body.len().to_string());
  }
  let request = ParsedRequest::from_parts(
    RequestHead {
      method: outbound.method.clone(),
      target: outbound.path.clone(),
      version: head.version.clone(),
      headers: sent,
    },
    outbound.body.clone(),
  );
  let record = codec::capture(&request, &response.to_parsed(), Protocol::Http);
  context.recorder.record(&record).await;

  write_response(&mut stream, &outbound.method, &response).await?;
  stream.shutdown().await?;
  Ok(())
}

/// Relay the buffered response with chunked framing in place of the
/// origin's length.
async fn write_response<W>(stream: &mut W, method: &str, response: &OriginResponse) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut headers = response.headers.clone();
  headers.remove(header::CONTENT_LENGTH.as_str());
  headers.remove(header::TRANSFER_ENCODING.as_str());
  headers.remove(header::CONNECTION.as_str());
  let bodyless = codec::response_has_no_body(method, response.status);
  if !bodyless {
    headers.insert(header::TRANSFER_ENCODING.as_str(), "chunked");
  }
  headers.insert(header::CONNECTION.as_str(), "close");
  let mut buf = codec::write_response_head(response.status, &headers);
  if !bodyless {
    if !response.body.is_empty() {
      buf.extend(format!("{:x}", response.body.len()).as_bytes());
      buf.extend(CR_LF);
      buf.extend_from_slice(&response.body);
      buf.extend(CR_LF);
    }
    buf.extend(b"0\r\n\r\n");
  }
  stream.write_all(&buf).await?;
  stream.flush().await?;
  Ok(())
}
