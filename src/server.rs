//! Proxy listener: one task per connection, dispatched on the request method.
use crate::ca::CertificateStore;
use crate::client::{read_line_capped, with_timeout, OriginClient};
use crate::codec;
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::store::{Recorder, RequestStore};
use crate::{relay, tls, tunnel};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

/// State shared by every connection handler.
pub(crate) struct ProxyContext {
  pub(crate) config: ProxyConfig,
  pub(crate) certs: Arc<CertificateStore>,
  pub(crate) recorder: Recorder,
  pub(crate) client: OriginClient,
  pub(crate) connector: TlsConnector,
}

/// Proxy server implementation
#[derive(Clone)]
pub struct ProxyServer {
  context: Arc<ProxyContext>,
}

impl ProxyServer {
  /// Create a new proxy server
  pub fn new(
    config: ProxyConfig,
    certs: Arc<CertificateStore>,
    store: Arc<dyn RequestStore>,
  ) -> Result<Self> {
    let client = OriginClient::new()?
      .with_timeouts(config.handshake_timeout(), config.body_read_timeout())
      .with_max_body_size(config.max_body_size);
    Ok(Self {
      context: Arc::new(ProxyContext {
        config,
        certs,
        recorder: Recorder::new(store),
        client,
        connector: tls::origin_connector()?,
      }),
    })
  }

  /// Configuration in use
  pub fn config(&self) -> &ProxyConfig {
    &self.context.config
  }

  /// Bind `addr` and serve forever.
  pub async fn run(self, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::Other(format!("Failed to bind to {}: {}", addr, e)))?;
    self.serve(listener).await
  }

  /// Accept connections from `listener` until the task is dropped.
  pub async fn serve(self, listener: TcpListener) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
      tracing::info!("proxy listening on {}", addr);
    }
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let context = self.context.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, context).await {
              tracing::debug!("connection from {} ended: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("Failed to accept connection: {}", e);
        }
      }
    }
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer_addr: SocketAddr,
  context: Arc<ProxyContext>,
) -> Result<()> {
  let mut reader = BufReader::new(stream);
  let head = match with_timeout(
    context.config.header_read_timeout(),
    read_head(&mut reader, context.config.max_head_size),
  )
  .await
  {
    Ok(Ok(Some(head))) => head,
    Ok(Ok(None)) => return Ok(()),
    Ok(Err(e)) | Err(e) => {
      write_error(&mut reader, &e).await;
      return Err(e);
    }
  };
  let head = match codec::parse_request_head(&head) {
    Ok(head) => head,
    Err(e) => {
      write_error(&mut reader, &e).await;
      return Err(e);
    }
  };
  tracing::debug!("{} {} {}", peer_addr, head.method, head.target);
  if head.method.eq_ignore_ascii_case("CONNECT") {
    tunnel::intercept(reader, &head.target, context).await
  } else {
    relay::forward(reader, head, context).await
  }
}

/// Read a request line and header block. `None` when the peer closed before
/// sending anything.
async fn read_head<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = Vec::new();
  loop {
    let n = read_line_capped(reader, &mut head, max).await?;
    if n == 0 {
      if head.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
      }
      return Err(Error::MalformedMessage("connection closed inside request head".to_string()));
    }
    // tolerate blank lines before the request line
    if head == b"\r\n" || head == b"\n" {
      head.clear();
      continue;
    }
    if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
      return Ok(Some(head));
    }
  }
}

/// Best-effort plain-text error reply before closing.
pub(crate) async fn write_error<W>(stream: &mut W, error: &Error)
where
  W: AsyncWrite + Unpin,
{
  let status = error.status_code();
  let body = format!("{}\n", status.canonical_reason().unwrap_or("Proxy Error"));
  let response = format!(
    "HTTP/1.1 {} {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown"),
    body.len(),
    body
  );
  if stream.write_all(response.as_bytes()).await.is_ok() {
    let _ = stream.shutdown().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[tokio::test]
  async fn heads_stop_at_the_blank_line() {
    let mut reader = BufReader::new(Cursor::new(
      b"\r\nGET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\nBODY".to_vec(),
    ));
    let head = read_head(&mut reader, 1024).await.unwrap().unwrap();
    assert_eq!(head, b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n".to_vec());
  }

  #[tokio::test]
  async fn oversized_and_truncated_heads_fail() {
    let mut reader = BufReader::new(Cursor::new(b"GET / HTTP/1.1\r\nX: yyyyyyyyyyyy\r\n\r\n".to_vec()));
    assert!(read_head(&mut reader, 16).await.is_err());
    let mut reader = BufReader::new(Cursor::new(b"GET / HTTP/1.1\r\nHost".to_vec()));
    assert!(read_head(&mut reader, 1024).await.is_err());
    let mut reader = BufReader::new(Cursor::new(Vec::new()));
    assert!(read_head(&mut reader, 1024).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn heads_without_line_breaks_stop_at_the_limit() {
    let mut reader = BufReader::new(tokio::io::repeat(b'a'));
    let result = read_head(&mut reader, 1024).await;
    assert!(matches!(result, Err(Error::MalformedMessage(_))));

    // the limit covers the whole head, not one line
    let mut head = b"GET http://a.test/ HTTP/1.1\r\n".to_vec();
    for i in 0..100 {
      head.extend(format!("X-Filler-{}: yes\r\n", i).as_bytes());
    }
    head.extend(b"\r\n");
    let mut reader = BufReader::new(Cursor::new(head));
    assert!(read_head(&mut reader, 512).await.is_err());
  }

  #[tokio::test]
  async fn errors_become_plain_text_replies() {
    let mut out = Vec::new();
    write_error(&mut out, &Error::MalformedTarget("ftp://x".into())).await;
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(text.ends_with("\r\n\r\nBad Request\n"));
  }
}
