//! Shared helpers for the integration tests: stub origins, a proxy on an
//! ephemeral port and a TLS client that trusts the proxy's root.
#![allow(dead_code)]

use mitmtap::codec::{self, Decoded, ParsedRequest};
use mitmtap::{CertificateStore, MemoryStore, ProxyConfig, ProxyServer, RequestStore, StoredRecord};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub type Handler = Arc<dyn Fn(&ParsedRequest) -> Vec<u8> + Send + Sync>;

/// A stub origin: answers every request with `handler` and remembers what it
/// received.
pub struct StubOrigin {
  pub addr: SocketAddr,
  pub received: Arc<Mutex<Vec<ParsedRequest>>>,
}

impl StubOrigin {
  pub fn authority(&self) -> String {
    format!("127.0.0.1:{}", self.addr.port())
  }

  pub fn received(&self) -> Vec<ParsedRequest> {
    self.received.lock().unwrap().clone()
  }
}

pub fn response(status: u16, reason: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
  let mut raw = format!("HTTP/1.1 {} {}\r\n", status, reason);
  for (name, value) in headers {
    raw.push_str(&format!("{}: {}\r\n", name, value));
  }
  raw.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
  raw.push_str(body);
  raw.into_bytes()
}

/// Read one request (or up to end of stream), answer it, close.
async fn serve_one<S>(mut stream: S, handler: Handler, received: Arc<Mutex<Vec<ParsedRequest>>>)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut buf = Vec::new();
  let mut chunk = [0u8; 4096];
  let request = loop {
    match stream.read(&mut chunk).await {
      Ok(0) | Err(_) => return,
      Ok(n) => buf.extend_from_slice(&chunk[..n]),
    }
    match codec::decode(&buf) {
      Decoded::Complete(request) => break request,
      Decoded::Incomplete => continue,
      Decoded::Malformed(_) => return,
    }
  };
  received.lock().unwrap().push(request.clone());
  let reply = handler(&request);
  let _ = stream.write_all(&reply).await;
  let _ = stream.shutdown().await;
}

pub async fn spawn_origin(handler: Handler) -> StubOrigin {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let received = Arc::new(Mutex::new(Vec::new()));
  let log = received.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(serve_one(stream, handler.clone(), log.clone()));
    }
  });
  StubOrigin { addr, received }
}

/// TLS stub origin. Its certificate comes from an unrelated CA: the proxy
/// must not care.
pub async fn spawn_tls_origin(handler: Handler, dir: &Path) -> StubOrigin {
  let certs = CertificateStore::new(dir.join("origin-ca")).await.unwrap();
  let issued = certs.issue("127.0.0.1").await.unwrap();
  let acceptor = mitmtap::tls::client_acceptor(&issued).unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let received = Arc::new(Mutex::new(Vec::new()));
  let log = received.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let handler = handler.clone();
      let log = log.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(stream).await {
          serve_one(tls, handler, log).await;
        }
      });
    }
  });
  StubOrigin { addr, received }
}

pub struct TestProxy {
  pub addr: SocketAddr,
  pub store: Arc<MemoryStore>,
  pub certs: Arc<CertificateStore>,
}

pub async fn spawn_proxy(dir: &Path) -> TestProxy {
  spawn_proxy_with(dir, ProxyConfig::default()).await
}

/// Proxy with `config`, its CA kept under `dir`.
pub async fn spawn_proxy_with(dir: &Path, config: ProxyConfig) -> TestProxy {
  let config = ProxyConfig {
    ca_storage_path: dir.join("proxy-ca"),
    handshake_timeout: Some(10),
    ..config
  };
  let certs = Arc::new(CertificateStore::new(&config.ca_storage_path).await.unwrap());
  let store = Arc::new(MemoryStore::new());
  let server = ProxyServer::new(config, certs.clone(), store.clone()).unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(server.serve(listener));
  TestProxy { addr, store, certs }
}

/// Poll until the store holds `n` records.
pub async fn wait_for_records(store: &MemoryStore, n: usize) -> Vec<StoredRecord> {
  for _ in 0..100 {
    if store.len().await >= n {
      break;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  let mut records = Vec::new();
  for id in 1..=store.len().await as i64 {
    if let Some(record) = store.get(id).await.unwrap() {
      records.push(record);
    }
  }
  records
}

pub async fn read_to_end<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
  let mut out = Vec::new();
  let mut chunk = [0u8; 4096];
  loop {
    match stream.read(&mut chunk).await {
      Ok(0) | Err(_) => return out,
      Ok(n) => out.extend_from_slice(&chunk[..n]),
    }
  }
}

/// Client config trusting only the proxy's root.
pub fn trusting_client(certs: &CertificateStore) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  roots.add(certs.authority().ca_cert_der().clone()).unwrap();
  let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

/// Open a CONNECT tunnel to `target` through the proxy and complete the TLS
/// handshake as `127.0.0.1`.
pub async fn connect_through(
  proxy: &TestProxy,
  target: &str,
) -> tokio_rustls::client::TlsStream<TcpStream> {
  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  stream
    .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
    .await
    .unwrap();
  let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
  stream.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply, CONNECTION_ESTABLISHED, "unexpected CONNECT reply");
  let name = ServerName::try_from("127.0.0.1").unwrap();
  trusting_client(&proxy.certs)
    .connect(name, stream)
    .await
    .expect("client handshake with the proxy's leaf failed")
}
