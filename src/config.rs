use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Proxy configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Address of the proxy listener (plain requests and CONNECT)
  pub listen: SocketAddr,
  /// Address of the administrative API
  pub admin_listen: SocketAddr,
  /// Directory holding the root CA and the leaf certificate cache
  pub ca_storage_path: PathBuf,
  /// SQLite database file for captured records
  pub database_path: PathBuf,
  /// Largest request head accepted on the plain-proxy path
  pub max_head_size: usize,
  /// Largest body buffered by the plain-proxy relay and the origin client
  pub max_body_size: usize,
  /// Tunnel capture stops accumulating past this many bytes per direction
  pub max_capture_size: usize,
  /// TLS handshake timeout in seconds, both sides of a tunnel
  pub handshake_timeout: Option<u64>,
  /// Timeout in seconds for reading a request or response head
  pub header_read_timeout: Option<u64>,
  /// Timeout in seconds for reading a body
  pub body_read_timeout: Option<u64>,
  /// Value injected by the parameter scanner
  pub sentinel: String,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
      admin_listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
      ca_storage_path: PathBuf::from(".mitmtap"),
      database_path: PathBuf::from("db.sqlite"),
      max_head_size: 64 * 1024,
      max_body_size: crate::client::DEFAULT_MAX_BODY_SIZE,
      max_capture_size: 16 * 1024 * 1024,
      handshake_timeout: None,
      header_read_timeout: None,
      body_read_timeout: None,
      sentinel: crate::scanner::SENTINEL.to_string(),
    }
  }
}

impl ProxyConfig {
  /// Load a TOML file; missing keys keep their defaults.
  pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text)
      .map_err(|e| Error::Other(format!("invalid config {}: {}", path.display(), e)))
  }

  /// handshake timeout
  pub fn handshake_timeout(&self) -> Option<Duration> {
    self.handshake_timeout.map(Duration::from_secs)
  }

  /// header read timeout
  pub fn header_read_timeout(&self) -> Option<Duration> {
    self.header_read_timeout.map(Duration::from_secs)
  }

  /// body read timeout
  pub fn body_read_timeout(&self) -> Option<Duration> {
    self.body_read_timeout.map(Duration::from_secs)
  }
}
