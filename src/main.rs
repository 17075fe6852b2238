//! mitmtap - intercepting HTTP/HTTPS proxy with traffic capture and
//! hidden-parameter discovery.
use clap::Parser;
use mitmtap::{
  AdminState, CertificateStore, OriginClient, ParamScanner, ProxyConfig, ProxyServer, SqliteStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Intercepting HTTP/HTTPS proxy
#[derive(Parser, Debug)]
#[command(name = "mitmtap")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// TOML configuration file; flags override its values
  #[arg(short, long, env = "MITMTAP_CONFIG")]
  config: Option<PathBuf>,

  /// Proxy listen address
  #[arg(short, long, env = "MITMTAP_LISTEN")]
  listen: Option<SocketAddr>,

  /// Admin API listen address
  #[arg(long, env = "MITMTAP_ADMIN")]
  admin: Option<SocketAddr>,

  /// Directory holding the root CA and issued leaf certificates
  #[arg(long, env = "MITMTAP_CA_DIR")]
  ca_dir: Option<PathBuf>,

  /// SQLite database for captured requests
  #[arg(long, env = "MITMTAP_DB")]
  db: Option<PathBuf>,

  /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
  #[arg(long, default_value = "info", env = "MITMTAP_LOG_LEVEL")]
  log_level: String,
}

impl Cli {
  fn into_config(self) -> mitmtap::Result<ProxyConfig> {
    let mut config = match &self.config {
      Some(path) => ProxyConfig::from_toml_file(path)?,
      None => ProxyConfig::default(),
    };
    if let Some(listen) = self.listen {
      config.listen = listen;
    }
    if let Some(admin) = self.admin {
      config.admin_listen = admin;
    }
    if let Some(ca_dir) = self.ca_dir {
      config.ca_storage_path = ca_dir;
    }
    if let Some(db) = self.db {
      config.database_path = db;
    }
    Ok(config)
  }
}

#[tokio::main]
async fn main() -> mitmtap::Result<()> {
  let cli = Cli::parse();
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let config = cli.into_config()?;
  let certs = Arc::new(CertificateStore::new(&config.ca_storage_path).await?);
  tracing::info!(
    "install {} as a trusted root to intercept HTTPS",
    certs.ca_cert_path().display()
  );
  let store = Arc::new(SqliteStore::open(&config.database_path).await?);

  let client = OriginClient::new()?
    .with_timeouts(config.handshake_timeout(), config.body_read_timeout())
    .with_max_body_size(config.max_body_size);
  let mut admin_state = AdminState::new(store.clone(), client.clone());
  admin_state.scanner = ParamScanner::new(store.clone(), client).with_sentinel(config.sentinel.clone());

  let proxy_listener = TcpListener::bind(config.listen).await?;
  let admin_listener = TcpListener::bind(config.admin_listen).await?;
  let server = ProxyServer::new(config, certs, store)?;

  tokio::select! {
    r = server.serve(proxy_listener) => r?,
    r = mitmtap::admin::serve(admin_listener, admin_state) => r?,
    _ = tokio::signal::ctrl_c() => {
      tracing::info!("shutting down");
    }
  }
  Ok(())
}
