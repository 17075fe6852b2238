#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # mitmtap
//!
//! An intercepting HTTP/HTTPS proxy. Every exchange that passes through it
//! is recorded into a [`RequestStore`], and recorded requests can later be
//! replayed with candidate query parameters to find hidden ones.
//!
//! - Plain forward proxying of absolute `http://` requests
//! - `CONNECT` interception with leaf certificates issued on the fly by a
//!   local root CA
//! - Reconstruction of the first request/response pair carried in each
//!   decrypted tunnel
//! - Hidden-parameter discovery by sentinel reflection
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mitmtap::{CertificateStore, MemoryStore, ProxyConfig, ProxyServer};
//!
//! # async fn run() -> mitmtap::Result<()> {
//! let config = ProxyConfig::default();
//! let certs = Arc::new(CertificateStore::new(&config.ca_storage_path).await?);
//! println!("trust {}", certs.ca_cert_path().display());
//! let server = ProxyServer::new(config.clone(), certs, Arc::new(MemoryStore::new()))?;
//! server.run(config.listen).await
//! # }
//! ```
//!
//! The root certificate must be installed in the client's trust store for
//! HTTPS interception to go unnoticed. Origin certificates are never
//! verified.
//!
//! ## Scanning a record
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mitmtap::{OriginClient, ParamScanner, SqliteStore};
//!
//! # async fn run() -> mitmtap::Result<()> {
//! let store = Arc::new(SqliteStore::open("db.sqlite").await?);
//! let scanner = ParamScanner::new(store, OriginClient::new()?);
//! let result = scanner.scan(1).await?;
//! println!("{:?}", result.discovered_parameters);
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional Features
//!
//! - **charset**: Decode captured bodies using the `Content-Type` charset.
//! - **gzip**: Decompress gzip responses before looking for reflections.
//!
/// administrative API
pub mod admin;
mod ca;
mod client;
/// HTTP/1.x message codec
pub mod codec;
mod config;
mod errors;
mod headers;
/// captured exchange records
pub mod record;
/// plain-HTTP relay helpers
pub mod relay;
/// hidden-parameter scanner
pub mod scanner;
mod server;
mod store;
/// TLS configuration
pub mod tls;
/// CONNECT interception
pub mod tunnel;

pub use admin::AdminState;
pub use ca::{CertificateAuthority, CertificateStore, IssuedCertificate};
pub use client::{OriginClient, OriginResponse, OutboundRequest};
pub use config::ProxyConfig;
pub use errors::{Error, Result};
pub use headers::HeaderTable;
pub use record::{CapturedRecord, EncodedRecord, Protocol, RecordSummary, StoredRecord};
pub use scanner::{ParamScanner, ScanResult};
pub use server::ProxyServer;
pub use store::{MemoryStore, Recorder, RequestStore, SqliteStore};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
