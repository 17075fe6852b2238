//! Certificate Authority (CA) management for the intercepting proxy
//!
//! A long-lived root key and certificate sign one leaf certificate per
//! hostname. Leaves are cached on disk under `certs/`, one PEM file per
//! hostname holding the leaf followed by its private key. A cached leaf is
//! never expired or renewed.
//!

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Leaf validity, one year
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Root validity
const ROOT_TTL_DAYS: i64 = 3650;
/// Backdating of `not_before`, for client clock skew
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root certificate file
const CA_CERT_FILE: &str = "ca_cert.pem";
/// Root private key file
const CA_KEY_FILE: &str = "ca_key.pem";
/// Directory holding one PEM per issued hostname
const LEAF_DIR: &str = "certs";

/// Root signing key and certificate.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

type Root = (Issuer<'static, KeyPair>, CertificateDer<'static>);

impl CertificateAuthority {
  /// Load the root CA from `storage_path`, generating it on first use.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    fs::create_dir_all(&storage_path).await?;

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);
    let (issuer, ca_cert_der) = if cert_path.exists() && key_path.exists() {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::certificate_error(format!("root key {}: {}", key_path.display(), e)))?;
      root_from_pem(&cert_pem, key_pair)?
    } else {
      Self::create_root(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      storage_path,
    })
  }

  async fn create_root(cert_path: &Path, key_path: &Path) -> Result<Root> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "mitmtap Interception CA");
    dn.push(DnType::OrganizationName, "mitmtap");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair =
      KeyPair::generate().map_err(|e| Error::certificate_error(format!("root key: {}", e)))?;
    let root = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("self-signing root: {}", e)))?;

    let cert_pem = root.pem();
    write_atomic(key_path, key_pair.serialize_pem().as_bytes()).await?;
    write_atomic(cert_path, cert_pem.as_bytes()).await?;
    tracing::info!("generated root CA at {}", cert_path.display());
    root_from_pem(&cert_pem, key_pair)
  }

  /// Sign a leaf certificate for `hostname`, valid from `issued_at`.
  /// Returns the leaf PEM followed by its private key PEM.
  pub fn sign_leaf(&self, hostname: &str, issued_at: OffsetDateTime) -> Result<String> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP literals get an IP SAN plus a DNS SAN fallback
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", hostname))
      })?)]
    };

    params.not_before = issued_at - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = issued_at + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("leaf key for {}: {}", hostname, e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("signing leaf for {}: {}", hostname, e)))?;

    Ok(format!("{}{}", cert.pem(), key_pair.serialize_pem()))
  }

  /// Root certificate PEM, as installed in client trust stores.
  pub fn ca_cert_pem(&self) -> Result<String> {
    let path = self.ca_cert_path();
    std::fs::read_to_string(&path)
      .map_err(|e| Error::certificate_error(format!("reading {}: {}", path.display(), e)))
  }

  /// Root certificate in DER form.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Where the root certificate lives on disk.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

fn root_from_pem(cert_pem: &str, key_pair: KeyPair) -> Result<Root> {
  let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
    .next()
    .ok_or_else(|| Error::certificate_error("root PEM holds no certificate"))?
    .map_err(|e| Error::certificate_error(format!("root PEM: {}", e)))?;
  let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
    .map_err(|e| Error::certificate_error(format!("root issuer: {}", e)))?;
  Ok((issuer, cert_der))
}

/// A leaf certificate and key for one hostname, read-only once issued.
#[derive(Debug)]
pub struct IssuedCertificate {
  hostname: String,
  pem: String,
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl IssuedCertificate {
  fn from_pem(hostname: &str, pem: String, ca: &CertificateDer<'static>) -> Result<Self> {
    let mut leaf = rustls_pemfile::certs(&mut pem.as_bytes())
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| Error::certificate_error(format!("Failed to parse leaf for {}: {}", hostname, e)))?;
    if leaf.is_empty() {
      return Err(Error::certificate_error(format!("No leaf certificate for {}", hostname)));
    }
    let key = rustls_pemfile::private_key(&mut pem.as_bytes())
      .map_err(|e| Error::certificate_error(format!("Failed to parse key for {}: {}", hostname, e)))?
      .ok_or_else(|| Error::certificate_error(format!("No private key for {}", hostname)))?;
    leaf.truncate(1);
    leaf.push(ca.clone());
    Ok(Self {
      hostname: hostname.to_string(),
      pem,
      chain: leaf,
      key,
    })
  }

  /// Hostname the leaf was issued for.
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// Exact bytes of the cache file: leaf PEM then key PEM.
  pub fn pem(&self) -> &str {
    &self.pem
  }

  /// `[leaf, root]`
  pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
    self.chain.clone()
  }

  /// Leaf private key.
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
}

/// Issues leaf certificates, caching them on disk and in memory.
///
/// Concurrent `issue` calls for one hostname share a single generation;
/// different hostnames proceed in parallel.
pub struct CertificateStore {
  ca: CertificateAuthority,
  leaf_dir: PathBuf,
  cert_cache: Cache<String, Arc<IssuedCertificate>>,
  generated: AtomicUsize,
}

impl CertificateStore {
  /// Open (or create) the store rooted at `storage_path`.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(&storage_path).await?;
    let leaf_dir = storage_path.as_ref().join(LEAF_DIR);
    fs::create_dir_all(&leaf_dir).await?;
    let cert_cache = Cache::builder().max_capacity(1000).build();
    Ok(Self {
      ca,
      leaf_dir,
      cert_cache,
      generated: AtomicUsize::new(0),
    })
  }

  /// Return the leaf for `hostname`, generating and persisting it on first use.
  pub async fn issue(&self, hostname: &str) -> Result<Arc<IssuedCertificate>> {
    let hostname = normalize_hostname(hostname)?;
    self
      .cert_cache
      .try_get_with(hostname.clone(), self.load_or_generate(hostname.clone()))
      .await
      .map_err(|e| Error::Certificate(format!("{}: {}", hostname, e)))
  }

  async fn load_or_generate(&self, hostname: String) -> Result<Arc<IssuedCertificate>> {
    let path = self.leaf_path(&hostname);
    let pem = match fs::read_to_string(&path).await {
      Ok(pem) => pem,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        let pem = self.ca.sign_leaf(&hostname, OffsetDateTime::now_utc())?;
        write_atomic(&path, pem.as_bytes()).await?;
        self.generated.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("issued leaf certificate for {}", hostname);
        pem
      }
      Err(e) => return Err(e.into()),
    };
    Ok(Arc::new(IssuedCertificate::from_pem(
      &hostname,
      pem,
      self.ca.ca_cert_der(),
    )?))
  }

  /// Cache file for `hostname`.
  pub fn leaf_path(&self, hostname: &str) -> PathBuf {
    self.leaf_dir.join(format!("{}.pem", file_stem(hostname)))
  }

  /// Leaves generated (not loaded from disk) by this instance.
  pub fn generated(&self) -> usize {
    self.generated.load(Ordering::SeqCst)
  }

  /// The root authority.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Get the CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}

/// Lower-case, strip IPv6 brackets and a trailing dot.
fn normalize_hostname(hostname: &str) -> Result<String> {
  let host = hostname
    .trim()
    .trim_start_matches('[')
    .trim_end_matches(']')
    .trim_end_matches('.')
    .to_ascii_lowercase();
  if host.is_empty() {
    return Err(Error::certificate_error("empty hostname"));
  }
  Ok(host)
}

/// File name for a hostname. Bytes outside `[a-z0-9.-]` become `_xx` hex
/// escapes, so distinct hostnames never share a file.
fn file_stem(hostname: &str) -> String {
  let mut stem = String::with_capacity(hostname.len());
  for byte in hostname.bytes() {
    match byte {
      b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' => stem.push(char::from(byte)),
      _ => stem.push_str(&format!("_{:02x}", byte)),
    }
  }
  stem
}

/// Write to a sibling temp file, then rename over `path`.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
  let tmp = path.with_extension(format!("tmp{}", rand::thread_rng().gen::<u32>()));
  let mut file = fs::File::create(&tmp).await?;
  file.write_all(contents).await?;
  file.sync_all().await?;
  drop(file);
  if let Err(e) = fs::rename(&tmp, path).await {
    fs::remove_file(&tmp).await.ok();
    return Err(e.into());
  }
  Ok(())
}
