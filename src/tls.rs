//! rustls configuration for both sides of an intercepted tunnel
//!
use crate::ca::IssuedCertificate;
use crate::errors::{Error, Result};
use std::sync::Arc;
use tokio_rustls::rustls::{
  self,
  client::danger::HandshakeSignatureValid,
  client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier,
  crypto::CryptoProvider,
  pki_types::{CertificateDer, ServerName, UnixTime},
  ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Only HTTP/1.1 is offered on either side.
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Accepts any origin certificate: the proxy inspects traffic, it does not
/// enforce trust.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

fn provider() -> Arc<CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Connector toward origins, with certificate validation disabled.
pub fn origin_connector() -> Result<TlsConnector> {
  let mut config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Failed to create TLS client config: {}", e)))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(TlsConnector::from(Arc::new(config)))
}

/// Acceptor presenting `issued` to the intercepted client.
pub fn client_acceptor(issued: &IssuedCertificate) -> Result<TlsAcceptor> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(issued.cert_chain(), issued.private_key())
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(TlsAcceptor::from(Arc::new(config)))
}

/// SNI name for `host`; IP literals become IP server names.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  ServerName::try_from(host.to_owned())
    .map_err(|e| Error::tls_error(format!("Invalid server name {}: {}", host, e)))
}
