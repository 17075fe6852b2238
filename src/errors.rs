//! proxy error
use http::StatusCode;
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `mitmtap::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting, recording or scanning.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The request target is not an absolute `http://` URI, or a CONNECT
  /// authority could not be parsed.
  #[error("malformed target: {0}")]
  MalformedTarget(String),
  /// A request or response could not be parsed.
  #[error("malformed message: {0}")]
  MalformedMessage(String),
  /// A declared or received body is larger than the configured limit.
  #[error("body too large: {0}")]
  BodyTooLarge(String),
  /// The origin could not be reached or refused the handshake.
  #[error("origin connect error: {0}")]
  OriginConnect(String),
  /// Leaf or root certificate could not be generated, loaded or persisted.
  #[error("certificate error: {0}")]
  Certificate(String),
  /// TLS error
  #[error("tls error: {0}")]
  Tls(String),
  /// The tunnel closed before a complete request was observed.
  #[error("incomplete reconstruction: {0}")]
  IncompleteReconstruction(String),
  /// No captured record exists for this identifier.
  #[error("record {0} not found")]
  RecordNotFound(i64),
  /// The request store failed to persist or load a record.
  #[error("persistence error: {0}")]
  Persistence(String),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
  /// serde_json::Error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  /// rusqlite::Error
  #[error(transparent)]
  Sqlite(#[from] rusqlite::Error),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a malformed target error and log it
  pub fn malformed_target(msg: impl Into<String>) -> Self {
    let error = Error::MalformedTarget(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a body too large error and log it
  pub fn body_too_large(msg: impl Into<String>) -> Self {
    let error = Error::BodyTooLarge(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create an origin connect error and log it
  pub fn origin_connect(msg: impl Into<String>) -> Self {
    let error = Error::OriginConnect(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Incomplete reconstructions are a diagnostic, not a user-visible failure.
  pub fn incomplete(msg: impl Into<String>) -> Self {
    let error = Error::IncompleteReconstruction(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a persistence error and log it
  pub fn persistence(msg: impl Into<String>) -> Self {
    let error = Error::Persistence(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// The status a client should see when this error ends its exchange.
  pub fn status_code(&self) -> StatusCode {
    match self {
      Error::MalformedTarget(_) | Error::MalformedMessage(_) => StatusCode::BAD_REQUEST,
      Error::OriginConnect(_) | Error::Certificate(_) | Error::Tls(_) => StatusCode::BAD_GATEWAY,
      Error::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
      Error::RecordNotFound(_) => StatusCode::NOT_FOUND,
      Error::IO(e) if e.kind() == ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
