use crate::errors::{Error, Result};
use crate::headers::HeaderTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Flat string map used for query, cookie and form parameters.
pub type ParamMap = BTreeMap<String, String>;

/// Transport the exchange was observed on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  /// plain forward-proxy request
  #[default]
  Http,
  /// request decrypted from a CONNECT tunnel
  Https,
}

impl Protocol {
  /// `http` or `https`
  pub fn as_str(&self) -> &'static str {
    match self {
      Protocol::Http => "http",
      Protocol::Https => "https",
    }
  }
  /// 80 or 443
  pub fn default_port(&self) -> u16 {
    match self {
      Protocol::Http => 80,
      Protocol::Https => 443,
    }
  }
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Protocol {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "http" => Ok(Protocol::Http),
      "https" => Ok(Protocol::Https),
      other => Err(Error::persistence(format!("unknown protocol tag {other:?}"))),
    }
  }
}

/// One observed request/response exchange.
///
/// Built exactly once per completed exchange and never mutated afterwards;
/// `headers` are the headers actually sent to the origin.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedRecord {
  /// request method
  pub method: String,
  /// request-target, including the query string
  pub path: String,
  /// query parameters, last duplicate wins
  pub query: ParamMap,
  /// forwarded request headers
  pub headers: HeaderTable,
  /// cookies from the `Cookie` header
  pub cookies: ParamMap,
  /// form parameters, only for form-url-encoded bodies
  pub form: ParamMap,
  /// raw request body
  pub body: String,
  /// response status code
  pub status: u16,
  /// response headers
  pub response_headers: HeaderTable,
  /// raw response body
  pub response_body: String,
  /// transport tag
  pub protocol: Protocol,
}

/// The flat shape the store persists: JSON objects serialized independently
/// per structured field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRecord {
  /// method
  pub method: String,
  /// path
  pub path: String,
  /// query parameters as a JSON object
  pub get_params: String,
  /// request headers as a JSON object
  pub headers: String,
  /// cookies as a JSON object
  pub cookies: String,
  /// form parameters as a JSON object
  pub post_params: String,
  /// request body text
  pub body: String,
  /// response status
  pub response_code: i64,
  /// response headers as a JSON object
  pub response_headers: String,
  /// response body text
  pub response_body: String,
  /// `http` or `https`
  pub protocol: String,
}

/// A persisted row with its store-assigned identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
  /// store-assigned, monotonically increasing
  pub id: i64,
  #[serde(flatten)]
  /// the persisted columns
  pub record: EncodedRecord,
}

impl StoredRecord {
  /// Decode the JSON columns back into a structured record.
  pub fn decode(&self) -> Result<CapturedRecord> {
    let r = &self.record;
    let status = u16::try_from(r.response_code)
      .map_err(|_| Error::persistence(format!("status {} out of range", r.response_code)))?;
    Ok(CapturedRecord {
      method: r.method.clone(),
      path: r.path.clone(),
      query: serde_json::from_str(&r.get_params)?,
      headers: serde_json::from_str(&r.headers)?,
      cookies: serde_json::from_str(&r.cookies)?,
      form: serde_json::from_str(&r.post_params)?,
      body: r.body.clone(),
      status,
      response_headers: serde_json::from_str(&r.response_headers)?,
      response_body: r.response_body.clone(),
      protocol: r.protocol.parse()?,
    })
  }
}

/// The list projection: newest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
  /// id
  pub id: i64,
  /// method
  pub method: String,
  /// path
  pub path: String,
  /// request headers as a JSON object
  pub headers: String,
}

impl From<&StoredRecord> for RecordSummary {
  fn from(value: &StoredRecord) -> Self {
    RecordSummary {
      id: value.id,
      method: value.record.method.clone(),
      path: value.record.path.clone(),
      headers: value.record.headers.clone(),
    }
  }
}
