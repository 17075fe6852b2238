//! Administrative HTTP API over captured traffic.
use crate::client::{OriginClient, OutboundRequest};
use crate::codec::encode_form;
use crate::errors::{Error, Result};
use crate::record::{RecordSummary, StoredRecord};
use crate::scanner::{ParamScanner, ScanResult};
use crate::store::RequestStore;
use axum::{
  body::Body,
  extract::{Path, State},
  http::{header, StatusCode},
  response::{IntoResponse, Response},
  routing::get,
  Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared handler state
#[derive(Clone)]
pub struct AdminState {
  /// captured records
  pub store: Arc<dyn RequestStore>,
  /// used by `/repeat`
  pub client: OriginClient,
  /// used by `/scan`
  pub scanner: ParamScanner,
}

impl AdminState {
  /// State whose scanner uses the built-in word list.
  pub fn new(store: Arc<dyn RequestStore>, client: OriginClient) -> Self {
    let scanner = ParamScanner::new(store.clone(), client.clone());
    Self {
      store,
      client,
      scanner,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = match self {
      Error::RecordNotFound(_) => StatusCode::NOT_FOUND,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match status {
      StatusCode::NOT_FOUND => json!({ "error": "Not found" }),
      _ => json!({ "error": self.to_string() }),
    };
    (status, Json(body)).into_response()
  }
}

/// Routes of the admin API
pub fn router(state: AdminState) -> Router {
  Router::new()
    .route("/requests", get(list_requests))
    .route("/requests/{id}", get(get_request))
    .route("/repeat/{id}", get(repeat_request))
    .route("/scan/{id}", get(scan_request))
    .with_state(state)
}

/// Serve the admin API on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, state: AdminState) -> Result<()> {
  if let Ok(addr) = listener.local_addr() {
    tracing::info!("admin API listening on {}", addr);
  }
  axum::serve(listener, router(state)).await?;
  Ok(())
}

async fn list_requests(State(state): State<AdminState>) -> Result<Json<Vec<RecordSummary>>> {
  Ok(Json(state.store.list().await?))
}

async fn get_request(State(state): State<AdminState>, Path(id): Path<i64>) -> Result<Response> {
  Ok(match state.store.get(id).await? {
    Some(record) => Json::<StoredRecord>(record).into_response(),
    None => (StatusCode::NOT_FOUND, "Not found").into_response(),
  })
}

/// The stored request with its form parameters, or its raw body, as the
/// outgoing body.
fn repeat_of(stored: &StoredRecord) -> Result<OutboundRequest> {
  let record = stored.decode()?;
  let mut request = OutboundRequest::for_record(&record)?;
  request.body = if !record.form.is_empty() {
    Bytes::from(encode_form(&record.form))
  } else {
    Bytes::from(record.body.clone())
  };
  Ok(request)
}

async fn repeat_request(State(state): State<AdminState>, Path(id): Path<i64>) -> Result<Response> {
  let stored = state.store.get(id).await?.ok_or(Error::RecordNotFound(id))?;
  let request = match repeat_of(&stored) {
    Ok(request) => request,
    Err(e) => {
      tracing::warn!("cannot repeat record {}: {}", id, e);
      return Ok((StatusCode::INTERNAL_SERVER_ERROR, "Repeat Error").into_response());
    }
  };
  tracing::info!("repeating record {} against {}:{}", id, request.host, request.port);
  let response = match state.client.send(&request).await {
    Ok(response) => response,
    Err(e) => {
      tracing::warn!("repeat of record {} failed: {}", id, e);
      return Ok((StatusCode::INTERNAL_SERVER_ERROR, "Repeat Error").into_response());
    }
  };
  let mut builder = Response::builder().status(response.status);
  for name in [header::CONTENT_TYPE, header::CONTENT_ENCODING] {
    if let Some(value) = response.headers.get(name.as_str()) {
      builder = builder.header(name, value);
    }
  }
  Ok(builder.body(Body::from(response.body))?)
}

async fn scan_request(State(state): State<AdminState>, Path(id): Path<i64>) -> Result<Json<ScanResult>> {
  Ok(Json(state.scanner.scan(id).await?))
}
