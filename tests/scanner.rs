//! Hidden-parameter discovery against stub origins.
mod common;

use common::{response, spawn_origin, spawn_tls_origin};
use mitmtap::codec::{self, ParsedRequest};
use mitmtap::{
  CapturedRecord, Error, MemoryStore, OriginClient, ParamScanner, Protocol, RequestStore,
};
use std::sync::Arc;

/// Echo the value of `debug` into the page, ignore everything else.
fn reflects_debug() -> common::Handler {
  Arc::new(|request: &ParsedRequest| {
    let body = match request.query.get("debug") {
      Some(value) => format!("<pre>debug: {}</pre>", value),
      None => "<p>nothing to see</p>".to_string(),
    };
    response(200, "OK", &[("Content-Type", "text/html")], &body)
  })
}

async fn store_with(authority: &str, path: &str, protocol: Protocol) -> Arc<MemoryStore> {
  let store = Arc::new(MemoryStore::new());
  let record = CapturedRecord {
    method: "POST".into(),
    path: path.into(),
    headers: [("Host", authority), ("Accept", "text/html")].into_iter().collect(),
    status: 200,
    protocol,
    ..Default::default()
  };
  store.insert(codec::encode(&record).unwrap()).await.unwrap();
  store
}

#[tokio::test]
async fn only_reflected_candidates_are_reported() {
  let origin = spawn_origin(reflects_debug()).await;
  let store = store_with(&origin.authority(), "/search?q=x", Protocol::Http).await;
  let scanner =
    ParamScanner::new(store, OriginClient::new().unwrap()).with_wordlist(["debug", "q", "admin"]);

  let result = scanner.scan(1).await.unwrap();
  assert_eq!(result.discovered_parameters, vec!["debug".to_string()]);

  let received = origin.received();
  assert_eq!(received.len(), 3, "one probe per candidate");
  let targets: Vec<_> = received.iter().map(|r| r.head.target.clone()).collect();
  assert!(targets.contains(&"/search?q=x&debug=djsahaf".to_string()));
  assert!(targets.contains(&"/search?q=djsahaf".to_string()));
  assert!(received.iter().all(|r| r.head.method == "GET"));
  assert!(received.iter().all(|r| r.head.headers.get("accept") == Some("text/html")));
}

#[tokio::test]
async fn https_records_are_probed_over_tls() {
  let dir = tempfile::tempdir().unwrap();
  let origin = spawn_tls_origin(reflects_debug(), dir.path()).await;
  let store = store_with(&origin.authority(), "/", Protocol::Https).await;
  let scanner = ParamScanner::new(store, OriginClient::new().unwrap())
    .with_wordlist(["id", "debug"])
    .with_sentinel("zz-marker-zz");

  let result = scanner.scan(1).await.unwrap();
  assert_eq!(result.discovered_parameters, vec!["debug".to_string()]);
}

#[tokio::test]
async fn unknown_records_are_not_found() {
  let scanner = ParamScanner::new(Arc::new(MemoryStore::new()), OriginClient::new().unwrap());
  match scanner.scan(42).await {
    Err(Error::RecordNotFound(42)) => {}
    other => panic!("expected RecordNotFound, got {:?}", other),
  }
}

#[tokio::test]
async fn an_unreachable_origin_yields_an_empty_result() {
  let dead = {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let store = store_with(&format!("127.0.0.1:{}", dead.port()), "/", Protocol::Http).await;
  let scanner = ParamScanner::new(store, OriginClient::new().unwrap()).with_wordlist(["a", "b"]);

  let result = scanner.scan(1).await.unwrap();
  assert!(result.discovered_parameters.is_empty());
  assert_eq!(
    serde_json::to_string(&result).unwrap(),
    r#"{"discoveredParameters":[]}"#
  );
}
