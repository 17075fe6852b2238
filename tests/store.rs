//! Records survive a trip through SQLite unchanged.
use mitmtap::codec::{self, Decoded};
use mitmtap::{Protocol, RequestStore, SqliteStore};

#[tokio::test]
async fn persisted_records_decode_to_what_was_captured() {
  let dir = tempfile::tempdir().unwrap();
  let store = SqliteStore::open(dir.path().join("db.sqlite")).await.unwrap();

  let raw = b"POST /account/update?tab=profile&lang=en HTTP/1.1\r\n\
    Host: shop.test\r\n\
    Cookie: sid=abc123; theme=dark\r\n\
    Content-Type: application/x-www-form-urlencoded\r\n\
    Content-Length: 29\r\n\
    X-Requested-With: XMLHttpRequest\r\n\r\n\
    name=Ann+Lee&city=Z%C3%BCrich";
  let request = match codec::decode(raw) {
    Decoded::Complete(request) => request,
    other => panic!("unexpected {:?}", other),
  };
  let response = codec::decode_response(
    b"HTTP/1.1 302 Found\r\nLocation: /account\r\nContent-Length: 0\r\n\r\n",
    "POST",
  );
  let captured = codec::capture(&request, &response, Protocol::Https);
  let id = store.insert(codec::encode(&captured).unwrap()).await.unwrap();

  let stored = store.get(id).await.unwrap().expect("record was inserted");
  let decoded = stored.decode().unwrap();
  assert_eq!(decoded, captured);
  assert_eq!(decoded.method, "POST");
  assert_eq!(decoded.path, "/account/update?tab=profile&lang=en");
  let names: Vec<_> = decoded.headers.iter().map(|(k, _)| k.to_string()).collect();
  assert_eq!(
    names,
    vec!["host", "cookie", "content-type", "content-length", "x-requested-with"]
  );
  assert_eq!(decoded.form.get("city").map(String::as_str), Some("Zürich"));
  assert_eq!(decoded.form.get("name").map(String::as_str), Some("Ann Lee"));
  assert_eq!(decoded.cookies.get("sid").map(String::as_str), Some("abc123"));
  assert_eq!(decoded.body, "name=Ann+Lee&city=Z%C3%BCrich");
  assert_eq!(decoded.status, 302);
  assert_eq!(decoded.response_headers.get("location"), Some("/account"));
  assert_eq!(stored.record.protocol, "https");
}

#[tokio::test]
async fn a_reopened_database_keeps_its_records() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("db.sqlite");
  let record = codec::capture(
    &match codec::decode(b"GET /a HTTP/1.1\r\nHost: a.test\r\n\r\n") {
      Decoded::Complete(request) => request,
      other => panic!("unexpected {:?}", other),
    },
    &codec::decode_response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", "GET"),
    Protocol::Http,
  );
  {
    let store = SqliteStore::open(&path).await.unwrap();
    store.insert(codec::encode(&record).unwrap()).await.unwrap();
    store.insert(codec::encode(&record).unwrap()).await.unwrap();
  }

  let reopened = SqliteStore::open(&path).await.unwrap();
  let listed = reopened.list().await.unwrap();
  assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2, 1]);
  assert_eq!(listed[0].path, "/a");
  let id = reopened.insert(codec::encode(&record).unwrap()).await.unwrap();
  assert_eq!(id, 3);
}
