//! HTTP/1.x message codec
//!
//! Parses a byte buffer holding one request or response into its head and
//! body, answers whether a buffer observed on a raw stream already holds a
//! complete message, and flattens captured exchanges into the persisted
//! record shape.
use crate::errors::{Error, Result};
use crate::headers::HeaderTable;
use crate::record::{CapturedRecord, EncodedRecord, ParamMap, Protocol};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Blank line separating the header block from the body.
pub const HEAD_END: &[u8] = b"\r\n\r\n";

const FORM_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'-')
  .remove(b'_')
  .remove(b'.')
  .remove(b'*');

/// Outcome of decoding a buffer read from a stream without framing guarantees.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
  /// the buffer holds a full message
  Complete(T),
  /// more bytes are needed
  Incomplete,
  /// the buffer can never become a valid message
  Malformed(String),
}

/// Request line and header block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestHead {
  /// method token
  pub method: String,
  /// request-target as sent
  pub target: String,
  /// protocol version, `HTTP/1.1` when absent
  pub version: String,
  /// header block
  pub headers: HeaderTable,
}

/// Status line and header block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHead {
  /// protocol version
  pub version: String,
  /// status code
  pub status: u16,
  /// reason phrase, possibly empty
  pub reason: String,
  /// header block
  pub headers: HeaderTable,
}

/// A request with its derived parameter maps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedRequest {
  /// request line and headers
  pub head: RequestHead,
  /// query parameters from the target
  pub query: ParamMap,
  /// cookies from the `Cookie` header
  pub cookies: ParamMap,
  /// form parameters, empty unless the body is form-url-encoded
  pub form: ParamMap,
  /// de-framed body
  pub body: Bytes,
}

impl ParsedRequest {
  /// Derive query, cookie and form maps from a head and its body.
  pub fn from_parts(head: RequestHead, body: Bytes) -> Self {
    let query = parse_query(&head.target);
    let cookies = head
      .headers
      .get(http::header::COOKIE.as_str())
      .map(parse_cookies)
      .unwrap_or_default();
    let form = parse_form(&head.headers, &body);
    ParsedRequest {
      head,
      query,
      cookies,
      form,
      body,
    }
  }
}

/// A response as recorded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedResponse {
  /// status code
  pub status: u16,
  /// header block
  pub headers: HeaderTable,
  /// de-framed body
  pub body: Bytes,
}

/// Offset of the first body byte, i.e. just past the first blank line.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
  buf
    .windows(HEAD_END.len())
    .position(|w| w == HEAD_END)
    .map(|i| i + HEAD_END.len())
}

fn head_lines(head: &[u8]) -> Vec<String> {
  String::from_utf8_lossy(head)
    .split('\n')
    .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
    .collect()
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a String>) -> HeaderTable {
  let mut headers = HeaderTable::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    if let Some((name, value)) = line.split_once(':') {
      let name = name.trim();
      if !name.is_empty() {
        headers.insert(name, value.trim());
      }
    }
  }
  headers
}

/// Parse a request line and header block. A line without method and target
/// is malformed.
pub fn parse_request_head(head: &[u8]) -> Result<RequestHead> {
  let lines = head_lines(head);
  let mut lines = lines.iter().skip_while(|l| l.is_empty());
  let request_line = lines
    .next()
    .ok_or_else(|| Error::MalformedMessage("empty request".to_string()))?;
  let mut parts = request_line.split_whitespace();
  let (method, target) = match (parts.next(), parts.next()) {
    (Some(m), Some(t)) => (m, t),
    _ => {
      return Err(Error::MalformedMessage(format!(
        "invalid request line {:?}",
        request_line
      )))
    }
  };
  if http::Method::from_bytes(method.as_bytes()).is_err() {
    return Err(Error::MalformedMessage(format!("invalid method {:?}", method)));
  }
  let version = parts.next().unwrap_or("HTTP/1.1").to_string();
  Ok(RequestHead {
    method: method.to_string(),
    target: target.to_string(),
    version,
    headers: parse_header_lines(lines),
  })
}

/// Parse a status line and header block.
pub fn parse_response_head(head: &[u8]) -> Result<ResponseHead> {
  let lines = head_lines(head);
  let mut lines = lines.iter();
  let status_line = lines
    .next()
    .ok_or_else(|| Error::MalformedMessage("empty response".to_string()))?;
  let mut parts = status_line.splitn(3, ' ');
  let version = parts.next().unwrap_or_default();
  if !version.starts_with("HTTP/") {
    return Err(Error::MalformedMessage(format!(
      "invalid status line {:?}",
      status_line
    )));
  }
  let status = parts
    .next()
    .and_then(|code| http::StatusCode::from_bytes(code.as_bytes()).ok())
    .ok_or_else(|| Error::MalformedMessage(format!("invalid status line {:?}", status_line)))?;
  Ok(ResponseHead {
    version: version.to_string(),
    status: status.as_u16(),
    reason: parts.next().unwrap_or_default().trim().to_string(),
    headers: parse_header_lines(lines),
  })
}

/// Longest chunk-size or trailer line accepted.
pub(crate) const MAX_CHUNK_LINE: usize = 8 * 1024;

fn find_crlf(buf: &[u8]) -> Option<usize> {
  buf.windows(2).position(|w| w == CR_LF)
}

/// Hex size of a chunk-size line, extensions ignored.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Option<usize> {
  let line = std::str::from_utf8(line).ok()?;
  let size = line.split(';').next()?.trim();
  if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
    return None;
  }
  usize::from_str_radix(size, 16).ok()
}

/// Decode one chunked body. Completes with the payload and the number of
/// bytes the framing occupied.
pub fn dechunk(buf: &[u8]) -> Decoded<(Vec<u8>, usize)> {
  let mut body = Vec::new();
  let mut pos = 0;
  loop {
    let Some(line_len) = find_crlf(&buf[pos..]) else {
      return Decoded::Incomplete;
    };
    let Some(size) = parse_chunk_size(&buf[pos..pos + line_len]) else {
      return Decoded::Malformed("invalid chunk size".to_string());
    };
    pos += line_len + 2;
    if size == 0 {
      // trailer section ends with an empty line
      loop {
        let Some(trailer_len) = find_crlf(&buf[pos..]) else {
          return Decoded::Incomplete;
        };
        pos += trailer_len + 2;
        if trailer_len == 0 {
          return Decoded::Complete((body, pos));
        }
      }
    }
    match size.checked_add(2) {
      Some(framed) if framed <= buf.len() - pos => {
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += framed;
      }
      Some(_) => return Decoded::Incomplete,
      None => return Decoded::Malformed(format!("chunk size {:x} out of range", size)),
    }
  }
}

/// How the end of a body is found once its head is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
  /// no body at all
  Empty,
  /// exactly this many bytes
  Length(usize),
  /// chunked transfer coding
  Chunked,
  /// complete at the blank line, trailing bytes taken as the body
  Unframed,
  /// ends when the connection does
  UntilClose,
}

/// Framing state of one message arriving in pieces.
///
/// Each call resumes where the previous one stopped: the head terminator is
/// searched only in bytes not seen before, the head is classified once and
/// chunk-size lines already walked are not parsed again.
#[derive(Debug, Default)]
pub struct Progress {
  start: usize,
  scan: usize,
  body: Option<(usize, BodyFraming)>,
  chunk: usize,
  trailers: bool,
  end: Option<usize>,
  malformed: Option<String>,
}

impl Progress {
  /// Frame a request held in `buf`. Without `Content-Length` or chunked
  /// coding the request is complete at the blank line.
  pub fn request(&mut self, buf: &[u8]) -> Decoded<usize> {
    self.advance(buf, |head| {
      let head = parse_request_head(head).map_err(|e| e.to_string())?;
      if head.headers.is_chunked() {
        return Ok(Some(BodyFraming::Chunked));
      }
      match head.headers.content_length() {
        Some(Ok(n)) => Ok(Some(BodyFraming::Length(n))),
        Some(Err(_)) => Err("invalid content-length".to_string()),
        None => Ok(Some(BodyFraming::Unframed)),
      }
    })
  }

  /// Frame the response to a `method` request held in `buf`, skipping
  /// interim `1xx` heads. Responses delimited by connection close never
  /// complete.
  pub fn response(&mut self, buf: &[u8], method: &str) -> Decoded<usize> {
    self.advance(buf, |head| {
      let head = parse_response_head(head).map_err(|e| e.to_string())?;
      if (100..200).contains(&head.status) && head.status != 101 {
        return Ok(None);
      }
      if response_has_no_body(method, head.status) {
        return Ok(Some(BodyFraming::Empty));
      }
      if head.headers.is_chunked() {
        return Ok(Some(BodyFraming::Chunked));
      }
      match head.headers.content_length() {
        Some(Ok(n)) => Ok(Some(BodyFraming::Length(n))),
        _ => Ok(Some(BodyFraming::UntilClose)),
      }
    })
  }

  fn advance<F>(&mut self, buf: &[u8], mut classify: F) -> Decoded<usize>
  where
    F: FnMut(&[u8]) -> std::result::Result<Option<BodyFraming>, String>,
  {
    if let Some(reason) = &self.malformed {
      return Decoded::Malformed(reason.clone());
    }
    if let Some(end) = self.end {
      return Decoded::Complete(end);
    }
    let (body_start, framing) = loop {
      if let Some(found) = self.body {
        break found;
      }
      let Some(head_end) = find_head_end(&buf[self.scan..]).map(|i| self.scan + i) else {
        // the terminator may straddle the next read
        self.scan = buf.len().saturating_sub(HEAD_END.len() - 1).max(self.start);
        return Decoded::Incomplete;
      };
      match classify(&buf[self.start..head_end]) {
        Ok(Some(framing)) => {
          self.body = Some((head_end, framing));
          self.chunk = head_end;
        }
        Ok(None) => {
          self.start = head_end;
          self.scan = head_end;
        }
        Err(reason) => return self.fail(reason),
      }
    };
    let end = match framing {
      BodyFraming::Empty | BodyFraming::Unframed => Some(body_start),
      BodyFraming::Length(n) => body_start.checked_add(n).filter(|end| *end <= buf.len()),
      BodyFraming::UntilClose => None,
      BodyFraming::Chunked => match self.advance_chunks(buf) {
        Decoded::Complete(end) => Some(end),
        Decoded::Incomplete => None,
        Decoded::Malformed(reason) => return self.fail(reason),
      },
    };
    match end {
      Some(end) => {
        self.end = Some(end);
        Decoded::Complete(end)
      }
      None => Decoded::Incomplete,
    }
  }

  fn fail(&mut self, reason: String) -> Decoded<usize> {
    self.malformed = Some(reason.clone());
    Decoded::Malformed(reason)
  }

  fn advance_chunks(&mut self, buf: &[u8]) -> Decoded<usize> {
    loop {
      let rest = &buf[self.chunk..];
      let Some(line_len) = find_crlf(rest) else {
        if rest.len() > MAX_CHUNK_LINE {
          return Decoded::Malformed("chunk line too long".to_string());
        }
        return Decoded::Incomplete;
      };
      let next = self.chunk + line_len + 2;
      if self.trailers {
        self.chunk = next;
        if line_len == 0 {
          return Decoded::Complete(next);
        }
        continue;
      }
      let Some(size) = parse_chunk_size(&rest[..line_len]) else {
        return Decoded::Malformed("invalid chunk size".to_string());
      };
      if size == 0 {
        self.trailers = true;
        self.chunk = next;
        continue;
      }
      match size.checked_add(2).and_then(|framed| next.checked_add(framed)) {
        Some(after) if after <= buf.len() => self.chunk = after,
        Some(_) => return Decoded::Incomplete,
        None => return Decoded::Malformed(format!("chunk size {:x} out of range", size)),
      }
    }
  }

  /// De-framed body as far as it arrived. Chunked bodies that never
  /// finished are kept raw.
  fn body_of(&self, buf: &[u8]) -> Bytes {
    let Some((body_start, framing)) = self.body else {
      return Bytes::new();
    };
    let rest = &buf[body_start..];
    match framing {
      BodyFraming::Empty => Bytes::new(),
      BodyFraming::Length(n) => Bytes::copy_from_slice(&rest[..n.min(rest.len())]),
      BodyFraming::Chunked => match dechunk(rest) {
        Decoded::Complete((body, _)) => Bytes::from(body),
        _ => Bytes::copy_from_slice(rest),
      },
      BodyFraming::Unframed | BodyFraming::UntilClose => Bytes::copy_from_slice(rest),
    }
  }

  /// The request in `buf` once [`Progress::request`] completed.
  pub fn parse_request(&self, buf: &[u8]) -> Option<ParsedRequest> {
    let (body_start, _) = self.body?;
    self.end?;
    let head = parse_request_head(&buf[self.start..body_start]).ok()?;
    Some(ParsedRequest::from_parts(head, self.body_of(buf)))
  }

  /// The response in `buf` after [`Progress::response`] looked at it. With no
  /// parsable status line the bytes become the body of a `200` with no
  /// headers.
  pub fn parse_response(&self, buf: &[u8]) -> ParsedResponse {
    let head = self
      .body
      .and_then(|(body_start, _)| parse_response_head(&buf[self.start..body_start]).ok());
    match head {
      Some(head) => ParsedResponse {
        status: head.status,
        headers: head.headers,
        body: self.body_of(buf),
      },
      None => {
        tracing::debug!("response has no parsable status line, recording as 200");
        ParsedResponse {
          status: 200,
          headers: HeaderTable::new(),
          body: Bytes::copy_from_slice(&buf[self.start..]),
        }
      }
    }
  }
}

/// Decode the first request in `buf`.
///
/// With a `Content-Length` the request stays `Incomplete` until that many
/// body bytes follow the blank line; the body is exactly those bytes. Without
/// one, whatever follows the blank line is the body.
pub fn decode(buf: &[u8]) -> Decoded<ParsedRequest> {
  let mut progress = Progress::default();
  match progress.request(buf) {
    Decoded::Complete(_) => match progress.parse_request(buf) {
      Some(request) => Decoded::Complete(request),
      None => Decoded::Malformed("unparsable request head".to_string()),
    },
    Decoded::Incomplete => Decoded::Incomplete,
    Decoded::Malformed(reason) => Decoded::Malformed(reason),
  }
}

/// Whether `buf` already holds a complete request.
pub fn is_complete(buf: &[u8]) -> bool {
  matches!(decode(buf), Decoded::Complete(_))
}

/// Responses to HEAD, and 1xx/204/304 responses, never carry a body.
pub fn response_has_no_body(method: &str, status: u16) -> bool {
  method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304
}

/// Whether `buf` holds a complete response to a `method` request.
/// Responses delimited by connection close are only complete at end of stream.
pub fn response_complete(buf: &[u8], method: &str) -> bool {
  matches!(Progress::default().response(buf, method), Decoded::Complete(_))
}

/// Decode the response in `buf`. When no status line can be parsed the whole
/// buffer becomes the body of a `200` with no headers.
pub fn decode_response(buf: &[u8], method: &str) -> ParsedResponse {
  let mut progress = Progress::default();
  progress.response(buf, method);
  progress.parse_response(buf)
}

fn well_formed_percent(raw: &str) -> bool {
  let bytes = raw.as_bytes();
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' {
      match bytes.get(i + 1..i + 3) {
        Some([a, b]) if a.is_ascii_hexdigit() && b.is_ascii_hexdigit() => i += 3,
        _ => return false,
      }
    } else {
      i += 1;
    }
  }
  true
}

/// Percent-decode one form/query component (`+` is a space). Malformed
/// escapes or non UTF-8 results keep the raw substring.
pub fn decode_component(raw: &str) -> String {
  if !well_formed_percent(raw) {
    return raw.to_string();
  }
  let spaced = raw.replace('+', " ");
  percent_decode_str(&spaced)
    .decode_utf8()
    .map(|s| s.into_owned())
    .unwrap_or_else(|_| raw.to_string())
}

/// Percent-encode one form/query component.
pub fn encode_component(value: &str) -> String {
  utf8_percent_encode(value, FORM_COMPONENT).to_string()
}

fn parse_urlencoded(input: &str) -> ParamMap {
  let mut params = ParamMap::new();
  for pair in input.split('&').filter(|p| !p.is_empty()) {
    let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
    params.insert(decode_component(k), decode_component(v));
  }
  params
}

/// Serialize parameters as `key=value&key=value`.
pub fn encode_form(params: &ParamMap) -> String {
  params
    .iter()
    .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
    .collect::<Vec<_>>()
    .join("&")
}

/// Query parameters of a request-target; the last duplicate wins.
pub fn parse_query(target: &str) -> ParamMap {
  match target.split_once('?') {
    Some((_, query)) => parse_urlencoded(query.split('#').next().unwrap_or_default()),
    None => ParamMap::new(),
  }
}

/// Flatten a `Cookie` header (`a=1; b=2`) into a map.
pub fn parse_cookies(header: &str) -> ParamMap {
  cookie::Cookie::split_parse(header)
    .filter_map(|c| c.ok())
    .map(|c| (c.name().to_string(), c.value().to_string()))
    .collect()
}

/// Whether the content type is `application/x-www-form-urlencoded`.
pub fn is_form_urlencoded(headers: &HeaderTable) -> bool {
  headers
    .get(http::header::CONTENT_TYPE.as_str())
    .and_then(|ct| ct.split(';').next())
    .map(|ct| ct.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
    .unwrap_or(false)
}

/// Form parameters, empty unless the body is form-url-encoded.
pub fn parse_form(headers: &HeaderTable, body: &[u8]) -> ParamMap {
  if is_form_urlencoded(headers) {
    parse_urlencoded(&String::from_utf8_lossy(body))
  } else {
    ParamMap::new()
  }
}

/// Body as text, honoring a `charset` parameter when the `charset` feature is on.
pub fn body_text(body: &[u8], headers: &HeaderTable) -> String {
  #[cfg(feature = "charset")]
  {
    let encoding = headers
      .get(http::header::CONTENT_TYPE.as_str())
      .and_then(|ct| ct.parse::<mime::Mime>().ok())
      .and_then(|mime| {
        mime
          .get_param(mime::CHARSET)
          .map(|charset| charset.as_str().to_string())
      })
      .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()));
    if let Some(encoding) = encoding {
      let (text, _, _) = encoding.decode(body);
      return text.into_owned();
    }
  }
  #[cfg(not(feature = "charset"))]
  let _ = headers;
  String::from_utf8_lossy(body).into_owned()
}

/// Build the record for one finished exchange.
pub fn capture(
  request: &ParsedRequest,
  response: &ParsedResponse,
  protocol: Protocol,
) -> CapturedRecord {
  CapturedRecord {
    method: request.head.method.clone(),
    path: request.head.target.clone(),
    query: request.query.clone(),
    headers: request.head.headers.clone(),
    cookies: request.cookies.clone(),
    form: request.form.clone(),
    body: body_text(&request.body, &request.head.headers),
    status: response.status,
    response_headers: response.headers.clone(),
    response_body: body_text(&response.body, &response.headers),
    protocol,
  }
}

/// Flatten a record into the persisted shape, each structured field
/// serialized to its own JSON object.
pub fn encode(record: &CapturedRecord) -> Result<EncodedRecord> {
  Ok(EncodedRecord {
    method: record.method.clone(),
    path: record.path.clone(),
    get_params: serde_json::to_string(&record.query)?,
    headers: serde_json::to_string(&record.headers)?,
    cookies: serde_json::to_string(&record.cookies)?,
    post_params: serde_json::to_string(&record.form)?,
    body: record.body.clone(),
    response_code: i64::from(record.status),
    response_headers: serde_json::to_string(&record.response_headers)?,
    response_body: record.response_body.clone(),
    protocol: record.protocol.to_string(),
  })
}

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderTable) {
  for (k, v) in headers.iter() {
    buf.extend(k.as_bytes());
    buf.extend(COLON_SPACE);
    buf.extend(v.as_bytes());
    buf.extend(CR_LF);
  }
  buf.extend(CR_LF);
}

/// Serialize an HTTP/1.1 request line and header block.
pub fn write_request_head(method: &str, target: &str, headers: &HeaderTable) -> Vec<u8> {
  let mut buf = Vec::new();
  buf.extend(method.as_bytes());
  buf.extend(SPACE);
  buf.extend(target.as_bytes());
  buf.extend(SPACE);
  buf.extend(b"HTTP/1.1");
  buf.extend(CR_LF);
  write_headers(&mut buf, headers);
  buf
}

/// Serialize an HTTP/1.1 status line and header block.
pub fn write_response_head(status: u16, headers: &HeaderTable) -> Vec<u8> {
  let reason = http::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("Unknown");
  let mut buf = format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes();
  write_headers(&mut buf, headers);
  buf
}

#[cfg(test)]
mod tests {
  use super::*;

  fn complete(buf: &[u8]) -> ParsedRequest {
    match decode(buf) {
      Decoded::Complete(r) => r,
      other => panic!("expected complete request, got {:?}", other),
    }
  }

  #[test]
  fn content_length_gates_completeness() {
    let head = b"POST /submit HTTP/1.1\r\nHost: a.test\r\nContent-Length: 5\r\n\r\n";
    let mut buf = head.to_vec();
    buf.extend_from_slice(b"hel");
    assert_eq!(decode(&buf), Decoded::Incomplete);
    buf.extend_from_slice(b"lo");
    assert_eq!(complete(&buf).body, Bytes::from_static(b"hello"));
    buf.extend_from_slice(b"GET / HTTP/1.1\r\n");
    assert_eq!(complete(&buf).body, Bytes::from_static(b"hello"));
  }

  #[test]
  fn bodyless_request_is_complete_at_blank_line() {
    assert_eq!(decode(b"GET / HTTP/1.1\r\nHost: a"), Decoded::Incomplete);
    let request = complete(b"GET /?a=1 HTTP/1.1\r\nHost: a.test\r\n\r\n");
    assert_eq!(request.head.method, "GET");
    assert!(request.body.is_empty());
  }

  #[test]
  fn missing_target_is_malformed() {
    assert!(matches!(decode(b"GET\r\n\r\n"), Decoded::Malformed(_)));
    assert!(matches!(
      decode(b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n"),
      Decoded::Malformed(_)
    ));
  }

  #[test]
  fn headers_cookies_and_query_are_parsed() {
    let request = complete(
      b"GET /search?q=rust+lang&page=2&q=last HTTP/1.1\r\n\
        Host: example.com\r\n\
        Cookie: session=abc; theme=dark\r\n\
        X-Odd:no-space\r\n\r\n",
    );
    assert_eq!(request.head.target, "/search?q=rust+lang&page=2&q=last");
    assert_eq!(request.head.headers.get("host"), Some("example.com"));
    assert_eq!(request.head.headers.get("x-odd"), Some("no-space"));
    assert_eq!(request.query.get("q").map(String::as_str), Some("last"));
    assert_eq!(request.query.get("page").map(String::as_str), Some("2"));
    assert_eq!(request.cookies.get("session").map(String::as_str), Some("abc"));
    assert_eq!(request.cookies.get("theme").map(String::as_str), Some("dark"));
    assert!(request.form.is_empty());
  }

  #[test]
  fn form_bodies_are_decoded_only_for_form_content() {
    let request = complete(
      b"POST /login HTTP/1.1\r\n\
        Content-Type: application/x-www-form-urlencoded; charset=utf-8\r\n\
        Content-Length: 27\r\n\r\nuser=bob%40x.io&pass=a+b%21",
    );
    assert_eq!(request.form.get("user").map(String::as_str), Some("bob@x.io"));
    assert_eq!(request.form.get("pass").map(String::as_str), Some("a b!"));

    let request = complete(
      b"POST /api HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}",
    );
    assert!(request.form.is_empty());
    assert_eq!(request.body, Bytes::from_static(b"{\"a\":1}"));
  }

  #[test]
  fn malformed_escapes_keep_raw_text() {
    let query = parse_query("/p?bad=%zz&ok=%41");
    assert_eq!(query.get("bad").map(String::as_str), Some("%zz"));
    assert_eq!(query.get("ok").map(String::as_str), Some("A"));
  }

  #[test]
  fn chunked_requests_complete_on_last_chunk() {
    let mut buf =
      b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n".to_vec();
    assert_eq!(decode(&buf), Decoded::Incomplete);
    buf.extend_from_slice(b"0\r\n\r\n");
    assert_eq!(complete(&buf).body, Bytes::from_static(b"Wikipedia"));
  }

  #[test]
  fn impossible_chunk_sizes_are_malformed() {
    let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabcdefgh\r\n";
    assert!(matches!(decode(raw), Decoded::Malformed(_)));
    assert!(matches!(dechunk(b"ffffffffffffffff\r\nabcdefgh\r\n"), Decoded::Malformed(_)));
    assert!(matches!(dechunk(b"fffffffffffffffff\r\n"), Decoded::Malformed(_)));
    assert!(matches!(dechunk(b"zz\r\n"), Decoded::Malformed(_)));
    // large but representable sizes just wait for more bytes
    assert_eq!(dechunk(b"ffffffff\r\nabc"), Decoded::Incomplete);

    let mut progress = Progress::default();
    let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\n";
    assert!(matches!(progress.response(head, "GET"), Decoded::Malformed(_)));
  }

  #[test]
  fn progress_resumes_across_reads() {
    let raw: &[u8] =
      b"POST /up HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;x=1\r\npedia\r\n0\r\nX-T: 1\r\n\r\n";
    let mut progress = Progress::default();
    let mut buf = Vec::new();
    for (i, byte) in raw.iter().enumerate() {
      buf.push(*byte);
      let state = progress.request(&buf);
      if i + 1 < raw.len() {
        assert_eq!(state, Decoded::Incomplete, "complete too early at {}", i);
      } else {
        assert_eq!(state, Decoded::Complete(raw.len()));
      }
    }
    let request = progress.parse_request(&buf).unwrap();
    assert_eq!(request.body, Bytes::from_static(b"Wikipedia"));

    let raw: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
    let mut progress = Progress::default();
    assert_eq!(progress.response(&raw[..30], "POST"), Decoded::Incomplete);
    assert_eq!(progress.response(&raw[..raw.len() - 1], "POST"), Decoded::Incomplete);
    assert_eq!(progress.response(raw, "POST"), Decoded::Complete(raw.len()));
    let response = progress.parse_response(raw);
    assert_eq!(response.status, 201);
    assert_eq!(response.body, Bytes::from_static(b"ok"));
  }

  #[test]
  fn endless_chunk_lines_are_malformed() {
    let mut buf = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    buf.extend(std::iter::repeat(b'1').take(MAX_CHUNK_LINE + 1));
    assert!(matches!(Progress::default().request(&buf), Decoded::Malformed(_)));
  }

  #[test]
  fn response_completeness_and_decoding() {
    let partial = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot f";
    assert!(!response_complete(partial, "GET"));
    let full = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found";
    assert!(response_complete(full, "GET"));
    let response = decode_response(full, "GET");
    assert_eq!(response.status, 404);
    assert_eq!(response.body, Bytes::from_static(b"not found"));

    let head_only = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
    assert!(response_complete(head_only, "HEAD"));
    assert!(!response_complete(b"HTTP/1.1 200 OK\r\n\r\nstreaming", "GET"));
  }

  #[test]
  fn interim_responses_are_skipped() {
    let buf = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
    assert!(response_complete(buf, "POST"));
    assert_eq!(decode_response(buf, "POST").status, 201);
  }

  #[test]
  fn unparsable_status_line_degrades_to_200() {
    let response = decode_response(b"garbage bytes", "GET");
    assert_eq!(response.status, 200);
    assert!(response.headers.is_empty());
    assert_eq!(response.body, Bytes::from_static(b"garbage bytes"));
  }

  #[test]
  fn encode_serializes_each_field_as_json() {
    let request = complete(b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\nCookie: c=2\r\n\r\n");
    let response = decode_response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi", "GET");
    let encoded = encode(&capture(&request, &response, Protocol::Https)).unwrap();
    assert_eq!(encoded.get_params, r#"{"x":"1"}"#);
    assert_eq!(encoded.headers, r#"{"host":"h","cookie":"c=2"}"#);
    assert_eq!(encoded.cookies, r#"{"c":"2"}"#);
    assert_eq!(encoded.post_params, "{}");
    assert_eq!(encoded.response_code, 200);
    assert_eq!(encoded.response_body, "hi");
    assert_eq!(encoded.protocol, "https");
  }

  #[test]
  fn heads_serialize_back_to_wire_format() {
    let headers: HeaderTable = [("Host", "a.test"), ("Accept", "*/*")].into_iter().collect();
    assert_eq!(
      write_request_head("GET", "/x", &headers),
      b"GET /x HTTP/1.1\r\nhost: a.test\r\naccept: */*\r\n\r\n".to_vec()
    );
    assert!(write_response_head(502, &HeaderTable::new()).starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
  }

  #[test]
  fn form_encoding_escapes_reserved_characters() {
    let mut params = ParamMap::new();
    params.insert("a b".into(), "x&y=z".into());
    assert_eq!(encode_form(&params), "a%20b=x%26y%3Dz");
  }
}
