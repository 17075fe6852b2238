//! Hidden-parameter discovery
//!
//! Replays a captured request once per candidate parameter name with a
//! sentinel value and reports the names whose response reflects it.
use crate::client::{OriginClient, OutboundRequest};
use crate::codec::{decode_component, encode_component};
use crate::errors::{Error, Result};
use crate::store::RequestStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default value injected for each candidate.
pub const SENTINEL: &str = "djsahaf";

/// Common hidden parameter names to test
pub const PARAMETER_WORDLIST: &[&str] = &[
  // Debug/Admin
  "debug", "test", "testing", "admin", "administrator", "internal", "dev", "develop",
  "development", "staging", "prod", "production", "local", "localhost", "verbose", "trace",
  "log", "logging", "loglevel", "dump", "profile", "profiler", "benchmark", "diag",
  "diagnostic", "diagnostics", "xdebug", "debug_mode", "debugmode", "show_errors", "errors",
  "error", "stack", "stacktrace", "phpinfo", "info", "status", "health", "metrics", "stats",
  // Authentication
  "bypass", "skip_auth", "skip", "noauth", "anonymous", "guest", "token", "access_token",
  "auth_token", "refresh_token", "id_token", "api_key", "apikey", "api-key", "key", "secret",
  "client_id", "client_secret", "auth", "authorization", "session", "sessionid", "session_id",
  "sid", "jwt", "password", "pass", "passwd", "pwd", "login", "logout", "signup", "register",
  "role", "roles", "permission", "permissions", "privilege", "is_admin", "isadmin", "superuser",
  "sudo", "impersonate", "as_user", "otp", "code", "mfa", "2fa", "remember", "remember_me",
  // Feature flags
  "feature", "features", "flag", "flags", "enable", "enabled", "disable", "disabled", "beta",
  "alpha", "preview", "experiment", "experimental", "variant", "version", "v", "ver", "legacy",
  "new", "old", "canary", "toggle", "ab", "bucket",
  // Redirects
  "redirect", "redirect_uri", "redirect_url", "redirectto", "redirect_to", "return",
  "return_url", "returnurl", "return_to", "returnto", "next", "url", "uri", "dest",
  "destination", "target", "goto", "link", "continue", "forward", "ref", "referer", "referrer",
  "callback_url", "success_url", "failure_url", "cancel_url", "back", "origin_url", "site",
  "domain", "host", "port", "proxy",
  // Identifiers
  "id", "ids", "user", "users", "user_id", "userid", "uid", "username", "login_id", "account",
  "account_id", "email", "mail", "phone", "name", "first_name", "last_name", "fullname",
  "customer", "customer_id", "order_id", "item", "item_id", "product", "product_id", "pid",
  "cat", "category", "category_id", "group", "group_id", "gid", "org", "organization",
  "tenant", "tenant_id", "project", "project_id", "team", "member", "owner", "uuid", "guid",
  "hash", "slug", "handle",
  // Search and paging
  "page", "p", "q", "s", "search", "query", "keyword", "keywords", "term", "terms", "filter",
  "filters", "where", "sort", "sortby", "sort_by", "order", "orderby", "order_by", "dir",
  "direction", "asc", "desc", "limit", "offset", "per_page", "perpage", "page_size",
  "pagesize", "size", "count", "max", "min", "start", "end", "from", "to", "since", "until",
  "before", "after", "cursor", "date", "time", "year", "month", "day", "range", "fields",
  "field", "columns", "select", "expand", "embed", "include_deleted", "all", "show", "hide",
  // Output format
  "format", "type", "output", "content_type", "contenttype", "accept", "mime", "json", "xml",
  "html", "raw", "text", "plain", "pretty", "download", "export", "print", "preview_mode",
  "encoding", "charset", "compress", "gzip", "pdf", "csv",
  // JSONP
  "callback", "jsonp", "cb", "fn", "function", "jsoncallback", "json_callback", "handler",
  // Actions
  "action", "method", "cmd", "command", "exec", "execute", "op", "operation", "do", "mode",
  "task", "func", "job", "run", "process", "step", "stage", "event", "trigger", "submit",
  "save", "delete", "remove", "update", "edit", "create", "add", "insert", "upload", "reset",
  "confirm", "approve", "verify", "validate", "check", "force", "dry_run", "dryrun", "async",
  "sync", "batch", "bulk",
  // Includes and templates
  "template", "tpl", "include", "inc", "load", "require", "import", "view", "layout", "theme",
  "skin", "style", "css", "js", "script", "page_id", "module", "mod", "component", "plugin",
  "widget", "section", "tab", "panel", "frame", "file", "filename", "path", "filepath",
  "folder", "dir_path", "document", "doc", "src", "source", "resource", "asset", "image",
  "img", "avatar", "attachment", "content", "lang_file", "config_file",
  // Cache busting
  "cache", "nocache", "no_cache", "cachebust", "cache_buster", "refresh", "reload", "bust",
  "timestamp", "ts", "t", "rand", "random", "r", "nonce_value", "_", "cb_", "stamp",
  // CORS and security
  "origin", "cors", "allow", "allowed", "access", "csrf", "csrf_token", "xsrf", "_token",
  "authenticity_token", "nonce", "state", "scope", "grant_type", "response_type",
  "signature", "sig", "sign", "checksum", "hmac", "ip", "client_ip", "ua", "useragent",
  // Misc
  "config", "configuration", "setting", "settings", "option", "options", "opt", "param",
  "params", "parameter", "data", "payload", "body", "input", "value", "val", "values", "obj",
  "object", "json_data", "xml_data", "message", "msg", "comment", "note", "title",
  "description", "desc_text", "subject", "label", "tag", "tags", "lang", "language", "locale",
  "i18n", "l10n", "region", "country", "currency", "timezone", "tz", "geo", "lat", "lng",
  "lon", "location", "zip", "address", "city", "amount", "price", "total", "quantity", "qty",
  "discount", "coupon", "promo", "voucher", "plan", "tier", "level", "priority", "weight",
  "env", "environment", "region_id", "cluster", "node", "instance", "shard", "db", "database",
  "table", "schema", "sql", "template_id", "report", "report_id", "channel", "platform",
  "device", "os", "app", "app_id", "client", "client_version", "build", "release", "mobile",
  "desktop", "embed_mode", "iframe", "popup", "modal", "widget_id", "share", "token_type",
];

/// Outcome of one scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
  /// candidates whose probe response contained the sentinel, in list order
  pub discovered_parameters: Vec<String>,
}

/// `path` with `name` set to `value` in its query, replacing any existing
/// occurrence of `name`.
pub fn variant_path(path: &str, name: &str, value: &str) -> String {
  let (base, query) = path.split_once('?').unwrap_or((path, ""));
  let injected = format!("{}={}", encode_component(name), encode_component(value));
  let mut pairs: Vec<&str> = query
    .split('&')
    .filter(|pair| !pair.is_empty())
    .filter(|pair| decode_component(pair.split('=').next().unwrap_or_default()) != name)
    .collect();
  pairs.push(&injected);
  format!("{}?{}", base, pairs.join("&"))
}

fn reflects(body: &[u8], sentinel: &[u8]) -> bool {
  !sentinel.is_empty() && body.windows(sentinel.len()).any(|w| w == sentinel)
}

/// Replays stored requests with candidate parameters.
#[derive(Clone)]
pub struct ParamScanner {
  store: Arc<dyn RequestStore>,
  client: OriginClient,
  wordlist: Vec<String>,
  sentinel: String,
}

impl ParamScanner {
  /// Scanner over the built-in word list and sentinel.
  pub fn new(store: Arc<dyn RequestStore>, client: OriginClient) -> Self {
    Self {
      store,
      client,
      wordlist: PARAMETER_WORDLIST.iter().map(|s| s.to_string()).collect(),
      sentinel: SENTINEL.to_string(),
    }
  }

  /// Replace the candidate list.
  pub fn with_wordlist<I, S>(mut self, wordlist: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.wordlist = wordlist.into_iter().map(Into::into).collect();
    self
  }

  /// Replace the injected value.
  pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
    self.sentinel = sentinel.into();
    self
  }

  /// Candidates in probe order
  pub fn wordlist(&self) -> &[String] {
    &self.wordlist
  }

  /// Probe every candidate against the origin of record `id`, one request
  /// at a time. Probe failures count as no reflection.
  pub async fn scan(&self, id: i64) -> Result<ScanResult> {
    let stored = self.store.get(id).await?.ok_or(Error::RecordNotFound(id))?;
    let record = stored.decode()?;
    let mut base = OutboundRequest::for_record(&record)?;
    base.method = http::Method::GET.to_string();
    tracing::info!(
      "scanning record {} ({}:{}{}) with {} candidates",
      id,
      base.host,
      base.port,
      record.path,
      self.wordlist.len()
    );

    let mut result = ScanResult::default();
    for name in &self.wordlist {
      let mut probe = base.clone();
      probe.path = variant_path(&record.path, name, &self.sentinel);
      match self.client.send(&probe).await {
        Ok(response) if reflects(&response.decoded_body(), self.sentinel.as_bytes()) => {
          tracing::info!("record {}: parameter {:?} is reflected", id, name);
          result.discovered_parameters.push(name.clone());
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("probe {} for record {} failed: {}", name, id, e),
      }
    }
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn wordlist_is_large_and_has_the_usual_suspects() {
    assert!(PARAMETER_WORDLIST.len() >= 300);
    for name in ["debug", "admin", "callback", "redirect", "q"] {
      assert!(PARAMETER_WORDLIST.contains(&name), "{} missing", name);
    }
    let unique: HashSet<_> = PARAMETER_WORDLIST.iter().collect();
    assert_eq!(unique.len(), PARAMETER_WORDLIST.len(), "duplicate candidates");
  }

  #[test]
  fn variants_set_or_replace_the_candidate() {
    assert_eq!(variant_path("/search?q=x", "debug", SENTINEL), "/search?q=x&debug=djsahaf");
    assert_eq!(variant_path("/search?q=x&page=2", "q", SENTINEL), "/search?page=2&q=djsahaf");
    assert_eq!(variant_path("/", "a b", "v&w"), "/?a%20b=v%26w");
  }

  #[test]
  fn reflection_is_a_verbatim_match() {
    assert!(reflects(b"<p>djsahaf</p>", b"djsahaf"));
    assert!(!reflects(b"<p>DJSAHAF</p>", b"djsahaf"));
    assert!(!reflects(b"", b"djsahaf"));
  }
}
