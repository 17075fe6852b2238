//! Case-insensitive, insertion-ordered header table shared by the relay,
//! the tunnel and the store.
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Header names are stored lower-cased. Inserting a name that is already
/// present replaces the value in place, so the last value wins while the
/// first position is kept.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderTable {
  entries: Vec<(String, String)>,
}

impl HeaderTable {
  /// An empty table.
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert or replace `name`, returning the previous value.
  pub fn insert(&mut self, name: &str, value: impl Into<String>) -> Option<String> {
    let name = name.trim().to_ascii_lowercase();
    let value = value.into();
    match self.entries.iter_mut().find(|(k, _)| *k == name) {
      Some((_, v)) => Some(std::mem::replace(v, value)),
      None => {
        self.entries.push((name, value));
        None
      }
    }
  }

  /// Case-insensitive lookup.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether `name` is present.
  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// Remove `name`, returning its value.
  pub fn remove(&mut self, name: &str) -> Option<String> {
    let index = self
      .entries
      .iter()
      .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
    Some(self.entries.remove(index).1)
  }

  /// Entries in insertion order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Number of distinct header names.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether the table holds no headers.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Parsed `Content-Length`, if present and numeric.
  pub fn content_length(&self) -> Option<Result<usize, std::num::ParseIntError>> {
    self
      .get(http::header::CONTENT_LENGTH.as_str())
      .map(|v| v.trim().parse::<usize>())
  }

  /// Whether the last transfer coding is `chunked`.
  pub fn is_chunked(&self) -> bool {
    self
      .get(http::header::TRANSFER_ENCODING.as_str())
      .and_then(|te| te.rsplit(',').next())
      .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
      .unwrap_or(false)
  }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderTable {
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    let mut table = HeaderTable::new();
    for (k, v) in iter {
      table.insert(k.as_ref(), v);
    }
    table
  }
}

impl Serialize for HeaderTable {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.entries.len()))?;
    for (k, v) in &self.entries {
      map.serialize_entry(k, v)?;
    }
    map.end()
  }
}

struct HeaderTableVisitor;

impl<'de> Visitor<'de> for HeaderTableVisitor {
  type Value = HeaderTable;

  fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    formatter.write_str("a map of header names to string values")
  }

  fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
    let mut table = HeaderTable::new();
    while let Some((k, v)) = access.next_entry::<String, String>()? {
      table.insert(&k, v);
    }
    Ok(table)
  }
}

impl<'de> Deserialize<'de> for HeaderTable {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    deserializer.deserialize_map(HeaderTableVisitor)
  }
}
