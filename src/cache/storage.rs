//! Cache storage trait and SQLite implementation.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::db::Database;
use crate::net::Headers;

use super::classify::ResourceType;
use super::entry::{format_timestamp, parse_timestamp, CacheEntry, CacheKey, CacheNamespace};

/// Limits applied when pruning a namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionPolicy {
  /// Drop entries stored longer ago than this
  pub max_age: Option<Duration>,
  /// Keep at most this many entries, dropping the oldest first
  pub max_entries: Option<usize>,
}

/// Trait for cache storage backends.
///
/// Reads never fail: a storage error is logged and reported as a miss.
pub trait CacheStore: Send + Sync {
  /// Look up an entry.
  fn get(&self, ns: &CacheNamespace, key: &CacheKey) -> Option<CacheEntry>;

  /// Store an entry under its key, replacing any previous one atomically.
  fn put(&self, ns: &CacheNamespace, entry: &CacheEntry) -> Result<()>;

  /// Remove an entry. Returns whether one existed.
  fn delete(&self, ns: &CacheNamespace, key: &CacheKey) -> Result<bool>;

  /// Remove every entry of every namespace whose name starts with `prefix`.
  fn clear(&self, prefix: &str) -> Result<usize>;

  /// Keys stored in a namespace.
  fn keys(&self, ns: &CacheNamespace) -> Result<Vec<CacheKey>>;

  /// Names of all namespaces holding at least one entry, with entry counts.
  fn namespaces(&self) -> Result<BTreeMap<String, usize>>;

  /// Entry counts per resource type across all namespaces.
  fn count_by_type(&self) -> Result<BTreeMap<ResourceType, usize>>;

  /// Prune a namespace. Returns the number of entries removed.
  fn evict(&self, ns: &CacheNamespace, policy: &EvictionPolicy) -> Result<usize>;

  /// Application data lookup; errors degrade to `None`.
  fn get_data(&self, key: &str) -> Option<Value>;

  fn set_data(&self, key: &str, value: &Value) -> Result<()>;

  fn delete_data(&self, key: &str) -> Result<bool>;

  fn clear_data(&self) -> Result<usize>;

  fn data_len(&self) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn get(&self, _ns: &CacheNamespace, _key: &CacheKey) -> Option<CacheEntry> {
    None // Always miss
  }

  fn put(&self, _ns: &CacheNamespace, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _ns: &CacheNamespace, _key: &CacheKey) -> Result<bool> {
    Ok(false)
  }

  fn clear(&self, _prefix: &str) -> Result<usize> {
    Ok(0)
  }

  fn keys(&self, _ns: &CacheNamespace) -> Result<Vec<CacheKey>> {
    Ok(Vec::new())
  }

  fn namespaces(&self) -> Result<BTreeMap<String, usize>> {
    Ok(BTreeMap::new())
  }

  fn count_by_type(&self) -> Result<BTreeMap<ResourceType, usize>> {
    Ok(BTreeMap::new())
  }

  fn evict(&self, _ns: &CacheNamespace, _policy: &EvictionPolicy) -> Result<usize> {
    Ok(0)
  }

  fn get_data(&self, _key: &str) -> Option<Value> {
    None
  }

  fn set_data(&self, _key: &str, _value: &Value) -> Result<()> {
    Ok(())
  }

  fn delete_data(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn clear_data(&self) -> Result<usize> {
    Ok(0)
  }

  fn data_len(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStore {
  db: Arc<Database>,
}

impl SqliteCacheStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  fn try_get(&self, ns: &CacheNamespace, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.conn()?;

    let row: Option<(String, String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT cache_key, resource_type, status, headers, body, stored_at
         FROM cache_entries WHERE namespace = ? AND key_hash = ?",
        params![ns.name(), key_hash(key)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((cache_key, resource_type, status, headers, body, stored_at)) = row else {
      return Ok(None);
    };

    let resource_type = ResourceType::parse(&resource_type)
      .ok_or_else(|| eyre!("Unknown resource type '{}'", resource_type))?;
    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
    let stored_at =
      parse_timestamp(&stored_at).ok_or_else(|| eyre!("Bad timestamp '{}'", stored_at))?;

    Ok(Some(CacheEntry {
      key: CacheKey::from_raw(cache_key),
      resource_type,
      status,
      headers,
      body: body.into(),
      stored_at,
    }))
  }

  fn try_get_data(&self, key: &str) -> Result<Option<Value>> {
    let conn = self.db.conn()?;
    let raw: Option<String> = conn
      .query_row(
        "SELECT value FROM app_data WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read app data: {}", e))?;

    raw
      .map(|s| serde_json::from_str(&s).map_err(|e| eyre!("Corrupt app data: {}", e)))
      .transpose()
  }
}

impl CacheStore for SqliteCacheStore {
  fn get(&self, ns: &CacheNamespace, key: &CacheKey) -> Option<CacheEntry> {
    match self.try_get(ns, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(namespace = %ns, key = %key, "cache read failed, treating as miss: {}", e);
        None
      }
    }
  }

  fn put(&self, ns: &CacheNamespace, entry: &CacheEntry) -> Result<()> {
    let conn = self.db.conn()?;
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (namespace, key_hash, cache_key, resource_type, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          ns.name(),
          key_hash(&entry.key),
          entry.key.as_str(),
          entry.resource_type.as_str(),
          entry.status,
          headers,
          &entry.body[..],
          format_timestamp(entry.stored_at),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn delete(&self, ns: &CacheNamespace, key: &CacheKey) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND key_hash = ?",
        params![ns.name(), key_hash(key)],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn clear(&self, prefix: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE substr(namespace, 1, length(?1)) = ?1",
        params![prefix],
      )
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(removed)
  }

  fn keys(&self, ns: &CacheNamespace) -> Result<Vec<CacheKey>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT cache_key FROM cache_entries WHERE namespace = ? ORDER BY cache_key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![ns.name()], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .filter_map(|r| r.ok())
      .map(CacheKey::from_raw)
      .collect();

    Ok(keys)
  }

  fn namespaces(&self) -> Result<BTreeMap<String, usize>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT namespace, COUNT(*) FROM cache_entries GROUP BY namespace")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let counts = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to count namespaces: {}", e))?
      .filter_map(|r| r.ok())
      .map(|(ns, n)| (ns, n as usize))
      .collect();

    Ok(counts)
  }

  fn count_by_type(&self) -> Result<BTreeMap<ResourceType, usize>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT resource_type, COUNT(*) FROM cache_entries GROUP BY resource_type")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let counts = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to count resource types: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|(t, n)| ResourceType::parse(&t).map(|t| (t, n as usize)))
      .collect();

    Ok(counts)
  }

  fn evict(&self, ns: &CacheNamespace, policy: &EvictionPolicy) -> Result<usize> {
    let conn = self.db.conn()?;
    let name = ns.name();
    let mut removed = 0;

    if let Some(max_age) = policy.max_age {
      let cutoff = format_timestamp(Utc::now() - max_age);
      removed += conn
        .execute(
          "DELETE FROM cache_entries WHERE namespace = ? AND stored_at < ?",
          params![name, cutoff],
        )
        .map_err(|e| eyre!("Failed to evict expired entries: {}", e))?;
    }

    if let Some(max_entries) = policy.max_entries {
      let count: i64 = conn
        .query_row(
          "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
          params![name],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count entries: {}", e))?;

      let excess = count - max_entries as i64;
      if excess > 0 {
        removed += conn
          .execute(
            "DELETE FROM cache_entries WHERE rowid IN (
               SELECT rowid FROM cache_entries WHERE namespace = ?
               ORDER BY stored_at ASC LIMIT ?)",
            params![name, excess],
          )
          .map_err(|e| eyre!("Failed to trim namespace: {}", e))?;
      }
    }

    Ok(removed)
  }

  fn get_data(&self, key: &str) -> Option<Value> {
    match self.try_get_data(key) {
      Ok(value) => value,
      Err(e) => {
        warn!(key, "app data read failed, treating as miss: {}", e);
        None
      }
    }
  }

  fn set_data(&self, key: &str, value: &Value) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO app_data (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, value.to_string(), format_timestamp(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to store app data: {}", e))?;
    Ok(())
  }

  fn delete_data(&self, key: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM app_data WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete app data: {}", e))?;
    Ok(removed > 0)
  }

  fn clear_data(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM app_data", [])
      .map_err(|e| eyre!("Failed to clear app data: {}", e))?;
    Ok(removed)
  }

  fn data_len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM app_data", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count app data: {}", e))?;
    Ok(count as usize)
  }
}

/// SHA256 of the key for stable, fixed-length primary keys.
fn key_hash(key: &CacheKey) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::HttpResponse;
  use serde_json::json;
  use url::Url;

  fn store() -> SqliteCacheStore {
    SqliteCacheStore::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn entry(path: &str, resource_type: ResourceType, body: &str, age: Duration) -> CacheEntry {
    let url = Url::parse("https://app.example.com").unwrap().join(path).unwrap();
    CacheEntry::from_response(
      CacheKey::get(&url),
      resource_type,
      &HttpResponse::new(200, body.to_string()).with_header("content-type", "text/plain"),
      Utc::now() - age,
    )
  }

  #[test]
  fn test_put_then_get() {
    let store = store();
    let e = entry("/app.js", ResourceType::Asset, "console.log(1)", Duration::zero());
    store.put(&CacheNamespace::Runtime, &e).unwrap();

    let got = store.get(&CacheNamespace::Runtime, &e.key).unwrap();
    assert_eq!(got.body, e.body);
    assert_eq!(got.resource_type, ResourceType::Asset);
    assert_eq!(got.headers.get("content-type").unwrap(), "text/plain");
    assert!(store.get(&CacheNamespace::Offline, &e.key).is_none());
  }

  #[test]
  fn test_replace_on_write() {
    let store = store();
    let mut first = entry("/app.js", ResourceType::Asset, "old", Duration::days(2));
    first.headers.insert("x-old".to_string(), "1".to_string());
    store.put(&CacheNamespace::Runtime, &first).unwrap();

    let second = entry("/app.js", ResourceType::Asset, "new", Duration::zero());
    store.put(&CacheNamespace::Runtime, &second).unwrap();

    let got = store.get(&CacheNamespace::Runtime, &second.key).unwrap();
    assert_eq!(&got.body[..], b"new");
    assert_eq!(got.headers, second.headers);
    assert!(!got.headers.contains_key("x-old"));
    assert!(got.stored_at > first.stored_at);
    assert_eq!(store.keys(&CacheNamespace::Runtime).unwrap().len(), 1);
  }

  #[test]
  fn test_corrupt_row_is_a_miss() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = SqliteCacheStore::new(db.clone());
    let e = entry("/a.png", ResourceType::Image, "png", Duration::zero());
    store.put(&CacheNamespace::Runtime, &e).unwrap();

    db.conn()
      .unwrap()
      .execute("UPDATE cache_entries SET headers = 'not json'", [])
      .unwrap();

    assert!(store.get(&CacheNamespace::Runtime, &e.key).is_none());
  }

  #[test]
  fn test_delete_and_clear_by_prefix() {
    let store = store();
    let a = entry("/a.css", ResourceType::Asset, "a", Duration::zero());
    let b = entry("/b.css", ResourceType::Asset, "b", Duration::zero());
    store.put(&CacheNamespace::Precache(1), &a).unwrap();
    store.put(&CacheNamespace::Precache(2), &b).unwrap();
    store.put(&CacheNamespace::Runtime, &a).unwrap();

    assert!(store.delete(&CacheNamespace::Runtime, &a.key).unwrap());
    assert!(!store.delete(&CacheNamespace::Runtime, &a.key).unwrap());

    assert_eq!(store.clear(CacheNamespace::precache_prefix()).unwrap(), 2);
    assert!(store.namespaces().unwrap().is_empty());
  }

  #[test]
  fn test_counts() {
    let store = store();
    store
      .put(&CacheNamespace::Runtime, &entry("/", ResourceType::Page, "", Duration::zero()))
      .unwrap();
    store
      .put(&CacheNamespace::Runtime, &entry("/about", ResourceType::Page, "", Duration::zero()))
      .unwrap();
    store
      .put(&CacheNamespace::Runtime, &entry("/a.png", ResourceType::Image, "", Duration::zero()))
      .unwrap();

    let by_type = store.count_by_type().unwrap();
    assert_eq!(by_type.get(&ResourceType::Page), Some(&2));
    assert_eq!(by_type.get(&ResourceType::Image), Some(&1));
    assert_eq!(store.namespaces().unwrap().get("runtime"), Some(&3));
  }

  #[test]
  fn test_evict_by_age_then_size() {
    let store = store();
    let ns = CacheNamespace::Runtime;
    store.put(&ns, &entry("/old", ResourceType::Page, "", Duration::days(10))).unwrap();
    store.put(&ns, &entry("/a", ResourceType::Page, "", Duration::hours(3))).unwrap();
    store.put(&ns, &entry("/b", ResourceType::Page, "", Duration::hours(2))).unwrap();
    store.put(&ns, &entry("/c", ResourceType::Page, "", Duration::hours(1))).unwrap();

    let policy = EvictionPolicy {
      max_age: Some(Duration::days(1)),
      max_entries: Some(2),
    };
    assert_eq!(store.evict(&ns, &policy).unwrap(), 2);

    let keys: Vec<String> = store
      .keys(&ns)
      .unwrap()
      .into_iter()
      .map(|k| k.to_string())
      .collect();
    assert_eq!(
      keys,
      vec![
        "GET https://app.example.com/b".to_string(),
        "GET https://app.example.com/c".to_string(),
      ]
    );
  }

  #[test]
  fn test_app_data() {
    let store = store();
    assert!(store.get_data("draft").is_none());

    store.set_data("draft", &json!({"name": "north lot"})).unwrap();
    store.set_data("draft", &json!({"name": "south lot"})).unwrap();
    assert_eq!(store.get_data("draft"), Some(json!({"name": "south lot"})));
    assert_eq!(store.data_len().unwrap(), 1);

    assert!(store.delete_data("draft").unwrap());
    store.set_data("a", &json!(1)).unwrap();
    store.set_data("b", &json!(2)).unwrap();
    assert_eq!(store.clear_data().unwrap(), 2);
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harbor.db");
    let e = entry("/logo.png", ResourceType::Image, "png", Duration::zero());

    {
      let store = SqliteCacheStore::new(Arc::new(Database::open(&path).unwrap()));
      store.put(&CacheNamespace::Runtime, &e).unwrap();
    }

    let store = SqliteCacheStore::new(Arc::new(Database::open(&path).unwrap()));
    assert_eq!(store.get(&CacheNamespace::Runtime, &e.key).unwrap().body, e.body);
  }
}
