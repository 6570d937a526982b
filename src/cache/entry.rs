//! Core types for the response cache.

use bytes::Bytes;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::fmt;
use url::Url;

use crate::net::{Headers, HttpResponse};

use super::classify::ResourceType;

const PRECACHE_PREFIX: &str = "precache-v";

/// Logical partition of the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
  /// Responses fetched while serving requests
  Runtime,
  /// The offline fallback page and friends
  Offline,
  /// Install-time assets for one cache version
  Precache(u32),
}

impl CacheNamespace {
  pub fn name(&self) -> String {
    match self {
      Self::Runtime => "runtime".to_string(),
      Self::Offline => "offline".to_string(),
      Self::Precache(version) => format!("{}{}", PRECACHE_PREFIX, version),
    }
  }

  pub fn parse(name: &str) -> Option<Self> {
    match name {
      "runtime" => Some(Self::Runtime),
      "offline" => Some(Self::Offline),
      _ => name
        .strip_prefix(PRECACHE_PREFIX)
        .and_then(|v| v.parse().ok())
        .map(Self::Precache),
    }
  }

  /// Prefix shared by every precache version.
  pub fn precache_prefix() -> &'static str {
    PRECACHE_PREFIX
  }
}

impl fmt::Display for CacheNamespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name())
  }
}

/// `"{METHOD} {normalized url}"`, unique per namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  /// Build a key from a method and URL. The fragment is dropped; the url
  /// crate already lowercases scheme and host and strips default ports.
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", method.to_ascii_uppercase(), url))
  }

  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  /// Wrap a key read back from storage.
  pub fn from_raw(raw: String) -> Self {
    Self(raw)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A stored response. Never mutated; a newer fetch replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub resource_type: ResourceType,
  pub status: u16,
  pub headers: Headers,
  pub body: Bytes,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Capture a response, stamping its `date` header with `stored_at`.
  pub fn from_response(
    key: CacheKey,
    resource_type: ResourceType,
    response: &HttpResponse,
    stored_at: DateTime<Utc>,
  ) -> Self {
    let mut headers = response.headers.clone();
    headers.insert("date".to_string(), stored_at.to_rfc2822());

    Self {
      key,
      resource_type,
      status: response.status,
      headers,
      body: response.body.clone(),
      stored_at,
    }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.stored_at
  }

  pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
    self.age(now) < max_age
  }

  pub fn to_response(&self) -> HttpResponse {
    HttpResponse {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Sortable timestamp format used for every stored time.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// From cache, within max age
  CacheFresh,
  /// From cache, past max age (a revalidation may be running)
  CacheStale,
  /// Network failed, serving a cached entry
  Offline,
  /// Neither cache nor network could answer
  Fallback,
}

/// A response plus metadata about where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: HttpResponse,
  pub source: ResponseSource,
}

impl Served {
  pub fn network(response: HttpResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(entry: &CacheEntry, is_stale: bool) -> Self {
    Self {
      response: entry.to_response(),
      source: if is_stale {
        ResponseSource::CacheStale
      } else {
        ResponseSource::CacheFresh
      },
    }
  }

  pub fn offline(entry: &CacheEntry) -> Self {
    Self {
      response: entry.to_response(),
      source: ResponseSource::Offline,
    }
  }

  pub fn fallback(response: HttpResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Fallback,
    }
  }
}
