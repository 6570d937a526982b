//! Strategy router that orchestrates caching logic with network fetching.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MaxAgeConfig;
use crate::net::{FetchError, Fetcher, HttpRequest, HttpResponse};

use super::classify::{Classifier, ResourceType};
use super::entry::{CacheEntry, CacheKey, CacheNamespace, Served};
use super::fallback::FallbackProvider;
use super::storage::CacheStore;

/// Caching algorithm applied to a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl Strategy {
  pub fn for_type(resource_type: ResourceType) -> Self {
    match resource_type {
      ResourceType::Asset | ResourceType::Image => Self::CacheFirst,
      ResourceType::Api => Self::NetworkFirst,
      ResourceType::Page => Self::StaleWhileRevalidate,
    }
  }
}

/// Serves GET requests from the cache and/or the network.
///
/// Runtime responses land in the runtime namespace; lookups also consult
/// the current precache.
#[derive(Clone)]
pub struct Router {
  store: Arc<dyn CacheStore>,
  fetcher: Arc<dyn Fetcher>,
  classifier: Classifier,
  max_age: MaxAgeConfig,
  fallback: FallbackProvider,
  precache: CacheNamespace,
}

impl Router {
  pub fn new(
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    classifier: Classifier,
    max_age: MaxAgeConfig,
    fallback: FallbackProvider,
    precache: CacheNamespace,
  ) -> Self {
    Self {
      store,
      fetcher,
      classifier,
      max_age,
      fallback,
      precache,
    }
  }

  pub fn classify(&self, request: &HttpRequest) -> ResourceType {
    self.classifier.classify(request.url.path())
  }

  pub fn fallback(&self) -> &FallbackProvider {
    &self.fallback
  }

  /// Serve a request. Never fails: the fallback provider answers whatever
  /// neither cache nor network can.
  pub async fn handle(&self, request: &HttpRequest) -> Served {
    let resource_type = self.classify(request);

    if !request.is_read_only() {
      return match self.fetcher.fetch(request).await {
        Ok(response) => Served::network(response),
        Err(e) => {
          debug!(method = %request.method, url = %request.url, "pass-through failed: {}", e);
          Served::fallback(self.fallback.respond(resource_type, false))
        }
      };
    }

    let key = CacheKey::new(&request.method, &request.url);
    match Strategy::for_type(resource_type) {
      Strategy::CacheFirst => self.cache_first(request, key, resource_type).await,
      Strategy::NetworkFirst => self.network_first(request, key, resource_type).await,
      Strategy::StaleWhileRevalidate => {
        self
          .stale_while_revalidate(request, key, resource_type)
          .await
      }
    }
  }

  /// Fetch and store into the runtime namespace regardless of strategy.
  pub async fn prefetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
    let key = CacheKey::new(&request.method, &request.url);
    let resource_type = self.classify(request);
    self.fetch_and_store(request, &key, resource_type).await
  }

  /// 1. Fresh cache hit: return without touching the network
  /// 2. Otherwise fetch; store and return a successful response
  /// 3. On network failure, return the stale entry if any, else fall back
  async fn cache_first(
    &self,
    request: &HttpRequest,
    key: CacheKey,
    resource_type: ResourceType,
  ) -> Served {
    let cached = self.cached(&key);

    if let Some(entry) = &cached {
      if self.is_fresh(entry, resource_type) {
        debug!(key = %key, "cache hit");
        return Served::from_cache(entry, false);
      }
    }

    match self.fetch_and_store(request, &key, resource_type).await {
      Ok(response) => Served::network(response),
      Err(e) => {
        debug!(key = %key, "network failed: {}", e);
        match cached {
          Some(entry) => Served::offline(&entry),
          None => Served::fallback(self.fallback.respond(resource_type, request.accepts_html())),
        }
      }
    }
  }

  /// Network first; a fresh cached entry covers a network failure.
  async fn network_first(
    &self,
    request: &HttpRequest,
    key: CacheKey,
    resource_type: ResourceType,
  ) -> Served {
    match self.fetch_and_store(request, &key, resource_type).await {
      Ok(response) => Served::network(response),
      Err(e) => {
        debug!(key = %key, "network failed: {}", e);
        match self.cached(&key) {
          Some(entry) if self.is_fresh(&entry, resource_type) => Served::offline(&entry),
          _ => Served::fallback(self.fallback.respond(resource_type, request.accepts_html())),
        }
      }
    }
  }

  /// Any cached entry is returned at once and one detached refresh is
  /// spawned. The refresh is best-effort: its only effect is the store
  /// write, observable on the next read. Without an entry the network
  /// is awaited.
  async fn stale_while_revalidate(
    &self,
    request: &HttpRequest,
    key: CacheKey,
    resource_type: ResourceType,
  ) -> Served {
    if let Some(entry) = self.cached(&key) {
      let is_stale = !self.is_fresh(&entry, resource_type);
      debug!(key = %key, is_stale, "serving cached page, revalidating");

      let router = self.clone();
      let request = request.clone();
      tokio::spawn(async move {
        if let Err(e) = router.fetch_and_store(&request, &key, resource_type).await {
          debug!(key = %key, "background revalidation failed: {}", e);
        }
      });

      return Served::from_cache(&entry, is_stale);
    }

    match self.fetch_and_store(request, &key, resource_type).await {
      Ok(response) => Served::network(response),
      Err(e) => {
        debug!(key = %key, "network failed: {}", e);
        Served::fallback(self.fallback.respond(resource_type, true))
      }
    }
  }

  /// Fetch; a 2xx response is stored (a clone shares the body) and
  /// returned, anything else is a failure and never cached.
  async fn fetch_and_store(
    &self,
    request: &HttpRequest,
    key: &CacheKey,
    resource_type: ResourceType,
  ) -> Result<HttpResponse, FetchError> {
    let response = self.fetcher.fetch(request).await?;
    if !response.is_success() {
      return Err(FetchError::Status(response.status));
    }

    let entry = CacheEntry::from_response(key.clone(), resource_type, &response, Utc::now());
    if let Err(e) = self.store.put(&CacheNamespace::Runtime, &entry) {
      warn!(key = %key, "failed to store response: {}", e);
    }

    Ok(response)
  }

  fn cached(&self, key: &CacheKey) -> Option<CacheEntry> {
    self
      .store
      .get(&CacheNamespace::Runtime, key)
      .or_else(|| self.store.get(&self.precache, key))
  }

  fn is_fresh(&self, entry: &CacheEntry, resource_type: ResourceType) -> bool {
    entry.is_fresh(self.max_age.for_type(resource_type), Utc::now())
  }
}
