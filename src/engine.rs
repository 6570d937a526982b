//! The caching engine: one constructed owner of the cache store, the sync
//! log, and everything that serves requests from them.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheEntry, CacheKey, CacheNamespace, CacheStore, Classifier, EvictionPolicy, FallbackProvider,
  NoopStore, Router, Served, SqliteCacheStore,
};
use crate::config::Config;
use crate::control::{ControlClient, ControlHandler};
use crate::db::Database;
use crate::net::{Fetcher, HttpRequest, HttpResponse, Origin, ReqwestFetcher};
use crate::sync::{
  Connectivity, DrainReport, NewOperation, SchedulerHandle, SyncLog, SyncOperation, SyncProcessor,
  SyncScheduler, WakeRegistration,
};

/// Result of submitting a state-changing request.
#[derive(Debug)]
pub enum WriteOutcome {
  /// The server answered (with any status)
  Sent(HttpResponse),
  /// The network was unavailable; the write was queued for replay
  Queued(SyncOperation),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct InstallReport {
  pub cached: usize,
  pub failed: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ActivateReport {
  pub removed_namespaces: Vec<String>,
  pub evicted: usize,
}

/// Intercepts requests, serves them per caching policy, queues failed
/// writes and replays them. Create one per process (or per test).
pub struct CachingEngine {
  config: Config,
  origin: Origin,
  store: Arc<dyn CacheStore>,
  log: SyncLog,
  fetcher: Arc<dyn Fetcher>,
  router: Router,
  processor: Arc<SyncProcessor>,
  connectivity: Connectivity,
  wake: WakeRegistration,
}

impl CachingEngine {
  pub fn new(
    config: Config,
    store: Arc<dyn CacheStore>,
    log: SyncLog,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let origin = Origin::parse(&config.origin)?;
    let precache = CacheNamespace::Precache(config.cache.version);

    let offline_page = CacheKey::get(&origin.resolve(&config.cache.offline_page)?);
    let fallback = FallbackProvider::new(store.clone(), offline_page, precache);
    let router = Router::new(
      store.clone(),
      fetcher.clone(),
      Classifier::new(&config.api_prefix),
      config.cache.max_age,
      fallback,
      precache,
    );
    let processor = Arc::new(SyncProcessor::new(
      log.clone(),
      fetcher.clone(),
      config.sync.max_retries,
    ));

    Ok(Self {
      config,
      origin,
      store,
      log,
      fetcher,
      router,
      processor,
      connectivity: Connectivity::new(true),
      wake: WakeRegistration::default(),
    })
  }

  /// Build an engine backed by the configured SQLite database and reqwest.
  pub fn open(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(&config.database_path()?)?);
    let store: Arc<dyn CacheStore> = if config.cache.enabled {
      Arc::new(SqliteCacheStore::new(db.clone()))
    } else {
      Arc::new(NoopStore)
    };
    let log = SyncLog::new(db);
    let fetcher = Arc::new(ReqwestFetcher::new(&config.network)?);

    Self::new(config, store, log, fetcher)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn origin(&self) -> &Origin {
    &self.origin
  }

  pub fn store(&self) -> &Arc<dyn CacheStore> {
    &self.store
  }

  pub fn log(&self) -> &SyncLog {
    &self.log
  }

  fn precache(&self) -> CacheNamespace {
    CacheNamespace::Precache(self.config.cache.version)
  }

  /// Store the offline page and every precache URL, fetched concurrently.
  /// Best-effort per URL.
  pub async fn install(&self) -> InstallReport {
    let mut report = InstallReport::default();

    let targets = std::iter::once((CacheNamespace::Offline, &self.config.cache.offline_page))
      .chain(
        self
          .config
          .cache
          .precache
          .iter()
          .map(|url| (self.precache(), url)),
      );

    let results = futures::future::join_all(
      targets.map(|(ns, url)| async move { (url, self.install_one(&ns, url).await) }),
    )
    .await;

    for (url, result) in results {
      match result {
        Ok(()) => report.cached += 1,
        Err(e) => {
          warn!(url = %url, "install fetch failed: {}", e);
          report.failed.push(url.clone());
        }
      }
    }

    info!(
      cached = report.cached,
      failed = report.failed.len(),
      version = self.config.cache.version,
      "install complete"
    );
    report
  }

  async fn install_one(&self, ns: &CacheNamespace, url: &str) -> Result<()> {
    let url = self.origin.resolve(url)?;
    let request = HttpRequest::get(url.clone());
    let response = self.fetcher.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("Server responded with status {}", response.status));
    }

    let resource_type = self.router.classify(&request);
    let entry = CacheEntry::from_response(CacheKey::get(&url), resource_type, &response, Utc::now());
    self.store.put(ns, &entry)
  }

  /// Drop precaches of other versions and prune runtime namespaces.
  pub fn activate(&self) -> Result<ActivateReport> {
    let mut report = ActivateReport::default();
    let current = self.precache().name();

    for name in self.store.namespaces()?.into_keys() {
      if name.starts_with(CacheNamespace::precache_prefix()) && name != current {
        self.store.clear(&name)?;
        report.removed_namespaces.push(name);
      }
    }

    let max_age = self.config.cache.max_age;
    let longest = [max_age.page, max_age.api, max_age.asset, max_age.image]
      .into_iter()
      .max()
      .unwrap_or_default();
    let policy = EvictionPolicy {
      max_age: Some(Duration::seconds(longest as i64)),
      max_entries: Some(self.config.cache.max_entries),
    };
    for ns in [CacheNamespace::Runtime, CacheNamespace::Offline] {
      report.evicted += self.store.evict(&ns, &policy)?;
    }

    info!(
      removed = report.removed_namespaces.len(),
      evicted = report.evicted,
      "activate complete"
    );
    Ok(report)
  }

  /// Interception boundary. Same-origin requests go through the router;
  /// cross-origin ones pass straight through. Always yields a response.
  pub async fn handle_fetch(&self, request: &HttpRequest) -> Served {
    if self.origin.is_same_origin(&request.url) {
      return self.router.handle(request).await;
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => Served::network(response),
      Err(e) => {
        debug!(url = %request.url, "cross-origin request failed: {}", e);
        let resource_type = self.router.classify(request);
        Served::fallback(
          self
            .router
            .fallback()
            .respond(resource_type, request.accepts_html()),
        )
      }
    }
  }

  /// Send a state-changing request; queue it for replay if the network
  /// is unavailable.
  ///
  /// A transport failure marks the engine offline, which holds periodic
  /// replays until connectivity is restored. A completed exchange marks it
  /// online again.
  pub async fn submit_write(&self, request: &HttpRequest) -> Result<WriteOutcome> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.connectivity.set_online(true);
        Ok(WriteOutcome::Sent(response))
      }
      Err(e) => {
        info!(method = %request.method, url = %request.url, "write failed, queueing: {}", e);
        if e.is_transport() {
          self.connectivity.set_online(false);
        }
        let op = self.enqueue(NewOperation::api_request(request))?;
        Ok(WriteOutcome::Queued(op))
      }
    }
  }

  /// Append an operation to the sync log and register the periodic wake.
  pub fn enqueue(&self, op: NewOperation) -> Result<SyncOperation> {
    let op = self.log.append(op)?;
    self.wake.register();
    Ok(op)
  }

  /// Drain the sync log now.
  pub async fn sync_now(&self) -> DrainReport {
    self.processor.drain().await
  }

  /// Report a connectivity change; going back online wakes the scheduler.
  pub fn set_online(&self, online: bool) {
    self.connectivity.set_online(online);
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Start the background scheduler that drains on connectivity
  /// restoration and periodic wakes.
  pub fn start_scheduler(&self) -> SchedulerHandle {
    SyncScheduler::new(
      self.processor.clone(),
      self.connectivity.clone(),
      self.wake.clone(),
      self.config.sync.periodic_wake(),
    )
    .spawn()
  }

  /// Start the control channel and return a client for it.
  pub fn control(&self) -> ControlClient {
    ControlHandler::new(
      self.store.clone(),
      self.log.clone(),
      self.router.clone(),
      self.origin.clone(),
    )
    .spawn()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResourceType, ResponseSource, NETWORK_ERROR_STATUS};
  use crate::net::mock::MockFetcher;
  use std::time::Duration as StdDuration;

  const ORIGIN: &str = "https://app.example.com";

  struct Fixture {
    store: Arc<SqliteCacheStore>,
    fetcher: Arc<MockFetcher>,
    engine: CachingEngine,
  }

  fn fixture_with(config: Config) -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = Arc::new(SqliteCacheStore::new(db.clone()));
    let fetcher = Arc::new(MockFetcher::new());
    let engine =
      CachingEngine::new(config, store.clone(), SyncLog::new(db), fetcher.clone()).unwrap();
    Fixture {
      store,
      fetcher,
      engine,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(Config {
      origin: ORIGIN.to_string(),
      ..Config::default()
    })
  }

  fn url(path: &str) -> url::Url {
    Origin::parse(ORIGIN).unwrap().resolve(path).unwrap()
  }

  fn post(path: &str, body: &str) -> HttpRequest {
    HttpRequest::new("POST", url(path))
      .with_header("content-type", "application/json")
      .with_body(body.to_string())
  }

  #[tokio::test]
  async fn test_stale_image_is_refetched_and_overwritten() {
    let f = fixture();
    let key = CacheKey::get(&url("/img/site.png"));
    let stale = CacheEntry::from_response(
      key.clone(),
      ResourceType::Image,
      &HttpResponse::new(200, "old"),
      Utc::now() - Duration::days(40),
    );
    f.store.put(&CacheNamespace::Runtime, &stale).unwrap();
    f.fetcher.respond(url("/img/site.png").as_str(), 200, "fresh");

    let served = f.engine.handle_fetch(&HttpRequest::get(url("/img/site.png"))).await;

    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(f.fetcher.call_count(), 1);
    let stored = f.store.get(&CacheNamespace::Runtime, &key).unwrap();
    assert_eq!(&stored.body[..], b"fresh");
    assert!(stored.stored_at > stale.stored_at + Duration::days(39));
  }

  #[tokio::test]
  async fn test_offline_writes_replay_in_order_once_online() {
    let f = fixture();
    f.fetcher.set_offline(true);

    for (path, body) in [("/api/projects", "a"), ("/api/projects/1", "b"), ("/api/costs", "c")] {
      let outcome = f.engine.submit_write(&post(path, body)).await.unwrap();
      assert!(matches!(outcome, WriteOutcome::Queued(_)));
      f.fetcher.respond(url(path).as_str(), 200, "");
    }
    assert_eq!(f.engine.log().len().unwrap(), 3);
    assert_eq!(f.fetcher.call_count(), 3);

    f.engine.set_online(false);
    let scheduler = f.engine.start_scheduler();
    let mut reports = scheduler.reports();
    f.fetcher.set_offline(false);
    f.engine.set_online(true);

    tokio::time::timeout(StdDuration::from_secs(2), reports.changed())
      .await
      .unwrap()
      .unwrap();

    assert!(f.engine.log().is_empty().unwrap());
    let replayed: Vec<(String, String)> = f.fetcher.calls()[3..]
      .iter()
      .map(|r| {
        (
          r.url.path().to_string(),
          String::from_utf8_lossy(r.body.as_deref().unwrap_or_default()).to_string(),
        )
      })
      .collect();
    assert_eq!(
      replayed,
      vec![
        ("/api/projects".to_string(), "a".to_string()),
        ("/api/projects/1".to_string(), "b".to_string()),
        ("/api/costs".to_string(), "c".to_string()),
      ]
    );
    assert_eq!(f.fetcher.max_in_flight(), 1);
    scheduler.shutdown();
  }

  #[tokio::test]
  async fn test_write_survives_outage_longer_than_retry_budget() {
    let mut config = Config {
      origin: ORIGIN.to_string(),
      ..Config::default()
    };
    config.sync.periodic_wake_secs = 1;
    let f = fixture_with(config);
    let scheduler = f.engine.start_scheduler();
    let mut reports = scheduler.reports();

    f.fetcher.set_offline(true);
    let outcome = f.engine.submit_write(&post("/api/a", "{}")).await.unwrap();
    assert!(matches!(outcome, WriteOutcome::Queued(_)));
    assert!(!f.engine.is_online());

    // Several wake periods pass while the network is down.
    tokio::time::sleep(StdDuration::from_millis(3600)).await;
    assert_eq!(f.fetcher.call_count(), 1);
    assert_eq!(f.engine.log().counts().unwrap(), (1, 0));

    f.fetcher.respond(url("/api/a").as_str(), 200, "");
    f.fetcher.set_offline(false);
    f.engine.set_online(true);

    tokio::time::timeout(StdDuration::from_secs(2), reports.changed())
      .await
      .unwrap()
      .unwrap();

    assert_eq!(f.engine.log().counts().unwrap(), (0, 0));
    assert_eq!(f.fetcher.call_count(), 2);
    scheduler.shutdown();
  }

  #[tokio::test]
  async fn test_server_response_is_not_queued() {
    let f = fixture();
    f.fetcher.respond(url("/api/projects").as_str(), 400, "bad");

    let outcome = f.engine.submit_write(&post("/api/projects", "{}")).await.unwrap();
    match outcome {
      WriteOutcome::Sent(response) => assert_eq!(response.status, 400),
      WriteOutcome::Queued(_) => panic!("a completed exchange must not be queued"),
    }
    assert!(f.engine.log().is_empty().unwrap());
    assert!(f.engine.is_online());
  }

  #[tokio::test]
  async fn test_stats_after_mixed_inserts() {
    let f = fixture();
    f.fetcher.respond(url("/").as_str(), 200, "home");
    f.fetcher.respond(url("/projects").as_str(), 200, "projects");
    f.fetcher.respond(url("/logo.png").as_str(), 200, "png");

    for path in ["/", "/projects", "/logo.png"] {
      f.engine.handle_fetch(&HttpRequest::get(url(path))).await;
    }

    let stats = f.engine.control().stats().await.unwrap();
    assert_eq!(stats.resources.get(&ResourceType::Page), Some(&2));
    assert_eq!(stats.resources.get(&ResourceType::Image), Some(&1));
    assert_eq!(stats.resources.get(&ResourceType::Api), None);
  }

  #[tokio::test]
  async fn test_api_500_yields_generic_error_response() {
    let f = fixture();
    f.fetcher.respond(url("/api/employees").as_str(), 500, "");

    let served = f
      .engine
      .handle_fetch(&HttpRequest::get(url("/api/employees")))
      .await;
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.status, NETWORK_ERROR_STATUS);
    assert_eq!(&served.response.body[..], b"Network error");
  }

  #[tokio::test]
  async fn test_visited_page_loads_offline_and_new_page_gets_offline_page() {
    let f = fixture();
    f.fetcher
      .respond(url("/offline.html").as_str(), 200, "<h1>Offline</h1>");
    f.fetcher.respond(url("/dashboard").as_str(), 200, "<h1>Dash</h1>");

    f.engine.install().await;
    f.engine.handle_fetch(&HttpRequest::get(url("/dashboard"))).await;

    f.fetcher.set_offline(true);
    let visited = f.engine.handle_fetch(&HttpRequest::get(url("/dashboard"))).await;
    assert_eq!(&visited.response.body[..], b"<h1>Dash</h1>");

    let unseen = f.engine.handle_fetch(&HttpRequest::get(url("/reports"))).await;
    assert_eq!(unseen.source, ResponseSource::Fallback);
    assert_eq!(&unseen.response.body[..], b"<h1>Offline</h1>");
  }

  #[tokio::test]
  async fn test_cross_origin_requests_are_not_cached() {
    let f = fixture();
    f.fetcher
      .respond("https://cdn.example.net/lib.js", 200, "lib");

    let request = HttpRequest::get(url::Url::parse("https://cdn.example.net/lib.js").unwrap());
    let served = f.engine.handle_fetch(&request).await;
    assert_eq!(&served.response.body[..], b"lib");
    assert!(f.store.namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_and_activate_drop_old_versions() {
    let mut config = Config {
      origin: ORIGIN.to_string(),
      ..Config::default()
    };
    config.cache.precache = vec!["/app.js".to_string(), "/missing.css".to_string()];
    config.cache.version = 2;
    let f = fixture_with(config);
    f.fetcher.respond(url("/app.js").as_str(), 200, "js");
    f.fetcher.respond(url("/offline.html").as_str(), 200, "offline");

    let old = CacheEntry::from_response(
      CacheKey::get(&url("/app.js")),
      ResourceType::Asset,
      &HttpResponse::new(200, "v1"),
      Utc::now(),
    );
    f.store.put(&CacheNamespace::Precache(1), &old).unwrap();

    let report = f.engine.install().await;
    assert_eq!(report.cached, 2);
    assert_eq!(report.failed, vec!["/missing.css".to_string()]);

    let activated = f.engine.activate().unwrap();
    assert_eq!(activated.removed_namespaces, vec!["precache-v1".to_string()]);

    let namespaces = f.store.namespaces().unwrap();
    assert_eq!(namespaces.get("precache-v2"), Some(&1));
    assert_eq!(namespaces.get("offline"), Some(&1));
    assert!(!namespaces.contains_key("precache-v1"));

    // Precached asset is served without the network
    f.fetcher.set_offline(true);
    let served = f.engine.handle_fetch(&HttpRequest::get(url("/app.js"))).await;
    assert_eq!(served.source, ResponseSource::CacheFresh);
    assert_eq!(&served.response.body[..], b"js");
  }

  #[tokio::test]
  async fn test_disabled_cache_always_goes_to_network() {
    let fetcher = Arc::new(MockFetcher::new());
    let db = Arc::new(Database::open_in_memory().unwrap());
    let engine = CachingEngine::new(
      Config {
        origin: ORIGIN.to_string(),
        ..Config::default()
      },
      Arc::new(NoopStore),
      SyncLog::new(db),
      fetcher.clone(),
    )
    .unwrap();
    fetcher.respond(url("/app.js").as_str(), 200, "js");

    engine.handle_fetch(&HttpRequest::get(url("/app.js"))).await;
    engine.handle_fetch(&HttpRequest::get(url("/app.js"))).await;
    assert_eq!(fetcher.call_count(), 2);
  }
}
