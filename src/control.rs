//! Message protocol between foreground callers and the engine.
//!
//! Each request travels with its own reply port (a oneshot sender), so
//! responses are correlated to callers rather than broadcast. The
//! `CACHE_*` messages address the application-data store, which is
//! separate from the HTTP response namespaces.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, ResourceType, Router};
use crate::net::{HttpRequest, Origin};
use crate::sync::SyncLog;

/// Requests accepted on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlRequest {
  CacheGet {
    key: String,
  },
  CacheSet {
    key: String,
    data: Value,
  },
  CacheDelete {
    key: String,
  },
  CacheClear,
  GetCacheStats,
  /// Fire-and-forget: acknowledged at once, completion reported as an event
  Prefetch {
    #[serde(rename = "data")]
    urls: Vec<String>,
  },
}

/// Reply sent on a request's port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
  Stats { stats: CacheStats },
  Data { data: Value },
}

impl ControlResponse {
  pub fn into_data(self) -> Result<Value> {
    match self {
      Self::Data { data } => Ok(data),
      Self::Stats { .. } => Err(eyre!("Expected data response, got stats")),
    }
  }

  pub fn into_stats(self) -> Result<CacheStats> {
    match self {
      Self::Stats { stats } => Ok(stats),
      Self::Data { .. } => Err(eyre!("Expected stats response, got data")),
    }
  }
}

/// Aggregate cache and queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  /// Entries per response namespace
  pub namespaces: BTreeMap<String, usize>,
  /// Entries per resource type across namespaces
  pub resources: BTreeMap<ResourceType, usize>,
  /// Values in the application-data store
  pub app_data: usize,
  pub pending_sync: usize,
  pub dead_letters: usize,
}

/// Asynchronous notifications from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlEvent {
  PrefetchComplete {
    requested: usize,
    cached: usize,
    failed: usize,
  },
}

struct Envelope {
  request: ControlRequest,
  reply: oneshot::Sender<ControlResponse>,
}

/// Serves control requests against the engine's stores.
#[derive(Clone)]
pub struct ControlHandler {
  store: Arc<dyn CacheStore>,
  log: SyncLog,
  router: Router,
  origin: Origin,
  events: broadcast::Sender<ControlEvent>,
}

impl ControlHandler {
  pub fn new(store: Arc<dyn CacheStore>, log: SyncLog, router: Router, origin: Origin) -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      store,
      log,
      router,
      origin,
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
    self.events.subscribe()
  }

  /// Handle one request. Storage errors are reported in the reply, never
  /// raised.
  pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
    match request {
      ControlRequest::CacheGet { key } => ControlResponse::Data {
        data: self.store.get_data(&key).unwrap_or(Value::Null),
      },
      ControlRequest::CacheSet { key, data } => {
        ControlResponse::Data {
          data: outcome(self.store.set_data(&key, &data).map(|()| json!(true))),
        }
      }
      ControlRequest::CacheDelete { key } => ControlResponse::Data {
        data: outcome(self.store.delete_data(&key).map(Value::Bool)),
      },
      ControlRequest::CacheClear => ControlResponse::Data {
        data: outcome(self.store.clear_data().map(|n| json!(n))),
      },
      ControlRequest::GetCacheStats => ControlResponse::Stats {
        stats: self.stats(),
      },
      ControlRequest::Prefetch { urls } => {
        let requested = urls.len();
        let handler = self.clone();
        tokio::spawn(async move { handler.prefetch(urls).await });
        ControlResponse::Data {
          data: json!({ "queued": requested }),
        }
      }
    }
  }

  pub fn stats(&self) -> CacheStats {
    let (pending_sync, dead_letters) = self.log.counts().unwrap_or_else(|e| {
      warn!("failed to count sync log: {}", e);
      (0, 0)
    });

    CacheStats {
      namespaces: self.store.namespaces().unwrap_or_default(),
      resources: self.store.count_by_type().unwrap_or_default(),
      app_data: self.store.data_len().unwrap_or_default(),
      pending_sync,
      dead_letters,
    }
  }

  /// Fetch and store each URL in turn. Failures are logged and skipped.
  async fn prefetch(&self, urls: Vec<String>) -> ControlEvent {
    let requested = urls.len();
    let mut cached = 0;

    for url in urls {
      let resolved = match self.origin.resolve(&url) {
        Ok(resolved) => resolved,
        Err(e) => {
          warn!(url = %url, "skipping prefetch: {}", e);
          continue;
        }
      };

      match self.router.prefetch(&HttpRequest::get(resolved)).await {
        Ok(_) => cached += 1,
        Err(e) => warn!(url = %url, "prefetch failed: {}", e),
      }
    }

    let event = ControlEvent::PrefetchComplete {
      requested,
      cached,
      failed: requested - cached,
    };
    info!(requested, cached, "prefetch complete");
    // No subscribers is fine
    let _ = self.events.send(event.clone());
    event
  }

  /// Start serving requests on a background task.
  pub fn spawn(self) -> ControlClient {
    let (tx, mut rx) = mpsc::channel::<Envelope>(64);
    let events = self.events.clone();

    tokio::spawn(async move {
      while let Some(Envelope { request, reply }) = rx.recv().await {
        debug!(?request, "control request");
        let response = self.handle(request).await;
        if reply.send(response).is_err() {
          debug!("control caller went away before the reply");
        }
      }
    });

    ControlClient { tx, events }
  }
}

fn outcome(result: Result<Value>) -> Value {
  match result {
    Ok(value) => value,
    Err(e) => {
      warn!("control request failed: {}", e);
      json!({ "error": e.to_string() })
    }
  }
}

/// Foreground side of the control channel.
#[derive(Clone)]
pub struct ControlClient {
  tx: mpsc::Sender<Envelope>,
  events: broadcast::Sender<ControlEvent>,
}

impl ControlClient {
  /// Send a request and wait for its reply.
  pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse> {
    let (reply, response) = oneshot::channel();
    self
      .tx
      .send(Envelope { request, reply })
      .await
      .map_err(|_| eyre!("Control channel closed"))?;

    response
      .await
      .map_err(|_| eyre!("Control channel dropped the reply"))
  }

  /// Handle a JSON-encoded request and return the JSON-encoded reply.
  pub async fn request_json(&self, message: &str) -> Result<String> {
    let request: ControlRequest = serde_json::from_str(message)
      .map_err(|e| eyre!("Invalid control message: {}", e))?;
    let response = self.request(request).await?;
    Ok(serde_json::to_string(&response)?)
  }

  pub async fn get(&self, key: &str) -> Result<Option<Value>> {
    let data = self
      .request(ControlRequest::CacheGet {
        key: key.to_string(),
      })
      .await?
      .into_data()?;
    Ok((!data.is_null()).then_some(data))
  }

  pub async fn set(&self, key: &str, value: Value) -> Result<()> {
    let data = self
      .request(ControlRequest::CacheSet {
        key: key.to_string(),
        data: value,
      })
      .await?
      .into_data()?;
    check_error(data).map(|_| ())
  }

  pub async fn delete(&self, key: &str) -> Result<bool> {
    let data = self
      .request(ControlRequest::CacheDelete {
        key: key.to_string(),
      })
      .await?
      .into_data()?;
    Ok(check_error(data)?.as_bool().unwrap_or(false))
  }

  pub async fn clear(&self) -> Result<usize> {
    let data = self.request(ControlRequest::CacheClear).await?.into_data()?;
    Ok(check_error(data)?.as_u64().unwrap_or(0) as usize)
  }

  pub async fn stats(&self) -> Result<CacheStats> {
    self.request(ControlRequest::GetCacheStats).await?.into_stats()
  }

  /// Queue a prefetch; completion arrives on [`ControlClient::events`].
  pub async fn prefetch(&self, urls: Vec<String>) -> Result<()> {
    self.request(ControlRequest::Prefetch { urls }).await?;
    Ok(())
  }

  pub fn events(&self) -> broadcast::Receiver<ControlEvent> {
    self.events.subscribe()
  }
}

fn check_error(data: Value) -> Result<Value> {
  match data.get("error").and_then(Value::as_str) {
    Some(message) => Err(eyre!("{}", message)),
    None => Ok(data),
  }
}
