//! Scripted in-process network for tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use super::{FetchError, Fetcher, HttpRequest, HttpResponse};

/// Records every request and answers from a per-URL table.
///
/// Unknown URLs answer 404 while online; every request fails with
/// [`FetchError::Unreachable`] while offline.
#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, HttpResponse>>,
  calls: Mutex<Vec<HttpRequest>>,
  offline: AtomicBool,
  delay: Mutex<Option<Duration>>,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
  called: Notify,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer `url` with `status` and `body` from now on.
  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.respond_with(url, HttpResponse::new(status, Bytes::from(body.to_string())));
  }

  pub fn respond_with(&self, url: &str, response: HttpResponse) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Hold every request open for `delay` before answering.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<HttpRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Highest number of requests observed in flight at once.
  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  /// Wait until at least `n` requests were made, or give up after a second.
  pub async fn wait_for_calls(&self, n: usize) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
      let notified = self.called.notified();
      if self.call_count() >= n {
        return true;
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return self.call_count() >= n;
      }
    }
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
    let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(current, Ordering::SeqCst);

    self.calls.lock().unwrap().push(request.clone());
    self.called.notify_waiters();

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let result = if self.offline.load(Ordering::SeqCst) {
      Err(FetchError::Unreachable("simulated offline".to_string()))
    } else {
      Ok(
        self
          .routes
          .lock()
          .unwrap()
          .get(request.url.as_str())
          .cloned()
          .unwrap_or_else(|| HttpResponse::new(404, Bytes::new())),
      )
    };

    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    result
  }
}
