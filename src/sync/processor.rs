//! Replays the sync log against the network.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::net::{FetchError, Fetcher};

use super::log::{SyncLog, SyncOperation};
use super::trigger::SyncTrigger;

/// Outcome counts for one or more drain passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub retried: usize,
  pub dead_lettered: usize,
}

impl DrainReport {
  fn merge(self, other: DrainReport) -> Self {
    Self {
      attempted: self.attempted + other.attempted,
      succeeded: self.succeeded + other.succeeded,
      retried: self.retried + other.retried,
      dead_lettered: self.dead_lettered + other.dead_lettered,
    }
  }
}

/// Drains pending operations one at a time, oldest first.
///
/// Drains never overlap. A trigger arriving mid-drain is coalesced: the
/// running drain makes one more pass once it finishes.
pub struct SyncProcessor {
  log: SyncLog,
  fetcher: Arc<dyn Fetcher>,
  max_retries: u32,
  gate: Mutex<()>,
  rerun: AtomicBool,
}

impl SyncProcessor {
  pub fn new(log: SyncLog, fetcher: Arc<dyn Fetcher>, max_retries: u32) -> Self {
    Self {
      log,
      fetcher,
      max_retries: max_retries.max(1),
      gate: Mutex::new(()),
      rerun: AtomicBool::new(false),
    }
  }

  pub fn log(&self) -> &SyncLog {
    &self.log
  }

  /// Drain now, waiting for any running drain to finish first.
  pub async fn drain(&self) -> DrainReport {
    let guard = self.gate.lock().await;
    self.drain_locked(guard, SyncTrigger::Manual).await
  }

  /// Handle a trigger. Returns `None` when it was folded into a drain
  /// already in progress.
  pub async fn trigger(&self, trigger: SyncTrigger) -> Option<DrainReport> {
    let guard = match self.gate.try_lock() {
      Ok(guard) => guard,
      Err(_) => {
        self.rerun.store(true, Ordering::SeqCst);
        // The holder checks the flag after releasing; retry once in case it
        // released before the flag was set.
        match self.gate.try_lock() {
          Ok(guard) => guard,
          Err(_) => {
            debug!(?trigger, "drain in progress, coalescing trigger");
            return None;
          }
        }
      }
    };

    Some(self.drain_locked(guard, trigger).await)
  }

  /// Run passes until no trigger arrived during the last one.
  async fn drain_locked(
    &self,
    mut guard: MutexGuard<'_, ()>,
    trigger: SyncTrigger,
  ) -> DrainReport {
    let mut total = DrainReport::default();

    loop {
      self.rerun.store(false, Ordering::SeqCst);
      info!(?trigger, "draining sync log");
      total = total.merge(self.run_once().await);
      drop(guard);

      if !self.rerun.load(Ordering::SeqCst) {
        return total;
      }
      // Whoever holds the gate now starts a fresh pass and sees the new work.
      guard = match self.gate.try_lock() {
        Ok(guard) => guard,
        Err(_) => return total,
      };
    }
  }

  /// One sequential pass over every pending operation. Errors are isolated
  /// per operation and never abort the pass.
  async fn run_once(&self) -> DrainReport {
    let mut report = DrainReport::default();

    let pending = match self.log.pending() {
      Ok(pending) => pending,
      Err(e) => {
        warn!("failed to read sync log: {}", e);
        return report;
      }
    };

    for op in pending {
      report.attempted += 1;

      match self.replay(&op).await {
        Ok(()) => {
          debug!(id = op.id, url = %op.url, "sync operation succeeded");
          report.succeeded += 1;
          if let Err(e) = self.log.remove(op.id) {
            warn!(id = op.id, "failed to remove synced operation: {}", e);
          }
        }
        Err(e) => {
          let mut next = op.with_retry();
          if next.retry_count >= self.max_retries {
            warn!(
              id = op.id,
              url = %op.url,
              attempts = next.retry_count,
              "sync operation dead-lettered: {}",
              e
            );
            next = next.into_dead_letter();
            report.dead_lettered += 1;
          } else {
            debug!(id = op.id, attempts = next.retry_count, "sync operation failed: {}", e);
            report.retried += 1;
          }

          if let Err(e) = self.log.replace(&next) {
            warn!(id = op.id, "failed to persist retry state: {}", e);
          }
        }
      }
    }

    if report.attempted > 0 {
      info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        retried = report.retried,
        dead_lettered = report.dead_lettered,
        "sync drain finished"
      );
    }

    report
  }

  async fn replay(&self, op: &SyncOperation) -> Result<(), FetchError> {
    let request = op
      .to_request()
      .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

    let response = self.fetcher.fetch(&request).await?;
    if response.is_success() {
      Ok(())
    } else {
      Err(FetchError::Status(response.status))
    }
  }
}
