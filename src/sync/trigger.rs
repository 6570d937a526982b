//! Wake-up signals for the sync processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::processor::{DrainReport, SyncProcessor};

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Network came back after being offline
  ConnectivityRestored,
  /// Periodic wake registered when work was queued
  PeriodicWake,
  /// Explicit request from the host application
  Manual,
}

/// Online/offline state shared between the engine and the scheduler.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|current| {
      let changed = *current != online;
      *current = online;
      changed
    });
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Periodic wake registration, armed when an operation is queued.
#[derive(Clone, Default)]
pub struct WakeRegistration {
  armed: Arc<AtomicBool>,
}

impl WakeRegistration {
  pub fn register(&self) {
    self.armed.store(true, Ordering::SeqCst);
  }

  pub fn is_registered(&self) -> bool {
    self.armed.load(Ordering::SeqCst)
  }

  fn clear(&self) {
    self.armed.store(false, Ordering::SeqCst);
  }
}

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
  tx: mpsc::UnboundedSender<SyncTrigger>,
  reports: watch::Receiver<Option<DrainReport>>,
  task: JoinHandle<()>,
}

impl SchedulerHandle {
  /// Ask for a drain. Returns false once the scheduler has stopped.
  pub fn trigger(&self, trigger: SyncTrigger) -> bool {
    self.tx.send(trigger).is_ok()
  }

  /// Report of the most recent drain.
  pub fn reports(&self) -> watch::Receiver<Option<DrainReport>> {
    self.reports.clone()
  }

  pub fn shutdown(self) {
    self.task.abort();
  }
}

/// Runs the processor whenever a trigger fires.
///
/// Triggers are handled one at a time by a single task, so drains it
/// starts never overlap.
pub struct SyncScheduler {
  processor: Arc<SyncProcessor>,
  connectivity: Connectivity,
  wake: WakeRegistration,
  interval: Duration,
}

impl SyncScheduler {
  pub fn new(
    processor: Arc<SyncProcessor>,
    connectivity: Connectivity,
    wake: WakeRegistration,
    interval: Duration,
  ) -> Self {
    Self {
      processor,
      connectivity,
      wake,
      interval,
    }
  }

  pub fn spawn(self) -> SchedulerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (report_tx, reports) = watch::channel(None);
    let mut online = self.connectivity.subscribe();
    let mut was_online = *online.borrow_and_update();

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        let trigger = tokio::select! {
          msg = rx.recv() => match msg {
            Some(trigger) => trigger,
            None => break,
          },
          changed = online.changed() => {
            if changed.is_err() {
              break;
            }
            let now_online = *online.borrow_and_update();
            let restored = now_online && !was_online;
            was_online = now_online;
            if !restored {
              continue;
            }
            SyncTrigger::ConnectivityRestored
          }
          _ = ticker.tick() => {
            if !self.wake.is_registered() || !self.connectivity.is_online() {
              continue;
            }
            SyncTrigger::PeriodicWake
          }
        };

        if let Some(report) = self.processor.trigger(trigger).await {
          let _ = report_tx.send(Some(report));
        }

        if trigger == SyncTrigger::PeriodicWake {
          match self.processor.log().counts() {
            Ok((0, _)) => {
              debug!("sync log drained, clearing periodic wake");
              self.wake.clear();
            }
            Ok(_) => {}
            Err(e) => warn!("failed to inspect sync log: {}", e),
          }
        }
      }
    });

    SchedulerHandle { tx, reports, task }
  }
}
