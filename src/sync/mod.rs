//! Background synchronization of writes made while offline.
//!
//! Failed writes are appended to a durable log. A connectivity change,
//! a periodic wake, or an explicit request drains the log sequentially;
//! each operation is removed on a 2xx response, retried otherwise, and
//! dead-lettered once its retries are exhausted.

mod log;
mod processor;
mod trigger;

pub use log::{NewOperation, SyncLog, SyncOperation, API_REQUEST};
pub use processor::{DrainReport, SyncProcessor};
pub use trigger::{Connectivity, SchedulerHandle, SyncScheduler, SyncTrigger, WakeRegistration};
