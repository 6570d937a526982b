//! Offline-first HTTP caching and background sync.
//!
//! A [`CachingEngine`] intercepts requests and serves them from a
//! persistent response cache according to per-resource policies, queues
//! writes that fail while offline, and replays them once connectivity
//! returns. Foreground code talks to it through the [`control`] channel.

pub mod cache;
pub mod config;
pub mod control;
pub mod db;
pub mod engine;
pub mod logging;
pub mod net;
pub mod notify;
pub mod sync;

pub use config::Config;
pub use engine::{CachingEngine, WriteOutcome};
