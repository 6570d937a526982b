//! HTTP response caching for offline support.
//!
//! This module provides:
//! - Classification of request paths into page/api/asset/image resources
//! - A namespaced, persistent response store (SQLite)
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - Fallback responses when neither cache nor network can answer

mod classify;
mod entry;
mod fallback;
mod storage;
mod strategy;

pub use classify::{classify, Classifier, ResourceType};
pub use entry::{CacheEntry, CacheKey, CacheNamespace, ResponseSource, Served};
pub use fallback::{network_error, placeholder_image, FallbackProvider, NETWORK_ERROR_STATUS};
pub use storage::{CacheStore, EvictionPolicy, NoopStore, SqliteCacheStore};
pub use strategy::{Router, Strategy};

pub(crate) use entry::{format_timestamp, parse_timestamp};
