//! Degraded responses for requests neither cache nor network can satisfy.

use std::sync::Arc;

use crate::net::HttpResponse;

use super::classify::ResourceType;
use super::entry::{CacheKey, CacheNamespace};
use super::storage::CacheStore;

/// Status used for the generic network error, as a client-side timeout.
pub const NETWORK_ERROR_STATUS: u16 = 408;

const FALLBACK_HEADER: &str = "x-harbor-fallback";

const BUILTIN_OFFLINE_PAGE: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1>\
<p>This page has not been saved for offline use. It will load once the connection is back.</p>\
</body></html>";

const PLACEHOLDER_SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"200\" height=\"150\" viewBox=\"0 0 200 150\">\
<rect width=\"200\" height=\"150\" fill=\"#e5e7eb\"/>\
<text x=\"100\" y=\"80\" font-family=\"sans-serif\" font-size=\"14\" text-anchor=\"middle\" fill=\"#6b7280\">Offline</text>\
</svg>";

/// Terminal handler: always produces a response.
#[derive(Clone)]
pub struct FallbackProvider {
  store: Arc<dyn CacheStore>,
  offline_page: CacheKey,
  precache: CacheNamespace,
}

impl FallbackProvider {
  pub fn new(store: Arc<dyn CacheStore>, offline_page: CacheKey, precache: CacheNamespace) -> Self {
    Self {
      store,
      offline_page,
      precache,
    }
  }

  /// Response for a failed request of the given type.
  pub fn respond(&self, resource_type: ResourceType, wants_document: bool) -> HttpResponse {
    if resource_type == ResourceType::Page || wants_document {
      return self.offline_page();
    }

    match resource_type {
      ResourceType::Image => placeholder_image(),
      _ => network_error(),
    }
  }

  /// The stored offline page, or a built-in one if none was saved.
  pub fn offline_page(&self) -> HttpResponse {
    let stored = self
      .store
      .get(&CacheNamespace::Offline, &self.offline_page)
      .or_else(|| self.store.get(&self.precache, &self.offline_page));

    let response = match stored {
      Some(entry) => {
        let mut response = entry.to_response();
        response.status = 200;
        response
      }
      None => HttpResponse::new(200, BUILTIN_OFFLINE_PAGE)
        .with_header("content-type", "text/html; charset=utf-8"),
    };

    response.with_header(FALLBACK_HEADER, "offline")
  }
}

pub fn placeholder_image() -> HttpResponse {
  HttpResponse::new(200, PLACEHOLDER_SVG)
    .with_header("content-type", "image/svg+xml")
    .with_header(FALLBACK_HEADER, "placeholder")
}

pub fn network_error() -> HttpResponse {
  HttpResponse::new(NETWORK_ERROR_STATUS, "Network error")
    .with_header("content-type", "text/plain")
    .with_header(FALLBACK_HEADER, "error")
}
