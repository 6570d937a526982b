//! HTTP request/response model and the network seam used by the engine.

mod client;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use url::Url;

pub use client::ReqwestFetcher;

/// Header map with lowercased names.
pub type Headers = BTreeMap<String, String>;

/// An outgoing request as seen by the interception boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
  pub method: String,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Bytes>,
}

impl HttpRequest {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Only GET requests are eligible for caching.
  pub fn is_read_only(&self) -> bool {
    self.method == "GET"
  }

  /// Whether the request asks for a document (navigation) rather than a subresource.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get("accept")
      .is_some_and(|accept| accept.contains("text/html"))
  }
}

/// A response, either from the network, the cache, or synthesized.
///
/// The body is reference counted, so cloning a response to both store and
/// return it does not copy the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: Bytes,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get("content-type").map(String::as_str)
  }
}

/// Why a network attempt did not produce a usable response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("request timed out")]
  Timeout,
  #[error("server responded with status {0}")]
  Status(u16),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl FetchError {
  /// The request never reached a server.
  pub fn is_transport(&self) -> bool {
    matches!(self, FetchError::Unreachable(_) | FetchError::Timeout)
  }
}

/// The network. Production uses [`ReqwestFetcher`]; tests script responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Perform the request. A completed exchange is `Ok` whatever its status.
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// Same-origin resolution for relative URLs.
#[derive(Debug, Clone)]
pub struct Origin {
  base: Url,
}

impl Origin {
  pub fn parse(origin: &str) -> Result<Self> {
    let base =
      Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    Ok(Self { base })
  }

  /// Resolve an absolute or origin-relative URL.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .base
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.base.origin()
  }
}
