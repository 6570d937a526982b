use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::config::NetworkConfig;

use super::{FetchError, Fetcher, Headers, HttpRequest, HttpResponse};

/// Fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestFetcher {
  client: reqwest::Client,
}

impl ReqwestFetcher {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(&config.user_agent)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;

    let status = response.status().as_u16();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(map_reqwest_error)?;

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Timeout
  } else if e.is_builder() {
    FetchError::InvalidRequest(e.to_string())
  } else {
    FetchError::Unreachable(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;
  use wiremock::matchers::{body_string, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn fetcher() -> ReqwestFetcher {
    ReqwestFetcher::new(&NetworkConfig {
      timeout_secs: 2,
      ..NetworkConfig::default()
    })
    .unwrap()
  }

  #[tokio::test]
  async fn test_fetch_returns_status_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/app.css"))
      .respond_with(
        ResponseTemplate::new(200)
          .insert_header("content-type", "text/css")
          .set_body_string("body{}"),
      )
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/app.css", server.uri())).unwrap();
    let response = fetcher().fetch(&HttpRequest::get(url)).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("text/css"));
    assert_eq!(&response.body[..], b"body{}");
  }

  #[tokio::test]
  async fn test_non_success_status_is_still_a_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/broken"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/api/broken", server.uri())).unwrap();
    let response = fetcher().fetch(&HttpRequest::get(url)).await.unwrap();
    assert_eq!(response.status, 500);
    assert!(!response.is_success());
  }

  #[tokio::test]
  async fn test_forwards_method_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/projects"))
      .and(header("content-type", "application/json"))
      .and(body_string(r#"{"name":"north"}"#))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/api/projects", server.uri())).unwrap();
    let request = HttpRequest::new("POST", url)
      .with_header("Content-Type", "application/json")
      .with_body(r#"{"name":"north"}"#);
    let response = fetcher().fetch(&request).await.unwrap();
    assert_eq!(response.status, 201);
  }

  #[tokio::test]
  async fn test_unreachable_host_is_fetch_error() {
    // Port 9 (discard) on localhost is not expected to be listening.
    let url = Url::parse("http://127.0.0.1:9/").unwrap();
    let err = fetcher().fetch(&HttpRequest::get(url)).await.unwrap_err();
    assert!(matches!(
      err,
      FetchError::Unreachable(_) | FetchError::Timeout
    ));
  }
}
