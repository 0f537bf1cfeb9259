//! Network access for cache misses and manifest population.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::cache::{RequestKey, ResponseType, StoredResponse};
use crate::error::{CacheError, Result};

/// Performs network requests on behalf of the router and the store.
///
/// An `Err` means no response was obtained at all (connectivity, DNS,
/// timeout). Error statuses come back as `Ok` responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, key: &RequestKey) -> Result<StoredResponse>;
}

/// HTTP fetcher backed by reqwest.
///
/// Responses are classified against the configured origin: same-origin
/// responses are `basic`, anything else is `cors` or `opaque`. Redirects are
/// not followed; a 3xx is returned as-is so it is never stored.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(origin: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .redirect(reqwest::redirect::Policy::none())
      .user_agent(concat!("precache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {e}")))?;

    Ok(Self { client, origin })
  }

  fn classify(&self, final_url: &Url, headers: &reqwest::header::HeaderMap) -> ResponseType {
    if final_url.origin() == self.origin.origin() {
      ResponseType::Basic
    } else if headers.contains_key(reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN) {
      ResponseType::Cors
    } else {
      ResponseType::Opaque
    }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, key: &RequestKey) -> Result<StoredResponse> {
    let url = key.parsed_url()?;
    let method = reqwest::Method::from_bytes(key.method.as_bytes())
      .map_err(|e| CacheError::network(&key.url, e))?;

    let response = self
      .client
      .request(method, url)
      .send()
      .await
      .map_err(|e| CacheError::network(&key.url, e))?;

    let final_url = response.url().clone();
    let status = response.status().as_u16();
    let response_type = self.classify(&final_url, response.headers());
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| CacheError::network(&key.url, e))?;

    tracing::debug!(url = %key.url, status, response_type = response_type.as_str(), "fetched");

    Ok(StoredResponse {
      url: final_url.into(),
      status,
      headers,
      body: body.to_vec(),
      response_type,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_same_origin_response_is_basic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/a.js"))
      .respond_with(ResponseTemplate::new(200).set_body_raw("export {}", "text/javascript"))
      .mount(&server)
      .await;

    let origin = Url::parse(&server.uri()).unwrap();
    let fetcher = HttpFetcher::new(origin.clone(), Duration::from_secs(5)).unwrap();
    let key = RequestKey::resolve("GET", "/a.js", &origin).unwrap();

    let response = fetcher.fetch(&key).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.response_type, ResponseType::Basic);
    assert_eq!(response.body, b"export {}");
    assert_eq!(response.header("content-type"), Some("text/javascript"));
    assert!(response.is_cacheable());
  }

  #[tokio::test]
  async fn test_error_status_is_a_response_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
      .mount(&server)
      .await;

    let origin = Url::parse(&server.uri()).unwrap();
    let fetcher = HttpFetcher::new(origin.clone(), Duration::from_secs(5)).unwrap();
    let key = RequestKey::resolve("GET", "/missing.png", &origin).unwrap();

    let response = fetcher.fetch(&key).await.unwrap();
    assert_eq!(response.status, 404);
    assert!(!response.is_cacheable());
  }

  #[tokio::test]
  async fn test_redirect_is_returned_as_is() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/old.js"))
      .respond_with(ResponseTemplate::new(301).insert_header("location", "/new.js"))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/new.js"))
      .respond_with(ResponseTemplate::new(200).set_body_string("export {}"))
      .mount(&server)
      .await;

    let origin = Url::parse(&server.uri()).unwrap();
    let fetcher = HttpFetcher::new(origin.clone(), Duration::from_secs(5)).unwrap();
    let key = RequestKey::resolve("GET", "/old.js", &origin).unwrap();

    let response = fetcher.fetch(&key).await.unwrap();
    assert_eq!(response.status, 301);
    assert_eq!(response.url, key.url);
    assert_eq!(response.header("location"), Some("/new.js"));
    assert!(!response.is_cacheable());
  }

  #[tokio::test]
  async fn test_cross_origin_responses_are_not_basic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/shared.js"))
      .respond_with(ResponseTemplate::new(200).insert_header("access-control-allow-origin", "*"))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/private.js"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;

    // The fetcher believes the app lives elsewhere
    let app_origin = Url::parse("http://app.invalid").unwrap();
    let fetcher = HttpFetcher::new(app_origin, Duration::from_secs(5)).unwrap();
    let server_url = Url::parse(&server.uri()).unwrap();

    let shared = RequestKey::get(&server_url.join("/shared.js").unwrap());
    let private = RequestKey::get(&server_url.join("/private.js").unwrap());

    assert_eq!(
      fetcher.fetch(&shared).await.unwrap().response_type,
      ResponseType::Cors
    );
    assert_eq!(
      fetcher.fetch(&private).await.unwrap().response_type,
      ResponseType::Opaque
    );
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_failure() {
    // Port 9 (discard) on localhost is not expected to accept HTTP
    let origin = Url::parse("http://127.0.0.1:9").unwrap();
    let fetcher = HttpFetcher::new(origin.clone(), Duration::from_secs(2)).unwrap();
    let key = RequestKey::resolve("GET", "/", &origin).unwrap();

    assert!(matches!(
      fetcher.fetch(&key).await,
      Err(CacheError::Network { .. })
    ));
  }
}
