//!
//! src/fetch.rs  Andrew Belles  Oct 18th, 2025
//!
//! Defines methods for hitting the devtools discovery endpoint and the
//! audio/image CDN, returning raw bytes, handling retries, etc.
//!

use std::time::Duration;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use reqwest::{Client, header, redirect, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::config::{BrowserConfig, HttpConfig, RetryConfig};
use crate::ArchiverError;

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

fn client_with_headers_and_agent(
    http: &HttpConfig,
    headers: header::HeaderMap,
    user_agent: &str
) -> Result<Client, ArchiverError> {
    client_helper(http)
        .default_headers(headers)
        .user_agent(user_agent)
        .build()
        .map_err(|e| ArchiverError::Http(format!("build client: {e}")))
}

/// Simple function to generate random wait for send_with_retry
fn generate_backoff(base: Duration, attempt: u32, jitter: bool, rng: &mut SmallRng) -> Duration {
    let exp = base * (1_u32 << attempt.min(6));
    let jitter = if jitter { rng.gen_range(50..=200) } else { 0 };
    exp + Duration::from_millis(jitter)
}

/// Sends a request, retrying on retryable statuses and transport errors.
/// Non-retryable statuses (404 and friends) come back as errors immediately.
pub async fn send_with_retry(
    request: RequestBuilder,
    retry: &RetryConfig
) -> Result<Response, ArchiverError> {
    let mut rng = SmallRng::from_entropy();
    let mut attempt = 0_u32;
    loop {
        let response = request.try_clone()
            .ok_or_else(|| ArchiverError::Http("non-cloneable request".to_string()))?
            .send()
            .await;
        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                if status == StatusCode::NOT_FOUND {
                    return Err(ArchiverError::NotFound(format!("http 404 {}", resp.url())));
                }
                if !retry.is_retryable(status.as_u16()) || attempt + 1 >= retry.max_attempts as u32 {
                    return Err(ArchiverError::Http(
                        format!("status {} after {} retries", status.as_u16(), attempt)
                    ));
                }
                let backoff = generate_backoff(retry.base_backoff, attempt, retry.jitter, &mut rng);
                warn!(status = %status, backoff = ?backoff.as_millis(), "http.retry");
                sleep(backoff).await;
                attempt += 1;
            },
            Err(e) => {
                if attempt + 1 >= retry.max_attempts as u32 {
                    return Err(e.into());
                }
                let backoff = generate_backoff(retry.base_backoff, attempt, retry.jitter, &mut rng);
                warn!(error = %e, backoff = ?backoff.as_millis(), "http.retry.error");
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Entry of GET /json/list on the remote debugging endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DevToolsTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: Option<String>
}

#[derive(Debug, Clone)]
pub struct DevToolsClient {
    pub http: Client,
    pub base: Url
}

impl DevToolsClient {
    pub fn new(http_config: &HttpConfig, browser: &BrowserConfig) -> Result<Self, ArchiverError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        let http = client_helper(http_config)
            .default_headers(headers)
            .timeout(http_config.probe_timeout)
            .build()
            .map_err(|e| ArchiverError::Http(format!("build client: {e}")))?;
        let base = Url::parse(&browser.endpoint())
            .map_err(|e| ArchiverError::Config(format!("debug endpoint invalid {e}")))?;
        Ok( Self { http, base } )
    }

    /// GET /json/list
    pub async fn list_targets(&self) -> Result<Vec<DevToolsTarget>, ArchiverError> {
        let url = self.base.join("json/list")?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ArchiverError::Http(format!("json/list status {}", response.status())));
        }
        Ok(response.json::<Vec<DevToolsTarget>>().await?)
    }
}

/// Result of a successful HEAD probe against a guessed location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub url: Url,
    pub content_length: Option<u64>,
    pub content_type: Option<String>
}

#[derive(Clone, Debug)]
pub struct MediaClient {
    pub http: Client,
    pub retry: RetryConfig,
    probe_timeout: Duration
}

impl MediaClient {
    pub fn new(http_config: &HttpConfig) -> Result<Self, ArchiverError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("*/*"));
        let http = client_with_headers_and_agent(http_config, headers, &http_config.user_agent)?;
        Ok( Self {
            http,
            retry: http_config.retry.clone(),
            probe_timeout: http_config.probe_timeout
        })
    }

    /// HEAD {url}; Ok(None) for anything but a 2xx
    pub async fn probe(&self, url: &Url) -> Result<Option<Probe>, ArchiverError> {
        let response = self.http.head(url.clone())
            .timeout(self.probe_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "probe.miss");
            return Ok(None);
        }
        let content_type = response.headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // body of a HEAD response is empty, read the header itself
        let content_length = response.headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok(Some(Probe {
            url: response.url().clone(),
            content_length,
            content_type
        }))
    }

    /// GET {url} with retries, whole body in memory
    pub async fn bytes(&self, url: &Url) -> Result<(Vec<u8>, Option<String>), ArchiverError> {
        let response = send_with_retry(self.http.get(url.clone()), &self.retry).await?;
        let content_type = response.headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok((body.to_vec(), content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut rng = SmallRng::seed_from_u64(7);
        let base = Duration::from_millis(100);
        let first = generate_backoff(base, 0, false, &mut rng);
        let third = generate_backoff(base, 2, false, &mut rng);
        let capped = generate_backoff(base, 30, false, &mut rng);
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(third, Duration::from_millis(400));
        assert_eq!(capped, Duration::from_millis(6400));
        let jittered = generate_backoff(base, 0, true, &mut rng);
        assert!(jittered >= Duration::from_millis(150) && jittered <= Duration::from_millis(300));
    }

    #[test]
    fn devtools_targets_deserialize() {
        let raw = r#"[{"description":"","devtoolsFrontendUrl":"/x","id":"A1",
            "title":"Suno","type":"page","url":"https://suno.com/me",
            "webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/page/A1"}]"#;
        let targets: Vec<DevToolsTarget> = serde_json::from_str(raw).unwrap();
        assert_eq!(targets[0].kind, "page");
        assert!(targets[0].web_socket_debugger_url.is_some());
    }
}
