// HTTP capability
//
// Shared outbound client for provider modules and the extraction cascade.
// Every call races the request against a CancellationToken so that firing the
// token drops (and therefore aborts) the in-flight request.

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;

/// Marker error for a request stopped by its cancellation token
#[derive(Debug, Error)]
#[error("request aborted")]
pub struct Aborted;

/// Non-2xx answer from a site, kept distinct from transport failures
#[derive(Debug, Error)]
#[error("HTTP {status} from {url}")]
pub struct HttpStatusError {
    pub status: u16,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::HEAD,
            ..Self::get(url)
        }
    }

    pub fn post(url: impl Into<String>, body: Option<String>) -> Self {
        Self {
            method: Method::POST,
            body,
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Buffered response handed to scripts and strategies
#[derive(Debug, Clone, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    /// Final URL after redirects
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl HttpClient {
    /// Build the client with a browser user agent and the shared header preset
    pub fn new(config: &HttpConfig, preset: &BTreeMap<String, String>) -> Result<Self> {
        let mut defaults = HeaderMap::new();
        for (name, value) in preset {
            defaults.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(defaults)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            timeout: Duration::from_secs(config.request_timeout_secs),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Send a request, aborting it if `cancel` fires first
    pub async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(Aborted.into());
        }

        let method = request.method.clone();
        let url = request.url.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("Aborted {} {}", method, clip(&url, 120));
                Err(Aborted.into())
            }
            result = self.execute(request) => result,
        }
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        log::debug!("{} {}", request.method, clip(&request.url, 120));

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout.unwrap_or(self.timeout));

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", request.method, request.url))?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();

        let mut bytes = Vec::new();
        if request.method != Method::HEAD {
            while let Some(chunk) = response.chunk().await? {
                let room = self.max_body_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if bytes.len() >= self.max_body_bytes {
                    log::warn!("Truncated response body from {} at {} bytes", url, bytes.len());
                    break;
                }
            }
        }

        Ok(HttpResponse {
            status,
            url,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// GET a page, treating any non-2xx status as an error
    pub async fn get_text(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        let response = self.send(HttpRequest::get(url), cancel).await?;
        if !response.is_success() {
            return Err(HttpStatusError {
                status: response.status,
                url: url.to_string(),
            }
            .into());
        }
        Ok(response.body)
    }

    /// Send a request and parse its JSON body
    pub async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let url = request.url.clone();
        let response = self.send(request, cancel).await?;
        if !response.is_success() {
            return Err(HttpStatusError {
                status: response.status,
                url,
            }
            .into());
        }
        serde_json::from_str(&response.body).map_err(|e| anyhow!("Invalid JSON from {}: {}", url, e))
    }
}

/// At most `max` characters of `text`, for log lines
pub fn clip(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// True when an error chain was caused by cancellation
pub fn is_aborted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Aborted>())
}
