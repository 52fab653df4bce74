// Stream proxy
//
// Relays a resolved media URL to the player with byte-range semantics intact:
// - Client Range header (and optional referer) forwarded upstream
// - Length/range/freshness headers mirrored back verbatim
// - HEAD request to backfill Content-Length / Accept-Ranges for full byte-media
//   responses; partial ones take their length from Content-Range
// - Caching disabled, permissive CORS, upstream status forwarded as-is
// - Body streamed chunk by chunk, never buffered

use anyhow::Context;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::context::clip;
use crate::error::{RelayError, RelayResult};

lazy_static! {
    static ref HTTP_URL: Regex = Regex::new(r"(?i)^https?://").unwrap();
}

/// Upstream headers mirrored onto the relayed response
const PASSTHROUGH: [HeaderName; 8] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::ACCEPT_RANGES,
    header::CONTENT_RANGE,
    header::EXPIRES,
    header::LAST_MODIFIED,
    header::ETAG,
    header::AGE,
];

/// Content types served as seekable byte ranges
const BYTE_MEDIA: [&str; 4] = [
    "video/mp4",
    "video/x-matroska",
    "video/webm",
    "application/octet-stream",
];

#[derive(Clone)]
pub struct StreamProxy {
    client: reqwest::Client,
    response_timeout: Duration,
    idle_timeout: Duration,
}

impl StreamProxy {
    // No total request timeout: it would also cap body streaming
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .context("Failed to build proxy client")?;
        Ok(Self {
            client,
            response_timeout: Duration::from_secs(config.response_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        })
    }

    fn upstream_request(
        &self,
        method: reqwest::Method,
        url: &str,
        referer: Option<&str>,
        range: Option<&HeaderValue>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, url).header(header::ACCEPT, "*/*");
        if let Some(referer) = referer.filter(|r| !r.is_empty()) {
            request = request.header(header::REFERER, referer);
        }
        if let Some(range) = range {
            request = request.header(header::RANGE, range.clone());
        }
        request
    }

    /// Relay `url` to the client. Only an unreachable upstream is an error;
    /// any upstream status, 4xx/5xx included, is forwarded as the response.
    pub async fn relay(
        &self,
        url: &str,
        referer: Option<&str>,
        range: Option<&HeaderValue>,
        cancel: CancellationToken,
    ) -> RelayResult<Response> {
        if !HTTP_URL.is_match(url) {
            return Err(RelayError::BadRequest("url must be an absolute http(s) URL".to_string()));
        }

        log::info!("Proxying {}", clip(url, 100));
        if let Some(range) = range.and_then(|r| r.to_str().ok()) {
            log::debug!("Forwarding Range header: {}", range);
        }

        let request = self.upstream_request(reqwest::Method::GET, url, referer, range);
        let mut upstream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Aborted),
            response = tokio::time::timeout(self.response_timeout, request.send()) => match response {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    log::error!("Proxy request failed: {}", e);
                    return Err(RelayError::UpstreamUnavailable(e.to_string()));
                }
                Err(_) => {
                    log::error!("Upstream sent no response within {:?}", self.response_timeout);
                    return Err(RelayError::UpstreamUnavailable("upstream response timed out".to_string()));
                }
            },
        };

        let status = upstream.status();
        log::info!("Upstream responded {}", status);

        let mut headers = HeaderMap::new();
        for name in PASSTHROUGH {
            if let Some(value) = upstream.headers().get(&name) {
                headers.insert(name, value.clone());
            }
        }

        if status == StatusCode::PARTIAL_CONTENT {
            // A full-file HEAD length would misframe a partial body
            if !headers.contains_key(header::CONTENT_LENGTH) {
                if let Some(length) = headers.get(header::CONTENT_RANGE).and_then(range_length) {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
                }
            }
        } else if status == StatusCode::OK && needs_backfill(&headers) {
            self.backfill(&mut headers, url, referer).await;
        }

        headers
            .entry(header::ACCEPT_RANGES)
            .or_insert(HeaderValue::from_static("bytes"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("Content-Range, Accept-Ranges, Content-Length"),
        );

        // Dropping the body (client gone) drops `upstream`, which aborts the fetch
        let idle_timeout = self.idle_timeout;
        let body = async_stream::stream! {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        log::debug!("Relay cancelled");
                        break;
                    }
                    chunk = tokio::time::timeout(idle_timeout, upstream.chunk()) => match chunk {
                        Ok(Ok(Some(bytes))) => yield Ok(bytes),
                        Ok(Ok(None)) => break,
                        Ok(Err(e)) => {
                            log::warn!("Upstream stream error: {}", e);
                            yield Err(io::Error::new(io::ErrorKind::Other, e));
                            break;
                        }
                        Err(_) => {
                            log::warn!("Upstream stalled for {:?}", idle_timeout);
                            yield Err(io::Error::new(io::ErrorKind::TimedOut, "upstream stalled"));
                            break;
                        }
                    }
                }
            }
        };

        let mut response = Response::new(Body::from_stream(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Fill in Content-Length / Accept-Ranges of a full (200) response from
    /// an unranged HEAD request
    async fn backfill(&self, headers: &mut HeaderMap, url: &str, referer: Option<&str>) {
        log::debug!("Sending HEAD to {} for length and range support", clip(url, 100));
        let request = self.upstream_request(reqwest::Method::HEAD, url, referer, None);
        let head = match tokio::time::timeout(self.response_timeout, request.send()).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                log::warn!("HEAD request failed: {}", e);
                return;
            }
            Err(_) => {
                log::warn!("HEAD request timed out");
                return;
            }
        };
        if !head.status().is_success() {
            log::warn!("HEAD request answered {}", head.status());
            return;
        }

        for name in [header::CONTENT_LENGTH, header::ACCEPT_RANGES] {
            if headers.contains_key(&name) {
                continue;
            }
            if let Some(value) = head.headers().get(&name) {
                headers.insert(name, value.clone());
            }
        }
    }
}

/// Byte media missing either of the headers a player needs for seeking
fn needs_backfill(headers: &HeaderMap) -> bool {
    let missing = !headers.contains_key(header::CONTENT_LENGTH) || !headers.contains_key(header::ACCEPT_RANGES);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    missing && BYTE_MEDIA.iter().any(|media| content_type.contains(media))
}

/// Body length of a `bytes first-last/total` Content-Range
fn range_length(value: &HeaderValue) -> Option<u64> {
    let spec = value.to_str().ok()?.trim().strip_prefix("bytes")?.trim_start();
    let (span, _total) = spec.split_once('/')?;
    let (first, last) = span.split_once('-')?;
    let (first, last) = (first.trim().parse::<u64>().ok()?, last.trim().parse::<u64>().ok()?);
    last.checked_sub(first).map(|len| len + 1)
}
