// Provider context
//
// The capability bundle handed to every executed provider module and every
// cascade strategy:
// - HTTP client with a browser user agent and the shared header preset
// - HTML selection
// - getBaseUrl(provider), cached for an hour
// - The named host extractors
//
// Every capability takes a CancellationToken and aborts in-flight work when it fires.

pub mod html;
pub mod http;

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::extractors::{gofile, supervideo, ExtractorSet, HostExtractor};
use crate::providers::manifest::BaseUrlResolver;

pub use http::{clip, is_aborted, HttpClient, HttpRequest, HttpResponse};

/// Extractor names as provider modules call them
pub const EXTRACTOR_NAMES: [&str; 4] = [
    "hubcloudExtracter",
    "gdFlixExtracter",
    "superVideoExtractor",
    "gofileExtracter",
];

/// Headers a desktop browser sends on a top-level navigation
pub fn common_headers() -> BTreeMap<String, String> {
    [
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.9"),
        ("Cache-Control", "no-cache"),
        ("DNT", "1"),
        ("Pragma", "no-cache"),
        ("Sec-Fetch-Dest", "document"),
        ("Sec-Fetch-Mode", "navigate"),
        ("Sec-Fetch-Site", "none"),
        ("Sec-Fetch-User", "?1"),
        ("Upgrade-Insecure-Requests", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Clone)]
pub struct ProviderContext {
    pub http: HttpClient,
    pub headers: Arc<BTreeMap<String, String>>,
    pub base_urls: Arc<BaseUrlResolver>,
    pub extractors: Arc<ExtractorSet>,
}

impl ProviderContext {
    pub fn new(
        http: HttpClient,
        headers: BTreeMap<String, String>,
        base_urls: Arc<BaseUrlResolver>,
        extractors: Arc<ExtractorSet>,
    ) -> Self {
        Self {
            http,
            headers: Arc::new(headers),
            base_urls,
            extractors,
        }
    }

    pub async fn base_url(&self, provider: &str, cancel: &CancellationToken) -> Result<String> {
        self.base_urls.get(provider, cancel).await
    }

    /// Run a named extractor on behalf of a module.
    ///
    /// Failures (other than cancellation) come back as the extractor's empty
    /// shape so that one broken host never rejects the module's promise.
    pub async fn call_extractor(&self, name: &str, arg: &str, cancel: &CancellationToken) -> Result<Value> {
        log::debug!("Extractor {} called with {}", name, clip(arg, 120));

        let result = match name {
            "hubcloudExtracter" => self
                .extractors
                .hubcloud
                .extract(arg, &self.http, cancel)
                .await
                .map(|c| json!(c)),
            "gdFlixExtracter" => self
                .extractors
                .gdflix
                .extract(arg, &self.http, cancel)
                .await
                .map(|c| json!(c)),
            "superVideoExtractor" => Ok(json!(supervideo::stream_url(arg).unwrap_or_default())),
            "gofileExtracter" => self
                .extractors
                .gofile
                .resolve(&gofile::content_id(arg), &self.http, cancel)
                .await
                .map(|l| json!(l)),
            other => return Err(anyhow::anyhow!("Unknown extractor: {}", other)),
        };

        match result {
            Ok(value) => Ok(value),
            Err(e) if is_aborted(&e) => Err(e),
            Err(e) => {
                log::warn!("Extractor {} failed: {:#}", name, e);
                Ok(match name {
                    "gofileExtracter" => json!(gofile::GoFileLink::default()),
                    "superVideoExtractor" => json!(""),
                    _ => json!([]),
                })
            }
        }
    }
}
