// Provider manifest and base-URL lookup
//
// Handles:
// - Listing providers from the remote manifest (disabled entries dropped)
// - Resolving a provider's current site URL, cached per key for an hour

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::{ManifestEntry, ProviderInfo};
use crate::config::ManifestConfig;
use crate::context::http::{HttpClient, HttpRequest};

pub struct ManifestClient {
    http: HttpClient,
    url: String,
    timeout: Duration,
}

impl ManifestClient {
    pub fn new(http: HttpClient, config: &ManifestConfig) -> Self {
        Self {
            http,
            url: config.providers_url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Enabled providers, in manifest order
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<ProviderInfo>> {
        let request = HttpRequest::get(&self.url).timeout(self.timeout);
        let entries: serde_json::Value = self.http.fetch_json(request, cancel).await?;

        // A non-array manifest is treated as empty; malformed entries are skipped
        let providers: Vec<ProviderInfo> = entries
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| serde_json::from_value::<ManifestEntry>(entry.clone()).ok())
            .filter(|entry| !entry.disabled)
            .map(ProviderInfo::from)
            .collect();

        log::info!("Manifest lists {} enabled providers", providers.len());
        Ok(providers)
    }
}

#[derive(Deserialize)]
struct BaseUrlEntry {
    #[serde(default)]
    url: String,
}

struct CachedUrl {
    url: String,
    fetched_at: Instant,
}

/// `getBaseUrl` backing store
pub struct BaseUrlResolver {
    http: HttpClient,
    url: String,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedUrl>>,
}

impl BaseUrlResolver {
    pub fn new(http: HttpClient, config: &ManifestConfig) -> Self {
        Self {
            http,
            url: config.base_urls_url.clone(),
            ttl: Duration::from_secs(config.base_url_ttl_secs),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Site URL for `provider`, or an empty string when the manifest has none
    pub async fn get(&self, provider: &str, cancel: &CancellationToken) -> Result<String> {
        if let Some(url) = self.cached(provider) {
            return Ok(url);
        }

        let request = HttpRequest::get(&self.url);
        let manifest: HashMap<String, serde_json::Value> = self.http.fetch_json(request, cancel).await?;
        let url = manifest
            .get(provider)
            .and_then(|entry| serde_json::from_value::<BaseUrlEntry>(entry.clone()).ok())
            .map(|entry| entry.url)
            .unwrap_or_default();

        log::debug!("Base URL for {}: {:?}", provider, url);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                provider.to_string(),
                CachedUrl {
                    url: url.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(url)
    }

    fn cached(&self, provider: &str) -> Option<String> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(provider)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.url.clone())
    }
}
