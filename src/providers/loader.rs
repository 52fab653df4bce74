// Module loader
//
// Fetches provider module source text from an ordered list of mirrors:
// - GET {mirror}/{provider}/{role}.js with a bounded timeout
// - First 200 with a non-empty body wins
// - 4xx/5xx, timeouts and transport errors all mean "try the next mirror"

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::types::{ModuleRole, ProviderKey};
use crate::config::ModuleConfig;
use crate::context::http::{is_aborted, HttpClient, HttpRequest};

/// Anything that can produce module source text for a provider role
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// Source text for one role, or `None` when no mirror could supply it
    async fn fetch(&self, key: &ProviderKey, role: ModuleRole, cancel: &CancellationToken) -> Option<String>;
}

pub struct MirrorLoader {
    http: HttpClient,
    mirrors: Vec<String>,
    timeout: Duration,
}

impl MirrorLoader {
    pub fn new(http: HttpClient, config: &ModuleConfig) -> Self {
        Self {
            http,
            mirrors: config
                .mirrors
                .iter()
                .map(|m| m.trim_end_matches('/').to_string())
                .collect(),
            timeout: config.fetch_timeout(),
        }
    }

    pub fn module_url(mirror: &str, key: &ProviderKey, role: ModuleRole) -> String {
        format!("{}/{}/{}.js", mirror, key, role)
    }
}

#[async_trait]
impl ModuleSource for MirrorLoader {
    async fn fetch(&self, key: &ProviderKey, role: ModuleRole, cancel: &CancellationToken) -> Option<String> {
        for (index, mirror) in self.mirrors.iter().enumerate() {
            let url = Self::module_url(mirror, key, role);
            let request = HttpRequest::get(&url)
                .header("Cache-Control", "no-cache")
                .timeout(self.timeout);

            match self.http.send(request, cancel).await {
                Ok(response) if response.status == 200 && !response.body.trim().is_empty() => {
                    log::debug!(
                        "Loaded {}/{} from mirror {} ({} bytes)",
                        key,
                        role,
                        index + 1,
                        response.body.len()
                    );
                    return Some(response.body);
                }
                Ok(response) => {
                    log::debug!("Mirror {} returned {} for {}", index + 1, response.status, url);
                }
                Err(e) if is_aborted(&e) => return None,
                Err(e) => {
                    log::debug!("Mirror {} failed for {}: {:#}", index + 1, url, e);
                }
            }
        }

        log::warn!("No mirror could supply {} module for {}", role, key);
        None
    }
}
