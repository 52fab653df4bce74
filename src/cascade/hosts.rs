// Host-extractor strategy: run every specialized extractor that recognizes
// the original page, in their fixed order, and pool what they find.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{CascadeRequest, Strategy};
use crate::config::CascadeConfig;
use crate::context::{is_aborted, HttpClient};
use crate::extractors::ExtractorSet;
use crate::providers::types::StreamCandidate;

pub struct HostExtractors {
    http: HttpClient,
    extractors: Arc<ExtractorSet>,
    timeout: Duration,
}

impl HostExtractors {
    pub fn new(http: HttpClient, extractors: Arc<ExtractorSet>, config: &CascadeConfig) -> Self {
        Self {
            http,
            extractors,
            timeout: Duration::from_secs(config.extractor_timeout_secs),
        }
    }
}

#[async_trait]
impl Strategy for HostExtractors {
    fn name(&self) -> &'static str {
        "host-extractors"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, request: &CascadeRequest, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let url = Url::parse(&request.link)?;

        // Some hosts are recognized by URL alone, so an unreachable page is
        // not the end of this strategy.
        let page = match request.page(cancel).await {
            Ok(page) => page,
            Err(e) if is_aborted(&e) => return Err(e),
            Err(e) => {
                log::warn!("Could not fetch {} for host extractors: {:#}", request.link, e);
                ""
            }
        };

        let mut found = Vec::new();
        for extractor in self.extractors.hosts() {
            if !extractor.recognizes(&url, page) {
                continue;
            }
            log::info!("Extractor {} recognizes {}", extractor.name(), url);
            match extractor.extract_page(&url, page, &self.http, cancel).await {
                Ok(candidates) => {
                    log::info!("Extractor {} produced {} candidates", extractor.name(), candidates.len());
                    found.extend(candidates);
                }
                Err(e) if is_aborted(&e) => return Err(e),
                Err(e) => log::warn!("Extractor {} failed on {}: {:#}", extractor.name(), url, e),
            }
        }

        Ok(found)
    }
}
