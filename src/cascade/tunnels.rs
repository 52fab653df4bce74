// Linked-tunnel mining
//
// Pages often only link out to a redirector/tunnel host that holds the real
// file. Links to configured tunnel domains are collected from the original
// page, at most `max_tunnel_links` of them are fetched (each under its own
// timeout), and each fetched page is pattern-mined once. Tunnel pages are
// never followed any further.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::patterns::PatternMiner;
use super::{CascadeRequest, Strategy};
use crate::config::CascadeConfig;
use crate::context::{html, is_aborted, HttpClient, HttpRequest};
use crate::providers::types::{dedupe_candidates, StreamCandidate};

struct Tunnel {
    pattern: Regex,
    label: String,
}

pub struct LinkedTunnels {
    http: HttpClient,
    miner: Arc<PatternMiner>,
    tunnels: Vec<Tunnel>,
    max_links: usize,
    concurrency: usize,
    per_link: Duration,
}

impl LinkedTunnels {
    pub fn new(http: HttpClient, miner: Arc<PatternMiner>, config: &CascadeConfig) -> Self {
        let tunnels = config
            .tunnel_hosts
            .iter()
            .filter_map(|host| {
                let pattern = format!(r#"(?i)https?://{}/[^\s"'<>]+"#, regex::escape(&host.domain));
                match Regex::new(&pattern) {
                    Ok(pattern) => Some(Tunnel {
                        pattern,
                        label: host.label.clone(),
                    }),
                    Err(e) => {
                        log::error!("Invalid tunnel host {}: {}", host.domain, e);
                        None
                    }
                }
            })
            .collect();

        Self {
            http,
            miner,
            tunnels,
            max_links: config.max_tunnel_links,
            concurrency: config.attempt_concurrency.max(1),
            per_link: Duration::from_secs(config.tunnel_timeout_secs),
        }
    }

    /// Tunnel links in `page`, grouped by host in configuration order
    fn links(&self, page: &str) -> Vec<(String, String)> {
        let mut links: Vec<(String, String)> = Vec::new();
        for tunnel in &self.tunnels {
            for m in tunnel.pattern.find_iter(page) {
                if !links.iter().any(|(link, _)| link == m.as_str()) {
                    links.push((m.as_str().to_string(), tunnel.label.clone()));
                }
            }
        }
        links
    }

    async fn mine_tunnel(&self, link: &str, label: &str, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let response = self
            .http
            .send(HttpRequest::get(link).timeout(self.per_link), cancel)
            .await?;
        if !response.is_success() {
            anyhow::bail!("Tunnel page {} returned {}", link, response.status);
        }

        let base = Url::parse(&response.url).or_else(|_| Url::parse(link))?;
        let mut found: Vec<StreamCandidate> = self
            .miner
            .mine(&response.body, &base)
            .into_iter()
            .map(|mut candidate| {
                candidate.server = match candidate.server.as_str() {
                    "Embedded Player" => format!("{} Embed", label),
                    "HTML5 Video" => format!("{} Video", label),
                    _ => label.to_string(),
                };
                candidate
            })
            .collect();

        for href in html::attr_urls(&response.body, "a[href*=\"download\"]", "href", &base) {
            found.push(StreamCandidate::new(format!("{} Download", label), href, "mp4"));
        }

        Ok(found)
    }
}

#[async_trait]
impl Strategy for LinkedTunnels {
    fn name(&self) -> &'static str {
        "linked-tunnels"
    }

    fn timeout(&self) -> Duration {
        // Room for every permitted tunnel fetch when run one at a time
        self.per_link * self.max_links.max(1) as u32
    }

    async fn attempt(&self, request: &CascadeRequest, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let page = request.page(cancel).await?;
        let mut links = self.links(page);
        if links.is_empty() {
            return Ok(Vec::new());
        }
        log::info!(
            "Found {} tunnel links in {}, following at most {}",
            links.len(),
            request.link,
            self.max_links
        );
        links.truncate(self.max_links);

        let results: Vec<_> = stream::iter(links)
            .map(|(link, label)| async move {
                let result = self.mine_tunnel(&link, &label, cancel).await;
                (link, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut found = Vec::new();
        for (link, result) in results {
            match result {
                Ok(candidates) => found.extend(candidates),
                Err(e) if is_aborted(&e) && cancel.is_cancelled() => return Err(e),
                Err(e) => log::warn!("Failed to process tunnel link {}: {:#}", link, e),
            }
        }

        Ok(dedupe_candidates(found))
    }
}
