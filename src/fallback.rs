// Fallback resolver service
//
// Independent, direct-streaming-first resolution used as the cascade's last
// resort (served at /api/stream-fallback):
// - HEAD the link; a media content type means the link itself is playable
// - Otherwise mine the page: <video> sources, iframes on known video hosts,
//   embedded-player attributes, then container/CDN URL patterns

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cascade::PatternMiner;
use crate::config::CascadeConfig;
use crate::context::{html, is_aborted, HttpClient, HttpRequest};
use crate::providers::types::{dedupe_candidates, infer_container, StreamCandidate};

const PLAYER_SELECTORS: &str = ".video-player, .player, .stream-player, [data-video], [data-src], .embed-responsive";

/// Container hint for a media content type, `None` when it is not media
pub fn media_kind(content_type: &str, link: &str) -> Option<String> {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("mpegurl") {
        Some("m3u8".to_string())
    } else if content_type.contains("dash+xml") {
        Some("mpd".to_string())
    } else if content_type.starts_with("video/") || content_type.contains("application/octet-stream") {
        Some(infer_container(link, "mp4"))
    } else {
        None
    }
}

pub struct FallbackResolver {
    http: HttpClient,
    miner: Arc<PatternMiner>,
    video_hosts: Vec<String>,
}

impl FallbackResolver {
    pub fn new(http: HttpClient, config: &CascadeConfig) -> Self {
        Self {
            http,
            miner: Arc::new(PatternMiner::new(config)),
            video_hosts: config.video_hosts.clone(),
        }
    }

    pub async fn resolve(&self, link: &str, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let base = Url::parse(link)?;

        match self.http.send(HttpRequest::head(link), cancel).await {
            Ok(head) if head.is_success() => {
                if let Some(kind) = head.header("content-type").and_then(|ct| media_kind(ct, link)) {
                    log::info!("[fallback] {} is directly streamable ({})", link, kind);
                    return Ok(vec![StreamCandidate::new("Direct Stream", link, kind)]);
                }
            }
            Ok(head) => log::debug!("[fallback] HEAD {} returned {}", link, head.status),
            Err(e) if is_aborted(&e) => return Err(e),
            Err(e) => log::debug!("[fallback] HEAD {} failed: {:#}", link, e),
        }

        let page = match self.http.get_text(link, cancel).await {
            Ok(page) => page,
            Err(e) if is_aborted(&e) => return Err(e),
            Err(e) => {
                log::warn!("[fallback] Could not fetch {}: {:#}", link, e);
                return Ok(Vec::new());
            }
        };

        Ok(self.mine(&page, &base))
    }

    fn mine(&self, page: &str, base: &Url) -> Vec<StreamCandidate> {
        let mut found = Vec::new();

        for src in html::attr_urls(page, "video source[src], video[src]", "src", base) {
            found.push(StreamCandidate::new("HTML5 Video", src, "mp4"));
        }

        for src in html::attr_urls(page, "iframe[src]", "src", base) {
            if self.video_hosts.iter().any(|host| src.contains(host.as_str())) {
                found.push(StreamCandidate::new("Embedded Player", src, "iframe"));
            }
        }

        if let Ok(players) = html::select(page, PLAYER_SELECTORS) {
            for player in players {
                let Some(value) = player
                    .attr("data-video")
                    .or_else(|| player.attr("data-src"))
                    .or_else(|| player.attr("src"))
                else {
                    continue;
                };
                if let Some(link) = base.join(value.trim()).ok().filter(|u| matches!(u.scheme(), "http" | "https")) {
                    found.push(StreamCandidate::new("Embedded Player", link.to_string(), "mp4"));
                }
            }
        }

        // Only the URL patterns; the miner's own tag rules are broader than ours
        found.extend(
            self.miner
                .mine(page, base)
                .into_iter()
                .filter(|c| matches!(c.server.as_str(), "Direct Link" | "Video Hosting")),
        );

        dedupe_candidates(found)
    }
}
