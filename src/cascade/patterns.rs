// Direct pattern mining
//
// Handles:
// - <video>/<source> src attributes (HTML5 Video)
// - <iframe> src attributes (Embedded Player)
// - Absolute URLs ending in a known container extension (Direct Link)
// - URLs on configured CDN and video-hosting domains (Video Hosting)
//
// Relative tag URLs are resolved against the page's own URL. The domain and
// extension tables come from configuration.

use anyhow::Result;
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{CascadeRequest, Strategy};
use crate::config::CascadeConfig;
use crate::context::html;
use crate::providers::types::{dedupe_candidates, StreamCandidate};

/// Characters that end a URL embedded in markup or script
const URL_BODY: &str = r#"[^\s"'<>()\\]"#;

fn alternation(items: &[String]) -> String {
    items.iter().map(|i| regex::escape(i)).collect::<Vec<_>>().join("|")
}

fn compile(pattern: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(regex) => Some(regex),
        Err(e) => {
            log::error!("Invalid extraction pattern {}: {}", pattern, e);
            None
        }
    }
}

pub struct PatternMiner {
    container: Option<Regex>,
    hosting: Vec<Regex>,
}

impl PatternMiner {
    pub fn new(config: &CascadeConfig) -> Self {
        let container = (!config.video_extensions.is_empty())
            .then(|| {
                format!(
                    r"https?://{body}*\.(?:{ext})\b",
                    body = URL_BODY,
                    ext = alternation(&config.video_extensions)
                )
            })
            .and_then(|p| compile(&p));

        let hosting = [&config.cdn_hosts, &config.video_hosts]
            .into_iter()
            .filter(|hosts| !hosts.is_empty())
            .filter_map(|hosts| {
                compile(&format!(
                    r"https?://{body}*\.(?:{hosts})\.com{body}*",
                    body = URL_BODY,
                    hosts = alternation(hosts)
                ))
            })
            .collect();

        Self { container, hosting }
    }

    /// Every candidate visible in `page`, in discovery order, deduplicated
    pub fn mine(&self, page: &str, base: &Url) -> Vec<StreamCandidate> {
        let mut found = Vec::new();

        for link in html::attr_urls(page, "video[src], video source[src]", "src", base) {
            found.push(StreamCandidate::new("HTML5 Video", link, "mp4"));
        }
        for link in html::attr_urls(page, "iframe[src]", "src", base) {
            found.push(StreamCandidate::new("Embedded Player", link, "iframe"));
        }

        if let Some(container) = &self.container {
            for m in container.find_iter(page) {
                let link = m.as_str();
                let kind = link.rsplit('.').next().unwrap_or("mp4").to_ascii_lowercase();
                found.push(StreamCandidate::new("Direct Link", link, kind));
            }
        }

        for hosting in &self.hosting {
            for m in hosting.find_iter(page) {
                found.push(StreamCandidate::new("Video Hosting", m.as_str(), "embed"));
            }
        }

        dedupe_candidates(found)
    }
}

pub struct PatternMining {
    miner: Arc<PatternMiner>,
    timeout: Duration,
}

impl PatternMining {
    pub fn new(miner: Arc<PatternMiner>, config: &CascadeConfig) -> Self {
        Self {
            miner,
            timeout: Duration::from_secs(config.extractor_timeout_secs),
        }
    }
}

#[async_trait]
impl Strategy for PatternMining {
    fn name(&self) -> &'static str {
        "pattern-mining"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, request: &CascadeRequest, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let base = Url::parse(&request.link)?;
        let page = request.page(cancel).await?;
        Ok(self.miner.mine(page, &base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn miner() -> PatternMiner {
        PatternMiner::new(&CascadeConfig::default())
    }

    #[test]
    fn test_mines_tags_and_resolves_relative() {
        let page = r#"
            <video src="/media/clip.mp4"></video>
            <video><source src="https://cdn.example/hls/master.m3u8"></video>
            <iframe src="//player.example/embed/9"></iframe>
        "#;
        let base = Url::parse("https://site.example/post/1").unwrap();
        let found = miner().mine(page, &base);

        assert_eq!(found[0], StreamCandidate::new("HTML5 Video", "https://site.example/media/clip.mp4", "mp4"));
        assert_eq!(found[1].link, "https://cdn.example/hls/master.m3u8");
        assert_eq!(found[2], StreamCandidate::new("Embedded Player", "https://player.example/embed/9", "iframe"));
        // The m3u8 is also picked up as a direct link but collapses into the tag entry
        assert_eq!(found.iter().filter(|c| c.link.ends_with("master.m3u8")).count(), 1);
    }

    #[test]
    fn test_mines_script_urls_by_extension() {
        let page = r#"<script>var sources = ["https://s1.example/v/movie.MKV", 'https://s2.example/a.webm?x=1'];</script>"#;
        let found = miner().mine(page, &Url::parse("https://site.example/").unwrap());

        assert_eq!(found.len(), 2);
        assert_eq!(found[0], StreamCandidate::new("Direct Link", "https://s1.example/v/movie.MKV", "mkv"));
        assert_eq!(found[1].link, "https://s2.example/a.webm");
        assert_eq!(found[1].kind, "webm");
    }

    #[test]
    fn test_mines_hosting_domains() {
        let page = r#"<a href="https://player.vimeo.com/video/123">x</a> https://media.bunny.com/play/abc"#;
        let found = miner().mine(page, &Url::parse("https://site.example/").unwrap());

        let links: Vec<_> = found.iter().map(|c| (c.server.as_str(), c.link.as_str())).collect();
        assert!(links.contains(&("Video Hosting", "https://media.bunny.com/play/abc")));
        assert!(links.contains(&("Video Hosting", "https://player.vimeo.com/video/123")));
    }

    #[test]
    fn test_empty_tables_mine_tags_only() {
        let config = CascadeConfig {
            video_extensions: Vec::new(),
            cdn_hosts: Vec::new(),
            video_hosts: Vec::new(),
            ..CascadeConfig::default()
        };
        let page = r#"<iframe src="https://p.example/e/1"></iframe> https://x.example/a.mp4"#;
        let found = PatternMiner::new(&config).mine(page, &Url::parse("https://site.example/").unwrap());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, "iframe");
    }
}
