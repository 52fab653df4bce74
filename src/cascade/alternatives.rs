// Alternative-URL strategy
//
// Providers' link formats drift. Sibling URLs are built by moving the final
// path segment under (and in front of) canonical segments like `watch` or
// `embed`, and the provider's own resolver is re-invoked on each one.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{CascadeRequest, Strategy};
use crate::config::CascadeConfig;
use crate::context::is_aborted;
use crate::providers::types::StreamCandidate;

/// Sibling URLs for `link`: every segment as a prefix first, then as a suffix.
///
/// Deterministic for a given input; the original link itself is never
/// included.
pub fn generate_alternatives(link: &str, segments: &[String]) -> Vec<String> {
    let Ok(url) = Url::parse(link) else {
        return Vec::new();
    };
    let Some(last) = url
        .path_segments()
        .and_then(|s| s.filter(|p| !p.is_empty()).last().map(str::to_string))
    else {
        return Vec::new();
    };
    let origin = url.origin().ascii_serialization();

    let prefixed = segments.iter().map(|s| format!("{}/{}/{}", origin, s, last));
    let suffixed = segments.iter().map(|s| format!("{}/{}/{}", origin, last, s));

    let mut alternatives: Vec<String> = Vec::new();
    for candidate in prefixed.chain(suffixed) {
        if candidate != link && !alternatives.contains(&candidate) {
            alternatives.push(candidate);
        }
    }
    alternatives
}

pub struct AlternativeUrls {
    segments: Vec<String>,
    timeout: Duration,
    concurrency: usize,
}

impl AlternativeUrls {
    pub fn new(config: &CascadeConfig) -> Self {
        Self {
            segments: config.alternate_segments.clone(),
            timeout: Duration::from_secs(config.resolver_timeout_secs),
            concurrency: config.attempt_concurrency.max(1),
        }
    }
}

#[async_trait]
impl Strategy for AlternativeUrls {
    fn name(&self) -> &'static str {
        "alternative-url"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, request: &CascadeRequest, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let resolver = request
            .resolver
            .as_ref()
            .ok_or_else(|| anyhow!("No provider resolver to re-invoke"))?;

        let alternatives = generate_alternatives(&request.link, &self.segments);
        log::info!("Trying {} alternative URLs for {}", alternatives.len(), request.link);

        // In-order results with at most `concurrency` attempts in flight;
        // dropping the stream on success cancels the stragglers.
        let mut attempts = stream::iter(alternatives)
            .map(|alt| async move {
                let result = resolver.resolve(&alt, &request.kind, cancel).await;
                (alt, result)
            })
            .buffered(self.concurrency);

        while let Some((alt, result)) = attempts.next().await {
            match result {
                Ok(candidates) if !candidates.is_empty() => {
                    log::info!("Alternative URL succeeded: {}", alt);
                    return Ok(candidates);
                }
                Ok(_) => log::debug!("Alternative URL gave nothing: {}", alt),
                Err(e) if is_aborted(&e) => return Err(e),
                Err(e) => log::warn!("Alternative URL failed: {}: {:#}", alt, e),
            }
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::StreamResolver;
    use crate::config::HttpConfig;
    use crate::context::HttpClient;
    use std::sync::{Arc, Mutex};

    fn segments() -> Vec<String> {
        CascadeConfig::default().alternate_segments
    }

    #[test]
    fn test_generate_alternatives() {
        let alts = generate_alternatives("https://site.example/movies/abc-123", &segments());
        assert_eq!(alts.len(), 10);
        assert_eq!(alts[0], "https://site.example/watch/abc-123");
        assert_eq!(alts[4], "https://site.example/video/abc-123");
        assert_eq!(alts[5], "https://site.example/abc-123/watch");
        assert_eq!(alts, generate_alternatives("https://site.example/movies/abc-123", &segments()));
    }

    #[test]
    fn test_generate_alternatives_skips_original_and_bad_input() {
        let alts = generate_alternatives("https://site.example/watch/abc", &segments());
        assert!(!alts.contains(&"https://site.example/watch/abc".to_string()));
        assert!(generate_alternatives("not a url", &segments()).is_empty());
        assert!(generate_alternatives("https://site.example/", &segments()).is_empty());
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
        hit: &'static str,
    }

    #[async_trait]
    impl StreamResolver for Recorder {
        async fn resolve(&self, link: &str, _kind: &str, _cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
            self.seen.lock().unwrap().push(link.to_string());
            if link.ends_with(self.hit) {
                Ok(vec![StreamCandidate::new("Provider", "https://cdn.example/a.m3u8", "m3u8")])
            } else {
                Err(anyhow!("nothing at {}", link))
            }
        }
    }

    #[tokio::test]
    async fn test_first_successful_alternative_wins() {
        let resolver = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            hit: "/embed/abc",
        });
        let http = HttpClient::new(&HttpConfig::default(), &Default::default()).unwrap();
        let request = CascadeRequest::new("mod", "https://site.example/movie/abc", "movie", http)
            .with_resolver(resolver.clone());

        let strategy = AlternativeUrls::new(&CascadeConfig::default());
        let found = strategy.attempt(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].server, "Provider");
        let seen = resolver.seen.lock().unwrap();
        assert!(seen.contains(&"https://site.example/watch/abc".to_string()));
        assert!(!seen.contains(&"https://site.example/abc/play".to_string()));
    }

    #[tokio::test]
    async fn test_without_resolver_fails() {
        let http = HttpClient::new(&HttpConfig::default(), &Default::default()).unwrap();
        let request = CascadeRequest::new("mod", "https://site.example/movie/abc", "movie", http);
        let strategy = AlternativeUrls::new(&CascadeConfig::default());
        assert!(strategy.attempt(&request, &CancellationToken::new()).await.is_err());
    }
}
