// Extraction cascade
//
// Runs when a provider's own getStream comes back empty. Strategies are tried
// one after another under:
// - An aggregate wall-clock budget shared by the whole cascade
// - A per-attempt timeout (the smaller of the strategy's own and what is left)
// - A child cancellation token per attempt, so a timed-out attempt aborts its
//   in-flight requests without touching the caller's token
//
// The first strategy producing at least one candidate wins; the rest never run.

pub mod alternatives;
pub mod fallback;
pub mod hosts;
pub mod patterns;
pub mod tunnels;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CascadeConfig;
use crate::context::{is_aborted, HttpClient};
use crate::error::{RelayError, RelayResult};
use crate::extractors::ExtractorSet;
use crate::providers::types::{dedupe_candidates, StreamCandidate};

pub use alternatives::{generate_alternatives, AlternativeUrls};
pub use fallback::FallbackApi;
pub use hosts::HostExtractors;
pub use patterns::{PatternMiner, PatternMining};
pub use tunnels::LinkedTunnels;

/// Re-invokes the provider's own stream resolver for a different link
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, link: &str, kind: &str, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>>;
}

/// One self-contained way of finding candidates for a link
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Label reported as the response `source` when this strategy wins
    fn name(&self) -> &'static str;

    fn timeout(&self) -> Duration;

    async fn attempt(&self, request: &CascadeRequest, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>>;
}

/// Everything a strategy may look at. The original page is fetched at most
/// once per cascade and shared between strategies.
pub struct CascadeRequest {
    pub provider: String,
    pub link: String,
    pub kind: String,
    pub resolver: Option<Arc<dyn StreamResolver>>,
    http: HttpClient,
    page: OnceCell<String>,
}

impl CascadeRequest {
    pub fn new(provider: impl Into<String>, link: impl Into<String>, kind: impl Into<String>, http: HttpClient) -> Self {
        Self {
            provider: provider.into(),
            link: link.into(),
            kind: kind.into(),
            resolver: None,
            http,
            page: OnceCell::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn StreamResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The original link's page text. A failed fetch is not remembered, so a
    /// later strategy with a fresh token can try again.
    pub async fn page(&self, cancel: &CancellationToken) -> Result<&str> {
        self.page
            .get_or_try_init(|| self.http.get_text(&self.link, cancel))
            .await
            .map(String::as_str)
    }
}

/// Outcome of one strategy, kept for logging and the response diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionAttempt {
    pub strategy: &'static str,
    pub success: bool,
    pub candidates: usize,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct CascadeOutcome {
    pub candidates: Vec<StreamCandidate>,
    /// Name of the winning strategy
    pub source: Option<&'static str>,
    pub attempts: Vec<ExtractionAttempt>,
}

pub struct ExtractionCascade {
    strategies: Vec<Box<dyn Strategy>>,
    budget: Duration,
}

impl ExtractionCascade {
    pub fn new(strategies: Vec<Box<dyn Strategy>>, budget: Duration) -> Self {
        Self { strategies, budget }
    }

    /// The five standard strategies in their fixed order
    pub fn standard(
        http: HttpClient,
        extractors: Arc<ExtractorSet>,
        config: &CascadeConfig,
        fallback_url: String,
    ) -> Self {
        let miner = Arc::new(PatternMiner::new(config));
        let strategies: Vec<Box<dyn Strategy>> = vec![
            Box::new(AlternativeUrls::new(config)),
            Box::new(HostExtractors::new(http.clone(), extractors, config)),
            Box::new(PatternMining::new(miner.clone(), config)),
            Box::new(LinkedTunnels::new(http.clone(), miner, config)),
            Box::new(FallbackApi::new(http, fallback_url, config)),
        ];
        Self::new(strategies, config.budget())
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run strategies in order until one yields candidates.
    ///
    /// Strategy failures and timeouts are absorbed. Only the caller's own
    /// token firing turns into an error.
    pub async fn run(&self, request: &CascadeRequest, cancel: &CancellationToken) -> RelayResult<CascadeOutcome> {
        let deadline = Instant::now() + self.budget;
        let mut outcome = CascadeOutcome::default();

        for strategy in &self.strategies {
            if cancel.is_cancelled() {
                return Err(RelayError::Aborted);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "Cascade budget of {:?} exhausted before {} for {}",
                    self.budget,
                    strategy.name(),
                    request.link
                );
                break;
            }

            let limit = strategy.timeout().min(remaining);
            let attempt_token = cancel.child_token();
            let started = Instant::now();
            log::info!("Cascade trying {} for {} (limit {:?})", strategy.name(), request.link, limit);

            let result = match tokio::time::timeout(limit, strategy.attempt(request, &attempt_token)).await {
                Ok(result) => result,
                Err(_) => {
                    attempt_token.cancel();
                    Err(anyhow!("{} timed out after {:?}", strategy.name(), limit))
                }
            };
            let elapsed_ms = started.elapsed().as_millis();

            match result {
                Ok(candidates) if !candidates.is_empty() => {
                    let candidates = dedupe_candidates(candidates);
                    log::info!(
                        "Cascade strategy {} found {} candidates in {}ms",
                        strategy.name(),
                        candidates.len(),
                        elapsed_ms
                    );
                    outcome.attempts.push(ExtractionAttempt {
                        strategy: strategy.name(),
                        success: true,
                        candidates: candidates.len(),
                        elapsed_ms,
                        error: None,
                    });
                    outcome.candidates = candidates;
                    outcome.source = Some(strategy.name());
                    return Ok(outcome);
                }
                Ok(_) => {
                    log::info!("Cascade strategy {} found nothing", strategy.name());
                    outcome.attempts.push(ExtractionAttempt {
                        strategy: strategy.name(),
                        success: false,
                        candidates: 0,
                        elapsed_ms,
                        error: None,
                    });
                }
                Err(e) => {
                    if cancel.is_cancelled() && is_aborted(&e) {
                        return Err(RelayError::Aborted);
                    }
                    log::warn!("Cascade strategy {} failed: {:#}", strategy.name(), e);
                    outcome.attempts.push(ExtractionAttempt {
                        strategy: strategy.name(),
                        success: false,
                        candidates: 0,
                        elapsed_ms,
                        error: Some(format!("{:#}", e)),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(RelayError::Aborted);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        result: Vec<StreamCandidate>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Strategy for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn attempt(&self, _request: &CascadeRequest, _cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.result.clone())
        }
    }

    fn fixed(name: &'static str, links: &[&str], delay: Duration) -> (Box<dyn Strategy>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = Fixed {
            name,
            result: links.iter().map(|l| StreamCandidate::new(name, *l, "mp4")).collect(),
            delay,
            calls: calls.clone(),
        };
        (Box::new(strategy), calls)
    }

    fn request() -> CascadeRequest {
        let http = HttpClient::new(&HttpConfig::default(), &Default::default()).unwrap();
        CascadeRequest::new("mod", "https://example.com/movie/abc", "movie", http)
    }

    #[tokio::test]
    async fn test_stops_at_first_non_empty_strategy() {
        let (a, a_calls) = fixed("a", &[], Duration::ZERO);
        let (b, _) = fixed("b", &["https://cdn/x.mp4", "https://cdn/y.mp4"], Duration::ZERO);
        let (c, c_calls) = fixed("c", &["https://cdn/z.mp4"], Duration::ZERO);
        let cascade = ExtractionCascade::new(vec![a, b, c], Duration::from_secs(25));

        let outcome = cascade.run(&request(), &CancellationToken::new()).await.unwrap();

        let links: Vec<_> = outcome.candidates.iter().map(|c| c.link.as_str()).collect();
        assert_eq!(links, vec!["https://cdn/x.mp4", "https://cdn/y.mp4"]);
        assert_eq!(outcome.source, Some("b"));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_strategy_moves_on() {
        let (slow, _) = fixed("slow", &["https://cdn/late.mp4"], Duration::from_secs(5));
        let (next, next_calls) = fixed("next", &["https://cdn/ok.mp4"], Duration::ZERO);
        let cascade = ExtractionCascade::new(vec![slow, next], Duration::from_secs(25));

        let outcome = cascade.run(&request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.source, Some("next"));
        assert_eq!(next_calls.load(Ordering::SeqCst), 1);
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_skips_remaining() {
        let (slow, _) = fixed("slow", &[], Duration::from_millis(900));
        let (never, never_calls) = fixed("never", &["https://cdn/x.mp4"], Duration::ZERO);
        let cascade = ExtractionCascade::new(vec![slow, never], Duration::from_millis(500));

        let outcome = cascade.run(&request(), &CancellationToken::new()).await.unwrap();

        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.source, None);
        assert_eq!(never_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_caller_aborts() {
        let (a, a_calls) = fixed("a", &["https://cdn/x.mp4"], Duration::ZERO);
        let cascade = ExtractionCascade::new(vec![a], Duration::from_secs(25));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = cascade.run(&request(), &cancel).await;

        assert!(matches!(result, Err(RelayError::Aborted)));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_links_collapse() {
        let (a, _) = fixed("a", &["https://cdn/x.mp4", "https://cdn/x.mp4"], Duration::ZERO);
        let cascade = ExtractionCascade::new(vec![a], Duration::from_secs(25));

        let outcome = cascade.run(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.candidates.len(), 1);
    }
}
