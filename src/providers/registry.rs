// Module registry
//
// Process-wide TTL cache of provider module sets:
// - Populated on miss, one independent fetch per role
// - Entries older than the TTL are treated as absent
// - Entries are replaced wholesale, never mutated in place
// - Explicit invalidation per provider or for everything

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::loader::ModuleSource;
use super::types::{ModuleRole, ProviderKey, ProviderModuleSet};

/// Client-reported cache age (ms) above which cached modules are refetched
pub const STALE_CLIENT_CACHE_MS: u64 = 5 * 60 * 1000;

struct CacheEntry {
    modules: Arc<ProviderModuleSet>,
    fetched_at: Instant,
}

pub struct ModuleRegistry {
    source: Arc<dyn ModuleSource>,
    ttl: Duration,
    cache: RwLock<HashMap<ProviderKey, CacheEntry>>,
}

/// Whether a request's `refresh` / `cache_age` parameters force a refetch
pub fn wants_refresh(refresh: bool, cache_age_ms: Option<u64>) -> bool {
    refresh || cache_age_ms.map_or(false, |age| age > STALE_CLIENT_CACHE_MS)
}

impl ModuleRegistry {
    pub fn new(source: Arc<dyn ModuleSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Module set for a raw provider value, from cache when fresh
    pub async fn resolve(&self, provider: &str, cancel: &CancellationToken) -> Arc<ProviderModuleSet> {
        let key = ProviderKey::normalize(provider);

        if let Some(modules) = self.cached(&key) {
            log::debug!("Module cache hit for {}", key);
            return modules;
        }

        log::info!("Fetching modules for provider {} (raw: {})", key, provider);
        let fetches = ModuleRole::ALL.map(|role| {
            let key = &key;
            async move { (role, self.source.fetch(key, role, cancel).await) }
        });

        let mut modules = ProviderModuleSet::new();
        for (role, source) in join_all(fetches).await {
            if let Some(source) = source {
                modules.insert(role, source);
            }
        }

        let modules = Arc::new(modules);
        // Roles cut short by cancellation came back absent, not missing
        if cancel.is_cancelled() {
            log::debug!("Fetch for {} cancelled, not caching {:?}", key, modules.roles());
            return modules;
        }
        if modules.is_empty() {
            log::warn!("No modules available for provider {}", key);
            return modules;
        }

        log::info!("Cached {} modules for {}: {:?}", modules.len(), key, modules.roles());
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                key,
                CacheEntry {
                    modules: modules.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        modules
    }

    fn cached(&self, key: &ProviderKey) -> Option<Arc<ProviderModuleSet>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(key)?;
        (entry.fetched_at.elapsed() < self.ttl).then(|| entry.modules.clone())
    }

    /// Drop one provider's entry, or every entry when `provider` is `None`
    pub fn invalidate(&self, provider: Option<&str>) {
        let Ok(mut cache) = self.cache.write() else {
            return;
        };
        match provider {
            Some(raw) => {
                let key = ProviderKey::normalize(raw);
                cache.remove(&key);
                log::info!("Cleared module cache for {}", key);
            }
            None => {
                cache.clear();
                log::info!("Cleared all module caches");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed set of roles and counts every fetch
    struct CountingSource {
        roles: Vec<ModuleRole>,
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn new(roles: &[ModuleRole]) -> Arc<Self> {
            Arc::new(Self {
                roles: roles.to_vec(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModuleSource for CountingSource {
        async fn fetch(&self, key: &ProviderKey, role: ModuleRole, _cancel: &CancellationToken) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.roles
                .contains(&role)
                .then(|| format!("// {} {}", key, role))
        }
    }

    const TTL: Duration = Duration::from_secs(600);

    #[tokio::test(start_paused = true)]
    async fn test_alias_resolves_and_second_call_hits_cache() {
        let source = CountingSource::new(&ModuleRole::ALL);
        let registry = ModuleRegistry::new(source.clone(), TTL);
        let cancel = CancellationToken::new();

        let first = registry.resolve("modflix", &cancel).await;
        assert_eq!(first.len(), 5);
        assert_eq!(first.get(ModuleRole::Stream).as_deref(), Some("// mod stream"));
        assert_eq!(source.calls(), 5);

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        let second = registry.resolve("mod", &cancel).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let source = CountingSource::new(&ModuleRole::ALL);
        let registry = ModuleRegistry::new(source.clone(), TTL);
        let cancel = CancellationToken::new();

        registry.resolve("vega", &cancel).await;
        tokio::time::advance(TTL).await;
        registry.resolve("vega", &cancel).await;
        assert_eq!(source.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refetch() {
        let source = CountingSource::new(&ModuleRole::ALL);
        let registry = ModuleRegistry::new(source.clone(), TTL);
        let cancel = CancellationToken::new();

        registry.resolve("moviesmod", &cancel).await;
        registry.invalidate(Some("modflix"));
        registry.resolve("mod", &cancel).await;
        assert_eq!(source.calls(), 10);

        registry.invalidate(None);
        registry.resolve("mod", &cancel).await;
        assert_eq!(source.calls(), 15);
    }

    #[tokio::test]
    async fn test_partial_set_is_cached() {
        let source = CountingSource::new(&[ModuleRole::Posts, ModuleRole::Stream]);
        let registry = ModuleRegistry::new(source.clone(), TTL);
        let cancel = CancellationToken::new();

        let modules = registry.resolve("drive", &cancel).await;
        assert_eq!(modules.roles(), vec![ModuleRole::Posts, ModuleRole::Stream]);
        registry.resolve("drive", &cancel).await;
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test]
    async fn test_empty_result_is_not_cached() {
        let source = CountingSource::new(&[]);
        let registry = ModuleRegistry::new(source.clone(), TTL);
        let cancel = CancellationToken::new();

        assert!(registry.resolve("unknown", &cancel).await.is_empty());
        registry.resolve("unknown", &cancel).await;
        assert_eq!(source.calls(), 10);
    }

    /// Posts answers at once; Stream takes a while and gives up on cancel
    struct SlowStreamSource;

    #[async_trait]
    impl ModuleSource for SlowStreamSource {
        async fn fetch(&self, _key: &ProviderKey, role: ModuleRole, cancel: &CancellationToken) -> Option<String> {
            match role {
                ModuleRole::Posts => Some("// posts".to_string()),
                ModuleRole::Stream => tokio::select! {
                    _ = cancel.cancelled() => None,
                    _ = tokio::time::sleep(Duration::from_millis(200)) => Some("// stream".to_string()),
                },
                _ => None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_is_not_cached() {
        let registry = ModuleRegistry::new(Arc::new(SlowStreamSource), TTL);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let partial = registry.resolve("mod", &cancel).await;
        assert_eq!(partial.roles(), vec![ModuleRole::Posts]);

        let full = registry.resolve("mod", &CancellationToken::new()).await;
        assert_eq!(full.roles(), vec![ModuleRole::Posts, ModuleRole::Stream]);
    }

    #[test]
    fn test_wants_refresh() {
        assert!(wants_refresh(true, None));
        assert!(!wants_refresh(false, None));
        assert!(!wants_refresh(false, Some(300_000)));
        assert!(wants_refresh(false, Some(300_001)));
    }
}
