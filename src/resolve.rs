// Provider operations
//
// The per-request state machine behind every provider endpoint:
// - Resolving: registry lookup, then the module for the needed role is
//   executed in the sandbox (NoModule when the role or export is missing)
// - For streams, an empty getStream result moves to Cascading; the first
//   strategy with candidates ends in Resolved, exhaustion in NoCandidates
//
// Posts, search, info, episodes and home are thin pass-throughs to the
// corresponding module exports.

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cascade::{CascadeRequest, ExtractionAttempt, ExtractionCascade, StreamResolver};
use crate::context::http::Aborted;
use crate::error::{RelayError, RelayResult};
use crate::providers::types::{ModuleRole, ProviderKey, StreamCandidate};
use crate::providers::ModuleRegistry;
use crate::sandbox::{Export, ExecutedModule, ExportSet, ModuleLabel, SandboxExecutor};

/// Catalog sections loaded eagerly by the home feed
const HOME_SECTIONS: usize = 4;

/// Response of a stream resolution
#[derive(Debug, Serialize)]
pub struct StreamResolution {
    pub data: Vec<StreamCandidate>,
    /// `provider`, or the name of the cascade strategy that found `data`
    pub source: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<ExtractionAttempt>,
}

#[derive(Debug, Serialize)]
pub struct HomeSection {
    pub title: String,
    pub filter: String,
    #[serde(rename = "Posts")]
    pub posts: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HomeFeed {
    pub catalog: Value,
    pub data: Vec<HomeSection>,
}

/// What a provider's modules look like from the outside
#[derive(Debug, Serialize)]
pub struct ProviderDiagnostics {
    pub provider: String,
    pub modules: Vec<ModuleRole>,
    #[serde(rename = "moduleSizes")]
    pub module_sizes: BTreeMap<ModuleRole, usize>,
    pub fingerprints: BTreeMap<ModuleRole, String>,
    pub exports: BTreeMap<ModuleRole, ExportSet>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<ModuleRole, String>,
    pub extractors: Vec<&'static str>,
    pub strategies: Vec<&'static str>,
}

/// Keep well-formed candidates from whatever a module returned
pub fn candidates_from(value: Value) -> Vec<StreamCandidate> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    let total = items.len();
    let candidates: Vec<StreamCandidate> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<StreamCandidate>(item).ok())
        .filter(|c| !c.link.trim().is_empty())
        .collect();
    if candidates.len() < total {
        log::warn!("Dropped {} malformed stream entries", total - candidates.len());
    }
    candidates
}

fn array_or_empty(value: Value) -> Value {
    if value.is_array() {
        value
    } else {
        json!([])
    }
}

/// getStream of an executed module, re-invoked by the cascade
struct ModuleStreamResolver {
    module: ExecutedModule,
}

#[async_trait]
impl StreamResolver for ModuleStreamResolver {
    async fn resolve(&self, link: &str, kind: &str, cancel: &CancellationToken) -> anyhow::Result<Vec<StreamCandidate>> {
        match self
            .module
            .call(Export::GetStream, json!({ "link": link, "type": kind }), cancel)
            .await
        {
            Ok(value) => Ok(candidates_from(value)),
            Err(RelayError::Aborted) => Err(Aborted.into()),
            Err(e) => Err(anyhow!(e)),
        }
    }
}

pub struct ProviderService {
    registry: Arc<ModuleRegistry>,
    executor: SandboxExecutor,
    cascade: Arc<ExtractionCascade>,
}

impl ProviderService {
    pub fn new(registry: Arc<ModuleRegistry>, executor: SandboxExecutor, cascade: Arc<ExtractionCascade>) -> Self {
        Self {
            registry,
            executor,
            cascade,
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Execute the module for `role`, or None when the provider lacks it
    async fn module(
        &self,
        provider: &str,
        role: ModuleRole,
        cancel: &CancellationToken,
    ) -> RelayResult<Option<ExecutedModule>> {
        let set = self.registry.resolve(provider, cancel).await;
        if cancel.is_cancelled() {
            return Err(RelayError::Aborted);
        }
        let Some(source) = set.get(role) else {
            return Ok(None);
        };
        let label = ModuleLabel::new(ProviderKey::normalize(provider).as_str(), role);
        self.executor.execute(source, label, cancel).await.map(Some)
    }

    async fn require_module(
        &self,
        provider: &str,
        role: ModuleRole,
        cancel: &CancellationToken,
    ) -> RelayResult<ExecutedModule> {
        self.module(provider, role, cancel)
            .await?
            .ok_or_else(|| RelayError::ModuleUnavailable {
                provider: provider.to_string(),
                role: role.to_string(),
            })
    }

    /// Resolve playable candidates for `link`: provider first, cascade if empty
    pub async fn stream(
        &self,
        provider: &str,
        link: &str,
        kind: &str,
        cancel: &CancellationToken,
    ) -> RelayResult<StreamResolution> {
        let module = self.require_module(provider, ModuleRole::Stream, cancel).await?;
        let value = module
            .call(Export::GetStream, json!({ "link": link, "type": kind }), cancel)
            .await?;

        let data = candidates_from(value);
        if !data.is_empty() {
            log::info!("[{}] getStream returned {} candidates", module.label(), data.len());
            return Ok(StreamResolution {
                data,
                source: "provider",
                attempts: Vec::new(),
            });
        }

        log::warn!(
            "[{}] getStream returned nothing for {}, starting extraction cascade",
            module.label(),
            link
        );
        let key = ProviderKey::normalize(provider);
        let request = CascadeRequest::new(key.as_str(), link, kind, self.executor.context().http.clone())
            .with_resolver(Arc::new(ModuleStreamResolver { module }));
        let outcome = self.cascade.run(&request, cancel).await?;

        match outcome.source {
            Some(source) => Ok(StreamResolution {
                data: outcome.candidates,
                source,
                attempts: outcome.attempts,
            }),
            None => Err(RelayError::NoCandidates {
                provider: provider.to_string(),
                link: link.to_string(),
            }),
        }
    }

    pub async fn posts(&self, provider: &str, filter: &str, page: u32, cancel: &CancellationToken) -> RelayResult<Value> {
        let module = self.require_module(provider, ModuleRole::Posts, cancel).await?;
        let value = module
            .call(
                Export::GetPosts,
                json!({ "filter": filter, "page": page, "providerValue": provider }),
                cancel,
            )
            .await?;
        Ok(array_or_empty(value))
    }

    pub async fn search(&self, provider: &str, query: &str, page: u32, cancel: &CancellationToken) -> RelayResult<Value> {
        let module = self.require_module(provider, ModuleRole::Posts, cancel).await?;
        let value = module
            .call(
                Export::GetSearchPosts,
                json!({ "searchQuery": query, "page": page, "providerValue": provider }),
                cancel,
            )
            .await?;
        Ok(array_or_empty(value))
    }

    pub async fn info(&self, provider: &str, link: &str, cancel: &CancellationToken) -> RelayResult<Value> {
        let module = self.require_module(provider, ModuleRole::Meta, cancel).await?;
        module
            .call(Export::GetMeta, json!({ "link": link, "provider": provider }), cancel)
            .await
    }

    /// Episode links from the stream module, else the episodes module; an
    /// empty list when neither exports them
    pub async fn episodes(&self, provider: &str, url: &str, cancel: &CancellationToken) -> RelayResult<Value> {
        for role in [ModuleRole::Stream, ModuleRole::Episodes] {
            let Some(module) = self.module(provider, role, cancel).await? else {
                continue;
            };
            if module.has(Export::GetEpisodeLinks) {
                let value = module
                    .call(Export::GetEpisodeLinks, json!({ "url": url }), cancel)
                    .await?;
                return Ok(array_or_empty(value));
            }
        }
        Ok(json!([]))
    }

    /// Catalog plus the first page of its leading sections. A failing section
    /// carries its own error instead of failing the feed.
    pub async fn home(&self, provider: &str, page: u32, cancel: &CancellationToken) -> RelayResult<HomeFeed> {
        let catalog = match self.module(provider, ModuleRole::Catalog, cancel).await? {
            Some(module) => module.value("catalog").cloned().map(array_or_empty).unwrap_or_else(|| json!([])),
            None => json!([]),
        };

        let posts = self
            .module(provider, ModuleRole::Posts, cancel)
            .await?
            .filter(|m| m.has(Export::GetPosts));
        if posts.is_none() {
            log::warn!("No getPosts found for provider {}", provider);
        }

        let sections: Vec<(String, String)> = catalog
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .take(HOME_SECTIONS)
                    .map(|entry| {
                        let field = |name: &str| entry.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
                        (field("title"), field("filter"))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let data = join_all(sections.into_iter().map(|(title, filter)| {
            let posts = posts.as_ref();
            async move {
                let Some(module) = posts else {
                    return HomeSection {
                        title,
                        filter,
                        posts: json!([]),
                        error: None,
                    };
                };
                let argument = json!({ "filter": filter, "page": page, "providerValue": provider });
                match module.call(Export::GetPosts, argument, cancel).await {
                    Ok(value) => HomeSection {
                        title,
                        filter,
                        posts: array_or_empty(value),
                        error: None,
                    },
                    Err(e) => {
                        log::error!("Error in getPosts for {}: {}", filter, e);
                        HomeSection {
                            title,
                            filter,
                            posts: json!([]),
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        }))
        .await;

        if cancel.is_cancelled() {
            return Err(RelayError::Aborted);
        }
        Ok(HomeFeed { catalog, data })
    }

    /// Roles present, sizes, fingerprints and normalized exports per module
    pub async fn diagnostics(&self, provider: &str, cancel: &CancellationToken) -> RelayResult<ProviderDiagnostics> {
        let key = ProviderKey::normalize(provider);
        let set = self.registry.resolve(provider, cancel).await;

        let mut report = ProviderDiagnostics {
            provider: key.to_string(),
            modules: set.roles(),
            module_sizes: BTreeMap::new(),
            fingerprints: BTreeMap::new(),
            exports: BTreeMap::new(),
            errors: BTreeMap::new(),
            extractors: crate::context::EXTRACTOR_NAMES.to_vec(),
            strategies: self.cascade.strategy_names(),
        };

        for role in set.roles() {
            let Some(source) = set.get(role) else {
                continue;
            };
            report.module_sizes.insert(role, source.len());
            if let Some(fingerprint) = set.fingerprint(role) {
                report.fingerprints.insert(role, fingerprint);
            }
            match self
                .executor
                .execute(source, ModuleLabel::new(key.as_str(), role), cancel)
                .await
            {
                Ok(module) => {
                    report.exports.insert(role, module.exports().clone());
                }
                Err(RelayError::Aborted) => return Err(RelayError::Aborted),
                Err(e) => {
                    report.errors.insert(role, e.to_string());
                }
            }
        }

        Ok(report)
    }
}
