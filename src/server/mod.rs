// HTTP server
//
// Serves the provider API under /api:
// - Permissive CORS for browser players
// - Per-request id (x-request-id) and a log line with status and timing
// - Graceful shutdown on Ctrl-C, which also cancels in-flight resolutions

mod routes;

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::cascade::ExtractionCascade;
use crate::config::Config;
use crate::context::{common_headers, HttpClient, ProviderContext};
use crate::extractors::ExtractorSet;
use crate::fallback::FallbackResolver;
use crate::providers::{BaseUrlResolver, ManifestClient, MirrorLoader, ModuleRegistry};
use crate::proxy::StreamProxy;
use crate::resolve::ProviderService;
use crate::sandbox::SandboxExecutor;

pub struct AppState {
    pub service: ProviderService,
    pub manifest: ManifestClient,
    pub fallback: FallbackResolver,
    pub proxy: StreamProxy,
    /// Hides script stacks from error bodies
    pub production: bool,
    /// Parent of every request's token; fired on shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire every component from configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let http = HttpClient::new(&config.http, &common_headers())?;
        let extractors = Arc::new(ExtractorSet::default());
        let base_urls = Arc::new(BaseUrlResolver::new(http.clone(), &config.manifest));
        let context = ProviderContext::new(http.clone(), common_headers(), base_urls, extractors.clone());

        let loader = MirrorLoader::new(http.clone(), &config.modules);
        let registry = Arc::new(ModuleRegistry::new(Arc::new(loader), config.modules.ttl()));
        let executor = SandboxExecutor::new(context, config.sandbox.clone());
        let cascade = ExtractionCascade::standard(http.clone(), extractors, &config.cascade, config.fallback_url());

        log::info!(
            "Module mirrors: {:?}, cascade: {:?}",
            config.modules.mirrors,
            cascade.strategy_names()
        );

        Ok(Self {
            service: ProviderService::new(registry, executor, Arc::new(cascade)),
            manifest: ManifestClient::new(http.clone(), &config.manifest),
            fallback: FallbackResolver::new(http, &config.cascade),
            proxy: StreamProxy::new(&config.proxy)?,
            production: config.server.production,
            shutdown: CancellationToken::new(),
        })
    }

    /// A token that fires when the request is dropped or the server stops
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(routes::health))
        .route("/providers", get(routes::providers))
        .route("/posts", get(routes::posts))
        .route("/search", get(routes::search))
        .route("/info", get(routes::info))
        .route("/episodes", get(routes::episodes))
        .route("/home", get(routes::home))
        .route("/stream", get(routes::stream))
        .route("/stream-fallback", get(routes::stream_fallback))
        .route("/proxy", get(routes::proxy))
        .route("/test-provider", get(routes::test_provider));

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn(log_requests))
        .layer(cors)
        .with_state(state)
}

// Tag every request with an id and log its outcome
async fn log_requests(mut request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    if let Ok(value) = HeaderValue::from_str(&id) {
        request.headers_mut().insert("x-request-id", value.clone());
    }
    let mut response = next.run(request).await;

    log::info!(
        "[{}] {} {} -> {} in {}ms",
        &id[..8],
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Bind and serve until Ctrl-C
pub async fn serve(config: &Config) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_config(config)?);
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    log::info!("Provider relay listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            log::info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests;
