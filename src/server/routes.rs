// API handlers
//
// Each handler validates its query, applies the refresh / cache_age
// override, and hands off to the provider service. Request tokens are
// cancelled when the handler future is dropped (client went away).

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::AppState;
use crate::error::{RelayError, RelayResult};
use crate::providers::registry::wants_refresh;

#[derive(Debug, Default, Deserialize)]
pub struct ApiQuery {
    provider: Option<String>,
    link: Option<String>,
    url: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    filter: Option<String>,
    q: Option<String>,
    page: Option<u32>,
    referer: Option<String>,
    action: Option<String>,
    refresh: Option<String>,
    cache_age: Option<u64>,
}

/// Non-empty, trimmed query value
fn param(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(value: &'a Option<String>, message: &str) -> RelayResult<&'a str> {
    param(value).ok_or_else(|| RelayError::BadRequest(message.to_string()))
}

/// Render a result, stripping script stacks in production
fn respond<T: Serialize>(state: &AppState, result: RelayResult<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(RelayError::Execution { message, stack }) if state.production => {
            log::debug!("Suppressed stack: {:?}", stack);
            RelayError::Execution { message, stack: None }.into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Drop the provider's cached modules when the client asked for it
fn apply_refresh(state: &AppState, provider: &str, query: &ApiQuery) {
    let refresh = query.refresh.as_deref() == Some("true");
    if wants_refresh(refresh, query.cache_age) {
        log::info!("Refreshing modules for {} (refresh={}, cache_age={:?})", provider, refresh, query.cache_age);
        state.service.registry().invalidate(Some(provider));
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn providers(State(state): State<Arc<AppState>>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = state
        .manifest
        .list(&cancel)
        .await
        .map(|providers| json!({ "providers": providers }))
        .map_err(|e| RelayError::UpstreamUnavailable(format!("{:#}", e)));
    respond(&state, result)
}

pub async fn posts(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = async {
        let (provider, filter) = match (param(&query.provider), param(&query.filter)) {
            (Some(p), Some(f)) => (p, f),
            _ => return Err(RelayError::BadRequest("provider and filter required".to_string())),
        };
        apply_refresh(&state, provider, &query);
        let data = state
            .service
            .posts(provider, filter, query.page.unwrap_or(1), &cancel)
            .await?;
        Ok(json!({ "data": data }))
    }
    .await;
    respond(&state, result)
}

pub async fn search(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = async {
        let (provider, q) = match (param(&query.provider), param(&query.q)) {
            (Some(p), Some(q)) => (p, q),
            _ => return Err(RelayError::BadRequest("provider and q required".to_string())),
        };
        apply_refresh(&state, provider, &query);
        let data = state
            .service
            .search(provider, q, query.page.unwrap_or(1), &cancel)
            .await?;
        Ok(json!({ "data": data }))
    }
    .await;
    respond(&state, result)
}

pub async fn info(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = async {
        let (provider, link) = match (param(&query.provider), param(&query.link)) {
            (Some(p), Some(l)) => (p, l),
            _ => return Err(RelayError::BadRequest("provider and link required".to_string())),
        };
        apply_refresh(&state, provider, &query);
        let data = state.service.info(provider, link, &cancel).await?;
        Ok(json!({ "data": data }))
    }
    .await;
    respond(&state, result)
}

pub async fn episodes(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = async {
        let (provider, url) = match (param(&query.provider), param(&query.url)) {
            (Some(p), Some(u)) => (p, u),
            _ => return Err(RelayError::BadRequest("provider and url required".to_string())),
        };
        apply_refresh(&state, provider, &query);
        let data = state.service.episodes(provider, url, &cancel).await?;
        Ok(json!({ "data": data }))
    }
    .await;
    respond(&state, result)
}

pub async fn home(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = async {
        let provider = required(&query.provider, "provider required")?;
        apply_refresh(&state, provider, &query);
        state.service.home(provider, query.page.unwrap_or(1), &cancel).await
    }
    .await;
    respond(&state, result)
}

pub async fn stream(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = async {
        let (provider, link) = match (param(&query.provider), param(&query.link)) {
            (Some(p), Some(l)) => (p, l),
            _ => return Err(RelayError::BadRequest("provider and link required".to_string())),
        };
        let kind = param(&query.kind).unwrap_or("movie");
        log::info!("Stream request: provider={}, type={}, link={}", provider, kind, link);
        apply_refresh(&state, provider, &query);
        state.service.stream(provider, link, kind, &cancel).await
    }
    .await;
    respond(&state, result)
}

pub async fn stream_fallback(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = async {
        let link = required(&query.link, "link parameter required")?;
        let data = state.fallback.resolve(link, &cancel).await.map_err(|e| {
            if cancel.is_cancelled() {
                RelayError::Aborted
            } else {
                RelayError::Internal(e)
            }
        })?;
        if data.is_empty() {
            return Err(RelayError::NoCandidates {
                provider: "stream-fallback".to_string(),
                link: link.to_string(),
            });
        }
        log::info!("Fallback resolver found {} streams for {}", data.len(), link);
        Ok(json!({ "data": data, "source": "fallback-extraction", "method": "direct-parsing" }))
    }
    .await;
    respond(&state, result)
}

/// Body streaming outlives this handler, so the token is not tied to it
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(url) = param(&query.url) else {
        return RelayError::BadRequest("url parameter required".to_string()).into_response();
    };
    let result = state
        .proxy
        .relay(
            url,
            param(&query.referer),
            headers.get(header::RANGE),
            state.request_token(),
        )
        .await;
    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

pub async fn test_provider(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let result = async {
        let provider = required(&query.provider, "provider required")?;
        match param(&query.action).unwrap_or("info") {
            "clear-cache" => {
                state.service.registry().invalidate(Some(provider));
                Ok(json!({ "success": true, "message": format!("Cache cleared for provider: {}", provider) }))
            }
            "info" => {
                apply_refresh(&state, provider, &query);
                let report = state.service.diagnostics(provider, &cancel).await?;
                serde_json::to_value(report).map_err(|e| RelayError::Internal(e.into()))
            }
            other => Err(RelayError::BadRequest(format!(
                "Invalid action '{}', expected info or clear-cache",
                other
            ))),
        }
    }
    .await;
    respond(&state, result)
}
