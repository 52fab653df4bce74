// Last resort: hand the link to the separately deployed fallback resolver
// and accept whatever non-empty list it returns.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{CascadeRequest, Strategy};
use crate::config::CascadeConfig;
use crate::context::{HttpClient, HttpRequest};
use crate::providers::types::StreamCandidate;

#[derive(Deserialize)]
struct FallbackReply {
    #[serde(default)]
    data: Vec<StreamCandidate>,
}

pub struct FallbackApi {
    http: HttpClient,
    endpoint: String,
    timeout: Duration,
}

impl FallbackApi {
    pub fn new(http: HttpClient, endpoint: String, config: &CascadeConfig) -> Self {
        Self {
            http,
            endpoint,
            timeout: Duration::from_secs(config.fallback_timeout_secs),
        }
    }

    fn request_url(&self, link: &str, kind: &str) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}link={}&type={}",
            self.endpoint,
            separator,
            urlencoding::encode(link),
            urlencoding::encode(kind)
        )
    }
}

#[async_trait]
impl Strategy for FallbackApi {
    fn name(&self) -> &'static str {
        "stream-fallback-api"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, request: &CascadeRequest, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let url = self.request_url(&request.link, &request.kind);
        let response = self.http.send(HttpRequest::get(&url).timeout(self.timeout), cancel).await?;

        // An empty result comes back as 422; that is "nothing", not a failure
        if !response.is_success() {
            log::info!("Fallback resolver answered {} for {}", response.status, request.link);
            return Ok(Vec::new());
        }

        let reply: FallbackReply = serde_json::from_str(&response.body)?;
        Ok(reply.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::test_support::spawn_server;
    use axum::{extract::Query, http::StatusCode, routing::get, Json, Router};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_passes_link_and_accepts_data() {
        let base = spawn_server(Router::new().route(
            "/api/stream-fallback",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("link").map(String::as_str) == Some("https://site.example/a?b=1") {
                    Ok(Json(serde_json::json!({
                        "data": [{"server": "Direct Stream", "link": "https://cdn.example/a.mp4", "type": "mp4"}]
                    })))
                } else {
                    Err(StatusCode::UNPROCESSABLE_ENTITY)
                }
            }),
        ))
        .await;

        let http = HttpClient::new(&HttpConfig::default(), &Default::default()).unwrap();
        let api = FallbackApi::new(http.clone(), format!("{}/api/stream-fallback", base), &CascadeConfig::default());

        let found = api
            .attempt(
                &CascadeRequest::new("mod", "https://site.example/a?b=1", "movie", http.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(found, vec![StreamCandidate::new("Direct Stream", "https://cdn.example/a.mp4", "mp4")]);

        let nothing = api
            .attempt(
                &CascadeRequest::new("mod", "https://site.example/other", "movie", http),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(nothing.is_empty());
    }
}
