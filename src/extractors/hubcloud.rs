// HubCloud / VCloud download portals
//
// Handles:
// - `var url = '...'` redirects, with base64 `r=` payloads
// - fa-file-download anchors pointing at the real download page
// - Download buttons (btn-success / btn-danger / btn-secondary) mapped to
//   Cf Worker, Pixeldrain, hubcloud, CfStorage, FastDl and HubCdn servers

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{pixeldrain_download, resolve_href, HostExtractor};
use crate::context::html;
use crate::context::http::{is_aborted, HttpClient, HttpRequest};
use crate::providers::types::{dedupe_candidates, StreamCandidate};

lazy_static! {
    static ref VAR_URL: Regex = Regex::new(r"var\s+url\s*=\s*'([^']+)';").unwrap();
}

pub struct HubCloud;

fn decode_base64(value: &str) -> Option<String> {
    let engines = [
        base64::engine::general_purpose::STANDARD,
        base64::engine::general_purpose::STANDARD_NO_PAD,
    ];
    engines
        .iter()
        .find_map(|engine| engine.decode(value.trim()).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|s| !s.is_empty())
}

/// Where the portal page sends the browser next
fn download_page(page: &str, url: &Url) -> Url {
    let mut target = VAR_URL.captures(page).and_then(|c| c.get(1)).map(|m| {
        let raw = m.as_str();
        raw.split_once("r=")
            .and_then(|(_, payload)| decode_base64(payload))
            .unwrap_or_else(|| raw.to_string())
    });

    if let Ok(anchors) = html::select(page, "a[href]") {
        if let Some(href) = anchors
            .iter()
            .filter(|a| a.inner.contains("fa-file-download") || a.has_class("fa-file-download"))
            .find_map(|a| a.attr("href").and_then(|h| resolve_href(h, url)))
        {
            target = Some(href);
        }
    }

    target
        .and_then(|t| url.join(&t).ok())
        .unwrap_or_else(|| url.clone())
}

impl HubCloud {
    /// Follow a hubcloud gateway link with HEAD and read the `link=` target
    async fn gateway_target(&self, link: &str, http: &HttpClient, cancel: &CancellationToken) -> Result<String> {
        let response = http.send(HttpRequest::head(link), cancel).await?;
        Ok(response
            .url
            .split_once("link=")
            .map(|(_, target)| target.to_string())
            .unwrap_or_else(|| link.to_string()))
    }
}

#[async_trait]
impl HostExtractor for HubCloud {
    fn name(&self) -> &'static str {
        "hubcloud"
    }

    fn recognizes(&self, url: &Url, page: &str) -> bool {
        url.host_str()
            .map_or(false, |h| h.contains("hubcloud") || h.contains("vcloud"))
            || VAR_URL.is_match(page)
            || page.contains("fa-file-download")
    }

    async fn extract_page(
        &self,
        url: &Url,
        page: &str,
        http: &HttpClient,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamCandidate>> {
        let target = download_page(page, url);
        let (page_url, page) = if &target == url {
            (target, page.to_string())
        } else {
            log::debug!("[hubcloud] Download page: {}", target);
            let body = http.get_text(target.as_str(), cancel).await?;
            (target, body)
        };

        let buttons = html::select(&page, "a.btn-success[href], a.btn-danger[href], a.btn-secondary[href]")?;
        let mut candidates = Vec::new();

        for button in buttons {
            let Some(link) = button.attr("href").and_then(|h| resolve_href(h, &page_url)) else {
                continue;
            };

            if link.contains(".dev") && !link.contains("/?id=") {
                candidates.push(StreamCandidate::new("Cf Worker", &link, "mkv"));
            }
            if link.contains("pixeld") {
                candidates.push(StreamCandidate::new("Pixeldrain", pixeldrain_download(&link), "mkv"));
            }
            if link.contains("hubcloud") || link.contains("/?id=") {
                match self.gateway_target(&link, http, cancel).await {
                    Ok(resolved) => candidates.push(StreamCandidate::new("hubcloud", resolved, "mkv")),
                    Err(e) if is_aborted(&e) => return Err(e),
                    Err(e) => log::warn!("[hubcloud] Gateway {} failed: {:#}", link, e),
                }
            }
            if link.contains("cloudflarestorage") {
                candidates.push(StreamCandidate::new("CfStorage", &link, "mkv"));
            }
            if link.contains("fastdl") {
                candidates.push(StreamCandidate::new("FastDl", &link, "mkv"));
            }
            if link.contains("hubcdn") {
                candidates.push(StreamCandidate::new("HubCdn", &link, "mkv"));
            }
        }

        log::info!("[hubcloud] {} candidates from {}", candidates.len(), page_url);
        Ok(dedupe_candidates(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::test_support::spawn_server;
    use axum::{
        http::{header, StatusCode},
        response::Html,
        routing::get,
        Router,
    };
    use std::collections::BTreeMap;

    fn http() -> HttpClient {
        HttpClient::new(&HttpConfig::default(), &BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_var_url_with_base64_payload() {
        let base = Url::parse("https://hubcloud.example/drive/1").unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode("https://vcloud.example/dl/9");
        let page = format!("<script>var url = 'https://gate.example/?r={}';</script>", encoded);
        assert_eq!(download_page(&page, &base).as_str(), "https://vcloud.example/dl/9");
    }

    #[test]
    fn test_download_anchor_wins_and_relative_resolves() {
        let base = Url::parse("https://hubcloud.example/drive/1").unwrap();
        let page = r#"<script>var url = 'https://ignored.example/x';</script>
            <a class="btn" href="/gen/2"><i class="fas fa-file-download"></i> Generate</a>"#;
        assert_eq!(download_page(page, &base).as_str(), "https://hubcloud.example/gen/2");
    }

    #[tokio::test]
    async fn test_buttons_map_to_servers() {
        let base = spawn_server(
            Router::new()
                .route(
                    "/drive/1",
                    get(|| async { Html(r#"<a href="/gen/2"><i class="fa-file-download"></i>Download</a>"#) }),
                )
                .route(
                    "/gen/2",
                    get(|| async {
                        Html(
                            r#"<a class="btn btn-success" href="https://worker.workers.dev/file.mkv">Cf</a>
                               <a class="btn btn-danger" href="https://pixeldrain.com/u/ZZ">PD</a>
                               <a class="btn btn-secondary" href="https://bucket.r2.cloudflarestorage.com/f.mkv">S3</a>
                               <a class="btn btn-success" href="https://fastdl.example/f.mkv">Fast</a>
                               <a class="btn btn-primary" href="https://ignored.example/f.mkv">Other</a>"#,
                        )
                    }),
                ),
        )
        .await;

        let candidates = HubCloud
            .extract(&format!("{}/drive/1", base), &http(), &CancellationToken::new())
            .await
            .unwrap();

        let servers: Vec<_> = candidates.iter().map(|c| c.server.as_str()).collect();
        assert_eq!(servers, vec!["Cf Worker", "Pixeldrain", "CfStorage", "FastDl"]);
        assert_eq!(candidates[1].link, "https://pixeldrain.com/api/file/ZZ?download");
    }

    #[tokio::test]
    async fn test_gateway_link_resolved_through_redirect() {
        let base = spawn_server(
            Router::new()
                .route(
                    "/hubcloud/go",
                    get(|| async {
                        (
                            StatusCode::FOUND,
                            [(header::LOCATION, "/done?link=https://files.example/movie.mkv")],
                        )
                    }),
                )
                .route("/done", get(|| async { "ok" })),
        )
        .await;

        let page = format!(r#"<a class="btn btn-success" href="{}/hubcloud/go">Server</a>"#, base);
        let url = Url::parse(&format!("{}/page", base)).unwrap();
        let candidates = HubCloud
            .extract_page(&url, &page, &http(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            candidates,
            vec![StreamCandidate::new("hubcloud", "https://files.example/movie.mkv", "mkv")]
        );
    }
}
