// GoFile file hosting
//
// ID-based API: create a guest account token, read the website token from
// the site's global.js, then list the folder contents. The first child's
// link is only downloadable with the account token as a cookie.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::HostExtractor;
use crate::context::http::{HttpClient, HttpRequest};
use crate::providers::types::StreamCandidate;

lazy_static! {
    static ref WEBSITE_TOKEN: Regex = Regex::new(r#"appdata\.wt\s*=\s*["']([^"']+)["']"#).unwrap();
}

pub struct GoFile {
    api_base: String,
    site_base: String,
}

impl Default for GoFile {
    fn default() -> Self {
        Self::with_bases("https://api.gofile.io", "https://gofile.io")
    }
}

/// Download link plus the token that must accompany it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GoFileLink {
    pub link: String,
    pub token: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct Account {
    token: String,
}

#[derive(Deserialize)]
struct Contents {
    #[serde(default)]
    children: serde_json::Map<String, serde_json::Value>,
}

/// Content ID from a share URL, or the input itself when it is a bare ID
pub fn content_id(link: &str) -> String {
    Url::parse(link)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| link.trim().to_string())
}

impl GoFile {
    pub fn with_bases(api_base: &str, site_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            site_base: site_base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn resolve(&self, id: &str, http: &HttpClient, cancel: &CancellationToken) -> Result<GoFileLink> {
        let account: Envelope<Account> = http
            .fetch_json(HttpRequest::post(format!("{}/accounts", self.api_base), None), cancel)
            .await
            .context("GoFile account creation failed")?;
        let token = account.data.token;

        let script = http
            .get_text(&format!("{}/dist/js/global.js", self.site_base), cancel)
            .await?;
        let wt = WEBSITE_TOKEN
            .captures(&script)
            .map(|c| c[1].to_string())
            .ok_or_else(|| anyhow!("GoFile website token not found"))?;

        let request = HttpRequest::get(format!(
            "{}/contents/{}?wt={}",
            self.api_base,
            urlencoding::encode(id),
            urlencoding::encode(&wt)
        ))
        .header("Authorization", format!("Bearer {}", token));
        let contents: Envelope<Contents> = http.fetch_json(request, cancel).await?;

        let link = contents
            .data
            .children
            .values()
            .find_map(|child| child.get("link").and_then(|l| l.as_str()))
            .ok_or_else(|| anyhow!("GoFile content {} has no downloadable children", id))?
            .to_string();

        Ok(GoFileLink { link, token })
    }
}

#[async_trait]
impl HostExtractor for GoFile {
    fn name(&self) -> &'static str {
        "gofile"
    }

    fn recognizes(&self, url: &Url, _page: &str) -> bool {
        url.host_str().map_or(false, |h| h == "gofile.io" || h.ends_with(".gofile.io"))
    }

    async fn extract_page(
        &self,
        url: &Url,
        _page: &str,
        http: &HttpClient,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamCandidate>> {
        let resolved = self.resolve(&content_id(url.as_str()), http, cancel).await?;
        Ok(vec![StreamCandidate::new("GoFile", resolved.link, "mp4")
            .with_header("Cookie", format!("accountToken={}", resolved.token))])
    }

    /// The share page is a client-rendered shell, so it is never fetched
    async fn extract(&self, link: &str, http: &HttpClient, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let url = Url::parse(link)?;
        self.extract_page(&url, "", http, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::test_support::spawn_server;
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use std::collections::HashMap;

    #[test]
    fn test_content_id() {
        assert_eq!(content_id("https://gofile.io/d/AbCd12"), "AbCd12");
        assert_eq!(content_id("AbCd12"), "AbCd12");
    }

    #[tokio::test]
    async fn test_resolve_walks_token_chain() {
        let base = spawn_server(
            Router::new()
                .route(
                    "/accounts",
                    post(|| async { Json(serde_json::json!({"status": "ok", "data": {"token": "guest-1"}})) }),
                )
                .route(
                    "/dist/js/global.js",
                    get(|| async { "appdata.wt = \"4fd6sg89d7s6\";" }),
                )
                .route(
                    "/contents/:id",
                    get(
                        |Path(id): Path<String>, Query(q): Query<HashMap<String, String>>, headers: HeaderMap| async move {
                            let authorized = headers
                                .get("authorization")
                                .map_or(false, |v| v == "Bearer guest-1");
                            if id != "AbCd12" || q.get("wt").map(String::as_str) != Some("4fd6sg89d7s6") || !authorized {
                                return Err(StatusCode::FORBIDDEN);
                            }
                            Ok(Json(serde_json::json!({
                                "data": {"children": {"c1": {"link": "https://store1.gofile.io/download/c1/movie.mp4"}}}
                            })))
                        },
                    ),
                ),
        )
        .await;

        let gofile = GoFile::with_bases(&base, &base);
        let http = HttpClient::new(&HttpConfig::default(), &Default::default()).unwrap();
        let url = Url::parse("https://gofile.io/d/AbCd12").unwrap();
        let candidates = gofile
            .extract_page(&url, "", &http, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].server, "GoFile");
        assert_eq!(candidates[0].link, "https://store1.gofile.io/download/c1/movie.mp4");
        assert_eq!(candidates[0].headers.as_ref().unwrap()["Cookie"], "accountToken=guest-1");
    }
}
