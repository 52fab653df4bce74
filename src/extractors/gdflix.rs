// GDFlix cloud-storage landing pages
//
// Handles:
// - One `onload="location.replace('...')"` hop to the real file page
// - "CLOUD DOWNLOAD" / btn-outline-success buttons (R2)
// - PixelDrain buttons, rewritten to direct API downloads

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{pixeldrain_download, resolve_href, HostExtractor};
use crate::context::html;
use crate::context::http::{is_aborted, HttpClient};
use crate::providers::types::{dedupe_candidates, StreamCandidate};

lazy_static! {
    static ref ONLOAD_REPLACE: Regex = Regex::new(
        r#"onload\s*=\s*(?:"[^"]*?location\.replace\(\s*'([^']+)'|'[^']*?location\.replace\(\s*"([^"]+)")"#
    )
    .unwrap();
}

pub struct GdFlix;

/// Target of the page's onload redirect, if it declares one
fn onload_redirect(page: &str, base: &Url) -> Option<Url> {
    let captures = ONLOAD_REPLACE.captures(page)?;
    let target = captures.get(1).or_else(|| captures.get(2))?.as_str();
    base.join(target).ok()
}

#[async_trait]
impl HostExtractor for GdFlix {
    fn name(&self) -> &'static str {
        "gdflix"
    }

    fn recognizes(&self, url: &Url, page: &str) -> bool {
        url.host_str().map_or(false, |h| h.contains("gdflix"))
            || page.contains("CLOUD DOWNLOAD")
            || page.contains("btn-outline-success")
            || ONLOAD_REPLACE.is_match(page)
    }

    async fn extract_page(
        &self,
        url: &Url,
        page: &str,
        http: &HttpClient,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamCandidate>> {
        let (page_url, page) = match onload_redirect(page, url) {
            Some(target) => {
                log::debug!("[gdflix] Following onload redirect to {}", target);
                match http.get_text(target.as_str(), cancel).await {
                    Ok(body) => (target, body),
                    Err(e) if is_aborted(&e) => return Err(e),
                    Err(e) => {
                        log::warn!("[gdflix] Redirect fetch failed, using landing page: {:#}", e);
                        (url.clone(), page.to_string())
                    }
                }
            }
            None => (url.clone(), page.to_string()),
        };

        let mut candidates = Vec::new();
        for anchor in html::select(&page, "a[href]")? {
            let Some(link) = anchor.attr("href").and_then(|h| resolve_href(h, &page_url)) else {
                continue;
            };

            if anchor.has_class("btn-outline-success") || anchor.text.to_uppercase().contains("CLOUD DOWNLOAD") {
                candidates.push(StreamCandidate::new("R2", link, "mkv"));
            } else if link.contains("pixeld") {
                candidates.push(StreamCandidate::new("PixelDrain", pixeldrain_download(&link), "mkv"));
            }
        }

        log::info!("[gdflix] {} candidates from {}", candidates.len(), page_url);
        Ok(dedupe_candidates(candidates))
    }
}
