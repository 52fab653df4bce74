// Specialized host extractors
//
// One extractor per host family. Each can say whether it understands a page
// and turn that page into typed stream candidates. Provider modules reach
// them through ProviderContext; the cascade runs every extractor that
// recognizes the page it is looking at.

pub mod gdflix;
pub mod gofile;
pub mod hubcloud;
pub mod supervideo;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::context::http::HttpClient;
use crate::providers::types::StreamCandidate;

pub use gdflix::GdFlix;
pub use gofile::GoFile;
pub use hubcloud::HubCloud;
pub use supervideo::SuperVideo;

#[async_trait]
pub trait HostExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap check on an already fetched page
    fn recognizes(&self, url: &Url, page: &str) -> bool;

    /// Candidates from a page that has already been fetched
    async fn extract_page(
        &self,
        url: &Url,
        page: &str,
        http: &HttpClient,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamCandidate>>;

    /// Fetch `link` and extract from it
    async fn extract(&self, link: &str, http: &HttpClient, cancel: &CancellationToken) -> Result<Vec<StreamCandidate>> {
        let url = Url::parse(link)?;
        let page = http.get_text(link, cancel).await?;
        self.extract_page(&url, &page, http, cancel).await
    }
}

/// The fixed, ordered extractor list
pub struct ExtractorSet {
    pub gdflix: GdFlix,
    pub hubcloud: HubCloud,
    pub supervideo: SuperVideo,
    pub gofile: GoFile,
}

impl Default for ExtractorSet {
    fn default() -> Self {
        Self::new(GoFile::default())
    }
}

impl ExtractorSet {
    pub fn new(gofile: GoFile) -> Self {
        Self {
            gdflix: GdFlix,
            hubcloud: HubCloud,
            supervideo: SuperVideo,
            gofile,
        }
    }

    /// Cloud-storage landing pages, download portals, packed players, file hosts
    pub fn hosts(&self) -> [&dyn HostExtractor; 4] {
        [&self.gdflix, &self.hubcloud, &self.supervideo, &self.gofile]
    }
}

/// PixelDrain share links as direct API downloads
pub fn pixeldrain_download(link: &str) -> String {
    if link.contains("/api/") {
        return link.to_string();
    }
    let Ok(url) = Url::parse(link) else {
        return link.to_string();
    };
    match url.path_segments().and_then(|mut s| s.next_back()).filter(|id| !id.is_empty()) {
        Some(id) => format!("{}/api/file/{}?download", url.origin().ascii_serialization(), id),
        None => link.to_string(),
    }
}

/// Resolve an href against the page it appeared on, skipping script links
pub(crate) fn resolve_href(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    base.join(href)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(String::from)
}
