// Provider data types
//
// Core data structures shared by the module loader, registry, sandbox and
// cascade: provider keys, module roles, fetched module sets and the stream
// candidates that every resolution produces.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Raw provider names that resolve to another canonical key
const ALIASES: &[(&str, &str)] = &[
    ("modflix", "mod"),
    ("moviesmod", "mod"),
    ("multimovie", "multi"),
    ("multimovies", "multi"),
    ("world4ufree", "world4u"),
    ("hdhub", "hdhub4u"),
];

/// Normalized, lowercase provider identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProviderKey(String);

impl ProviderKey {
    /// Lowercase, trim and apply the alias table. Pure and idempotent.
    pub fn normalize(raw: &str) -> Self {
        let value = raw.trim().to_lowercase();
        let key = ALIASES
            .iter()
            .find(|(alias, _)| *alias == value)
            .map(|(_, key)| key.to_string())
            .unwrap_or(value);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the five scraping responsibilities a provider may implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleRole {
    Posts,
    Meta,
    Stream,
    Catalog,
    Episodes,
}

impl ModuleRole {
    pub const ALL: [ModuleRole; 5] = [
        ModuleRole::Posts,
        ModuleRole::Meta,
        ModuleRole::Stream,
        ModuleRole::Catalog,
        ModuleRole::Episodes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Posts => "posts",
            Self::Meta => "meta",
            Self::Stream => "stream",
            Self::Catalog => "catalog",
            Self::Episodes => "episodes",
        }
    }
}

impl fmt::Display for ModuleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetched module sources for one provider. A missing role is a valid state.
#[derive(Debug, Clone, Default)]
pub struct ProviderModuleSet {
    modules: HashMap<ModuleRole, Arc<str>>,
}

impl ProviderModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: ModuleRole, source: impl Into<Arc<str>>) {
        self.modules.insert(role, source.into());
    }

    pub fn get(&self, role: ModuleRole) -> Option<Arc<str>> {
        self.modules.get(&role).cloned()
    }

    pub fn contains(&self, role: ModuleRole) -> bool {
        self.modules.contains_key(&role)
    }

    /// Present roles in canonical order
    pub fn roles(&self) -> Vec<ModuleRole> {
        ModuleRole::ALL
            .into_iter()
            .filter(|role| self.modules.contains_key(role))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Hex SHA-256 of a role's source, used as its version
    pub fn fingerprint(&self, role: ModuleRole) -> Option<String> {
        self.modules.get(&role).map(|source| {
            let digest = Sha256::digest(source.as_bytes());
            digest.iter().map(|b| format!("{:02x}", b)).collect()
        })
    }
}

/// A labeled, typed URL believed to point at playable media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCandidate {
    pub server: String,
    pub link: String,
    /// Container/protocol hint: "mp4", "m3u8", "mkv", "iframe", ...
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    /// Request headers the player has to send to fetch the link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl StreamCandidate {
    pub fn new(server: impl Into<String>, link: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            link: link.into(),
            kind: kind.into(),
            quality: None,
            headers: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), value.into());
        self
    }
}

/// Drop repeated links, keeping the first (preferred) occurrence
pub fn dedupe_candidates(candidates: Vec<StreamCandidate>) -> Vec<StreamCandidate> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.link.clone()))
        .collect()
}

/// Container hint from a URL's extension, or `default` when there is none
pub fn infer_container(link: &str, default: &str) -> String {
    let path = url::Url::parse(link)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| link.split(['?', '#']).next().unwrap_or(link).to_string());

    let ext = path
        .rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some(ext @ ("mp4" | "m3u8" | "mkv" | "avi" | "mov" | "wmv" | "flv" | "webm" | "mpd")) => {
            ext.to_string()
        }
        _ => default.to_string(),
    }
}

/// Provider listing entry as served by the manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub value: String,
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub provider_type: Option<String>,
    pub icon: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// Provider as exposed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub value: String,
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub icon: String,
    pub version: String,
}

impl From<ManifestEntry> for ProviderInfo {
    fn from(entry: ManifestEntry) -> Self {
        Self {
            name: entry.display_name.unwrap_or_else(|| entry.value.clone()),
            value: entry.value,
            provider_type: entry.provider_type.unwrap_or_else(|| "global".to_string()),
            icon: entry.icon.unwrap_or_default(),
            version: entry.version.unwrap_or_else(|| "0".to_string()),
        }
    }
}
