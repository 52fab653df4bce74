// Configuration
//
// Layered settings for the relay:
// - Built-in defaults (mirrors, TTLs, timeouts, extraction tables)
// - Optional TOML file
// - RELAY_* environment variables (`__` separates nested keys)

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Browser user agent presented to scraped sites
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub modules: ModuleConfig,
    pub manifest: ManifestConfig,
    pub http: HttpConfig,
    pub sandbox: SandboxConfig,
    pub cascade: CascadeConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Hides JavaScript stacks from error bodies when set
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            production: false,
        }
    }
}

/// Where provider modules come from and how long they stay fresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Ordered mirror base URLs, tried first to last for every module
    pub mirrors: Vec<String>,
    pub ttl_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            mirrors: vec![
                "https://raw.githubusercontent.com/Zenda-Cross/vega-providers/refs/heads/main/dist".to_string(),
                "https://raw.githubusercontent.com/Zenda-Cross/vega-providers/main/dist".to_string(),
                "https://github.com/Zenda-Cross/vega-providers/raw/main/dist".to_string(),
            ],
            ttl_secs: 10 * 60,
            fetch_timeout_secs: 15,
        }
    }
}

impl ModuleConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Provider listing (JSON array)
    pub providers_url: String,
    /// `{key: {url}}` map used by `getBaseUrl`
    pub base_urls_url: String,
    pub base_url_ttl_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            providers_url:
                "https://raw.githubusercontent.com/Zenda-Cross/vega-providers/refs/heads/main/manifest.json"
                    .to_string(),
            base_urls_url: "https://himanshu8443.github.io/providers/modflix.json".to_string(),
            base_url_ttl_secs: 60 * 60,
            timeout_secs: 10,
        }
    }
}

/// Outbound client used by ProviderContext and the cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    /// Cap on response bodies handed to scripts and pattern mining
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: BROWSER_USER_AGENT.to_string(),
            request_timeout_secs: 30,
            max_body_bytes: 10_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
    /// Ceiling for a single exported-function call, including awaited I/O
    pub call_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 1024 * 1024,
            call_timeout_secs: 30,
        }
    }
}

/// A tunnel/redirector domain whose pages are fetched and mined
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelHost {
    pub domain: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Aggregate wall-clock budget shared by every strategy
    pub budget_secs: u64,
    pub resolver_timeout_secs: u64,
    pub extractor_timeout_secs: u64,
    pub tunnel_timeout_secs: u64,
    pub fallback_timeout_secs: u64,
    pub max_tunnel_links: usize,
    /// Concurrent attempts inside one strategy
    pub attempt_concurrency: usize,
    pub alternate_segments: Vec<String>,
    pub video_extensions: Vec<String>,
    /// `<name>.com` style CDN families mined as embeddable hosting
    pub cdn_hosts: Vec<String>,
    pub video_hosts: Vec<String>,
    pub tunnel_hosts: Vec<TunnelHost>,
    /// External fallback resolver; defaults to this server's own endpoint
    pub fallback_url: Option<String>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            budget_secs: 25,
            resolver_timeout_secs: 30,
            extractor_timeout_secs: 20,
            tunnel_timeout_secs: 10,
            fallback_timeout_secs: 20,
            max_tunnel_links: 2,
            attempt_concurrency: 2,
            alternate_segments: ["watch", "embed", "stream", "play", "video"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            video_extensions: ["mp4", "m3u8", "mkv", "avi", "mov", "wmv", "flv", "webm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cdn_hosts: ["cloudflare", "fastly", "bunny", "streamable"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            video_hosts: ["youtube", "vimeo", "dailymotion"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tunnel_hosts: vec![
                TunnelHost {
                    domain: "vcloud.lol".to_string(),
                    label: "VCloud".to_string(),
                },
                TunnelHost {
                    domain: "filebee.xyz".to_string(),
                    label: "Filebee".to_string(),
                },
            ],
            fallback_url: None,
        }
    }
}

impl CascadeConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Wait for upstream response headers
    pub response_timeout_secs: u64,
    /// Longest gap between two body chunks. A relay has no total deadline,
    /// so an open-ended range can stream at playback speed.
    pub idle_timeout_secs: u64,
    pub max_redirects: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            user_agent: BROWSER_USER_AGENT.to_string(),
            connect_timeout_secs: 10,
            response_timeout_secs: 30,
            idle_timeout_secs: 60,
            max_redirects: 10,
        }
    }
}

impl Config {
    /// Load defaults, then the TOML file (if any), then `RELAY_*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) {
            log::info!("Reading configuration from {:?}", path);
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()
            .context("Invalid configuration")
    }

    /// `<config_dir>/provider-relay/config.toml`, when it exists
    fn default_path() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join("provider-relay").join("config.toml");
        path.exists().then_some(path)
    }

    /// Fallback resolver URL, pointing at our own endpoint unless overridden
    pub fn fallback_url(&self) -> String {
        self.cascade.fallback_url.clone().unwrap_or_else(|| {
            let bind = self.server.bind;
            let host = if bind.ip().is_unspecified() {
                "127.0.0.1".to_string()
            } else {
                bind.ip().to_string()
            };
            format!("http://{}:{}/api/stream-fallback", host, bind.port())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.modules.mirrors.len(), 3);
        assert_eq!(config.modules.ttl(), Duration::from_secs(600));
        assert_eq!(config.modules.fetch_timeout(), Duration::from_secs(15));
        assert_eq!(config.manifest.base_url_ttl_secs, 3600);
        assert_eq!(config.cascade.budget(), Duration::from_secs(25));
        assert_eq!(config.cascade.max_tunnel_links, 2);
        assert_eq!(config.cascade.attempt_concurrency, 2);
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [server]
            bind = "0.0.0.0:8088"
            production = true

            [modules]
            mirrors = ["http://mirror.local/dist"]

            [cascade]
            budget_secs = 5
            "#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.bind.port(), 8088);
        assert!(config.server.production);
        assert_eq!(config.modules.mirrors, vec!["http://mirror.local/dist"]);
        assert_eq!(config.cascade.budget_secs, 5);
        // Untouched keys keep their defaults
        assert_eq!(config.modules.ttl_secs, 600);
        assert_eq!(config.cascade.tunnel_hosts.len(), 2);
    }

    #[test]
    fn test_fallback_url_defaults_to_own_endpoint() {
        let mut config = Config::default();
        config.server.bind = "0.0.0.0:9000".parse().unwrap();
        assert_eq!(
            config.fallback_url(),
            "http://127.0.0.1:9000/api/stream-fallback"
        );

        config.cascade.fallback_url = Some("https://fallback.example/api".to_string());
        assert_eq!(config.fallback_url(), "https://fallback.example/api");
    }
}
