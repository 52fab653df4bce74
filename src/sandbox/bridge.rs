// Host bridge
//
// Native functions installed as `__host_*` globals before the prelude runs.
// Everything crosses the boundary as strings: arguments are plain strings or
// JSON, replies are `{"value": ...}` or `{"error": "...", "aborted": bool}`
// (the cancellation flag alone is a plain bool).
// Async capabilities are driven to completion on the calling (blocking)
// thread through the tokio runtime handle, racing the call's cancellation
// token.

use base64::Engine;
use reqwest::Method;
use rquickjs::{Ctx, Function};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::context::{html, is_aborted, HttpRequest, ProviderContext, EXTRACTOR_NAMES};
use crate::providers::types::ModuleRole;

/// `provider:role` tag carried by every log line a module emits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLabel {
    pub provider: String,
    pub role: ModuleRole,
}

impl ModuleLabel {
    pub fn new(provider: impl Into<String>, role: ModuleRole) -> Self {
        Self {
            provider: provider.into(),
            role,
        }
    }
}

impl fmt::Display for ModuleLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.role)
    }
}

#[derive(Deserialize, Default)]
struct HttpOptions {
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    body: Option<String>,
    /// Milliseconds, axios style
    timeout: Option<u64>,
}

fn reply<T: Serialize>(value: T) -> String {
    json!({ "value": value }).to_string()
}

fn failure(err: &anyhow::Error) -> String {
    json!({ "error": format!("{:#}", err), "aborted": is_aborted(err) }).to_string()
}

fn failure_message(message: impl fmt::Display) -> String {
    json!({ "error": message.to_string() }).to_string()
}

pub(crate) struct Bridge {
    pub context: ProviderContext,
    pub handle: Handle,
    pub cancel: CancellationToken,
    pub label: ModuleLabel,
}

impl Bridge {
    fn http(&self, method: String, url: String, options: String) -> String {
        let options: HttpOptions = serde_json::from_str(&options).unwrap_or_default();
        let method = match Method::from_bytes(method.to_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => return failure_message(format!("Invalid HTTP method: {}", method)),
        };

        let headers = options
            .headers
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::Null => None,
                Value::String(s) => Some((name, s)),
                other => Some((name, other.to_string())),
            })
            .collect();

        let request = HttpRequest {
            method,
            url,
            headers,
            body: options.body,
            timeout: options.timeout.filter(|ms| *ms > 0).map(Duration::from_millis),
        };

        match self.handle.block_on(self.context.http.send(request, &self.cancel)) {
            Ok(response) => reply(response),
            Err(e) => {
                log::warn!("[{}] HTTP request failed: {:#}", self.label, e);
                failure(&e)
            }
        }
    }

    fn select(&self, source: String, selector: String, fragment: bool) -> String {
        let selected = if fragment {
            html::select_fragment(&source, &selector)
        } else {
            html::select(&source, &selector)
        };
        match selected {
            Ok(elements) => reply(elements),
            Err(e) => failure(&e),
        }
    }

    fn log(&self, level: String, message: String) {
        let level = match level.as_str() {
            "error" => log::Level::Error,
            "warn" => log::Level::Warn,
            "debug" => log::Level::Debug,
            _ => log::Level::Info,
        };
        log::log!(target: "provider_module", level, "[{}] {}", self.label, message);
    }

    fn base_url(&self, provider: String) -> String {
        match self.handle.block_on(self.context.base_url(&provider, &self.cancel)) {
            Ok(url) => reply(url),
            Err(e) => failure(&e),
        }
    }

    fn extract(&self, name: String, arg: String) -> String {
        match self
            .handle
            .block_on(self.context.call_extractor(&name, &arg, &self.cancel))
        {
            Ok(value) => reply(value),
            Err(e) => failure(&e),
        }
    }

    /// atob/btoa over Latin-1 "binary strings"
    fn base64(&self, mode: String, text: String) -> String {
        let engine = base64::engine::general_purpose::STANDARD;
        match mode.as_str() {
            "decode" => {
                let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                let padded = match cleaned.len() % 4 {
                    2 => format!("{}==", cleaned),
                    3 => format!("{}=", cleaned),
                    _ => cleaned,
                };
                match engine.decode(padded) {
                    Ok(bytes) => reply(bytes.iter().map(|&b| b as char).collect::<String>()),
                    Err(e) => failure_message(format!("Invalid base64: {}", e)),
                }
            }
            _ => {
                let bytes: Option<Vec<u8>> = text.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect();
                match bytes {
                    Some(bytes) => reply(engine.encode(bytes)),
                    None => failure_message("String contains characters outside of the Latin1 range"),
                }
            }
        }
    }

    fn url(&self, href: String, base: String) -> String {
        let parsed = if base.is_empty() {
            Url::parse(&href)
        } else {
            Url::parse(&base).and_then(|base| base.join(&href))
        };
        match parsed {
            Ok(url) => {
                let host = match (url.host_str(), url.port()) {
                    (Some(host), Some(port)) => format!("{}:{}", host, port),
                    (Some(host), None) => host.to_string(),
                    _ => String::new(),
                };
                reply(json!({
                    "href": url.as_str(),
                    "origin": url.origin().ascii_serialization(),
                    "protocol": format!("{}:", url.scheme()),
                    "host": host,
                    "hostname": url.host_str().unwrap_or_default(),
                    "port": url.port().map(|p| p.to_string()).unwrap_or_default(),
                    "pathname": url.path(),
                    "search": url.query().map(|q| format!("?{}", q)).unwrap_or_default(),
                    "hash": url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
                    "username": url.username(),
                    "password": url.password().unwrap_or_default(),
                }))
            }
            Err(e) => failure_message(format!("Invalid URL '{}': {}", href, e)),
        }
    }

    /// Register every `__host_*` global on `ctx`
    pub fn install(self: &Arc<Self>, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        let bridge = self.clone();
        globals.set(
            "__host_http",
            Function::new(ctx.clone(), move |method: String, url: String, options: String| {
                bridge.http(method, url, options)
            })?,
        )?;

        let bridge = self.clone();
        globals.set(
            "__host_select",
            Function::new(ctx.clone(), move |source: String, selector: String, fragment: bool| {
                bridge.select(source, selector, fragment)
            })?,
        )?;

        let bridge = self.clone();
        globals.set(
            "__host_log",
            Function::new(ctx.clone(), move |level: String, message: String| bridge.log(level, message))?,
        )?;

        let bridge = self.clone();
        globals.set(
            "__host_base_url",
            Function::new(ctx.clone(), move |provider: String| bridge.base_url(provider))?,
        )?;

        let bridge = self.clone();
        globals.set(
            "__host_extract",
            Function::new(ctx.clone(), move |name: String, arg: String| bridge.extract(name, arg))?,
        )?;

        let cancel = self.cancel.clone();
        globals.set(
            "__host_cancelled",
            Function::new(ctx.clone(), move || cancel.is_cancelled())?,
        )?;

        let bridge = self.clone();
        globals.set(
            "__host_base64",
            Function::new(ctx.clone(), move |mode: String, text: String| bridge.base64(mode, text))?,
        )?;

        let bridge = self.clone();
        globals.set(
            "__host_url",
            Function::new(ctx.clone(), move |href: String, base: String| bridge.url(href, base))?,
        )?;

        let headers = serde_json::to_string(self.context.headers.as_ref()).unwrap_or_else(|_| "{}".to_string());
        globals.set("__host_headers", headers)?;
        let names = serde_json::to_string(&EXTRACTOR_NAMES).unwrap_or_else(|_| "[]".to_string());
        globals.set("__host_extractor_names", names)?;

        Ok(())
    }
}
