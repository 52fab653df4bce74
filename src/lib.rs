// Provider relay
//
// Runtime-loaded provider modules executed in a sandbox, a fallback
// extraction cascade for links they cannot resolve, and a byte-range
// preserving media relay, served over HTTP.

pub mod cascade;
pub mod config;
pub mod context;
pub mod error;
pub mod extractors;
pub mod fallback;
pub mod providers;
pub mod proxy;
pub mod resolve;
pub mod sandbox;
pub mod server;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{RelayError, RelayResult};

/// Serve the API until interrupted
pub async fn run(config: Config) -> anyhow::Result<()> {
    log::info!("Starting provider relay v{}", env!("CARGO_PKG_VERSION"));
    server::serve(&config).await
}
