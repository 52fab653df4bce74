// Provider module system: keys, mirrors, cache and manifest

pub mod loader;
pub mod manifest;
pub mod registry;
pub mod types;

pub use loader::{MirrorLoader, ModuleSource};
pub use manifest::{BaseUrlResolver, ManifestClient};
pub use registry::ModuleRegistry;
pub use types::*;
