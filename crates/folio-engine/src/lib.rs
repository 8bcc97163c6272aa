pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod imaging;
pub mod providers;
pub mod quality_gate;
pub mod result_cache;
pub mod retry;
pub mod scene;

pub use config::EngineConfig;
pub use engine::IllustrationEngine;
pub use error::ProviderError;
pub use fingerprint::{derive_fingerprint, CacheFingerprint};
pub use result_cache::ResultCache;
pub use retry::{ModelIds, SessionHooks};
