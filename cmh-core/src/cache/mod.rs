// cmh-core/src/cache/mod.rs
pub mod entry;
pub mod fingerprint;
pub mod manager;
pub mod materializer;

pub use entry::{CacheEntrySnapshot, CacheFilter, CacheState, CacheStats, EntryManifest};
pub use fingerprint::{fingerprint, fingerprint_module};
pub use manager::CacheManager;
pub use materializer::{LocalSourceMaterializer, Materializer};
