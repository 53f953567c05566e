// cmh-core/src/lib.rs

// Declare the top-level modules within the library crate
pub mod cache;
pub mod check;
pub mod pipeline;

// Re-export key types for easier use by callers
pub use cache::{CacheEntrySnapshot, CacheFilter, CacheManager, CacheState, Materializer};
pub use check::{check_compatibility, CompatibilityReport, Toolchain};
pub use pipeline::{materialize_graph, GraphMaterialization, PipelineEvent};
