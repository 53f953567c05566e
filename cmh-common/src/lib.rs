// cmh-common/src/lib.rs
pub mod config;
pub mod dependency;
pub mod error;
pub mod model;
pub mod registry;

// Re-export key types
pub use config::Config;
pub use dependency::{
    DependencyGraph, DependencySpec, ParameterPrecedence, ResolveOptions, ResolvedModule,
    Resolver, RootRequest,
};
pub use error::{CmhError, Result};
pub use model::{ModuleDescriptor, ParameterValue, Platforms, VersionConstraint};
pub use registry::{ModuleRegistry, RegistryContext, RegistrySource};
