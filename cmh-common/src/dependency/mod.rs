// cmh-common/src/dependency/mod.rs

pub mod definition;
pub mod graph;
pub mod requirement;
pub mod resolver;

pub use definition::DependencySpec;
pub use graph::{DependencyGraph, GraphBuilder, ResolvedModule};
pub use requirement::{ConstraintOrigin, Requester, RootRequest};
pub use resolver::{ParameterPrecedence, ResolveOptions, Resolver};
