// cmh-common/src/model/mod.rs
// Declares the modules within the model directory.

pub mod descriptor;
pub mod parameter;
pub mod platform;
pub mod version;

// Re-export
pub use descriptor::ModuleDescriptor;
pub use parameter::{ParameterKind, ParameterSpec, ParameterValue};
pub use platform::Platforms;
pub use version::{parse_version, Bound, VersionConstraint};
