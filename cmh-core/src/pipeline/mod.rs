// cmh-core/src/pipeline/mod.rs
pub mod engine;
pub mod event;

pub use engine::{
    materialize_graph, materialize_graph_with_events, GraphMaterialization, ModuleOutcome,
};
pub use event::PipelineEvent;
