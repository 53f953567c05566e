// cmh-core/src/pipeline/event.rs
use std::path::PathBuf;

use cmh_common::error::CmhError;
use serde::{Deserialize, Serialize};

/// Progress notifications broadcast while a graph is materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_modules: usize,
    },
    LevelStarted {
        level: usize,
        modules: Vec<String>,
    },
    ModuleStarted {
        name: String,
        version: String,
    },
    ModuleMaterialized {
        name: String,
        path: PathBuf,
    },
    ModuleFailed {
        name: String,
        error: String, // Keep as String for simplicity in events
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
    },
}

impl PipelineEvent {
    pub fn module_failed(name: impl Into<String>, error: &CmhError) -> Self {
        Self::ModuleFailed {
            name: name.into(),
            error: error.to_string(),
        }
    }
}
