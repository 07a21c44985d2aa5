//! Job failure type shared by the step framework.

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::StepType;

pub type Result<T, E = PipelineJobError> = std::result::Result<T, E>;

/// Errors raised while preparing or running a pipeline job.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineJobError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{program}' exited with non-zero value: {code}")]
    NonZeroExit { program: String, code: i32 },

    #[error("Unable to find expected output: {}", path.display())]
    MissingOutput { path: PathBuf },

    #[error("No cached {kind} found with id {id}")]
    MissingDependency { kind: &'static str, id: i64 },

    #[error("Attempting to access cached {kind} without a valid id: {id}")]
    InvalidDependencyId { kind: &'static str, id: i64 },

    #[error("Readset {id} has archived data and cannot be used for pipeline jobs")]
    ArchivedReadset { id: i64 },

    #[error("Invalid value for parameter '{key}': [{value}] ({reason})")]
    InvalidParameter {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unknown {step_type} provider '{name}'")]
    UnknownProvider { step_type: StepType, name: String },

    #[error("A {step_type} provider named '{name}' is already registered")]
    DuplicateProvider { step_type: StepType, name: String },

    #[error("Provider '{name}' declares {declared} steps but manufactured a step of type {produced}")]
    CapabilityMismatch {
        name: String,
        declared: StepType,
        produced: StepType,
    },

    #[error("Provider '{name}' requires unknown prerequisite '{prerequisite}'")]
    MissingPrerequisite { name: String, prerequisite: String },

    #[error("Prerequisite cycle detected at provider '{name}'")]
    PrerequisiteCycle { name: String },

    #[error("Step input missing: {0}")]
    MissingInput(String),

    #[error("Unsupported support snapshot version: {0}")]
    UnsupportedSnapshotVersion(u32),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl PipelineJobError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid_parameter(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}
