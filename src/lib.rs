pub mod cluster;
pub mod error;
pub mod executor;
pub mod job;
pub mod lockfile;
pub mod observability;
pub mod output;
pub mod params;
pub mod pipeline;
pub mod recipe;
pub mod services;
pub mod steps;
pub mod support;
pub mod validation;
pub mod wrapper;

pub use error::{PipelineJobError, Result};
pub use executor::{JobArtifact, JobReport, PipelineExecutor, build_pipeline};
pub use job::PipelineJob;
pub use output::PipelineStepOutput;
pub use pipeline::{PipelineStepProvider, ProviderRegistry, StepType};
pub use recipe::Recipe;
pub use services::PipelineServices;
pub use support::SequenceJobSupport;
pub use wrapper::CommandWrapper;
