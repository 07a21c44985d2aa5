use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cluster::TaskId;

/// Environment variable exported into cluster jobs with the granted CPU count.
pub const MAX_THREADS_ENV: &str = "SEQUENCEANALYSIS_MAX_THREADS";
/// Environment variable exported into cluster jobs with the granted RAM (GB).
pub const MAX_RAM_ENV: &str = "SEQUENCEANALYSIS_MAX_RAM";

pub type JobParameters = BTreeMap<String, String>;

/// The job-level collaborator handed to steps and allocators: a string-keyed
/// parameter map plus the bits of job state they are allowed to read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineJob {
    name: String,
    parameters: JobParameters,
    #[serde(default)]
    active_task: Option<TaskId>,
    #[serde(default)]
    input_files: Vec<PathBuf>,
    #[serde(default)]
    max_threads: Option<u32>,
}

impl PipelineJob {
    pub fn new(name: impl Into<String>, parameters: JobParameters) -> Self {
        let max_threads = std::env::var(MAX_THREADS_ENV)
            .ok()
            .and_then(|value| value.trim().parse().ok());
        Self {
            name: name.into(),
            parameters,
            active_task: None,
            input_files: Vec::new(),
            max_threads,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    pub fn active_task(&self) -> Option<&TaskId> {
        self.active_task.as_ref()
    }

    pub fn with_active_task(mut self, task: TaskId) -> Self {
        self.active_task = Some(task);
        self
    }

    pub fn input_files(&self) -> &[PathBuf] {
        &self.input_files
    }

    pub fn with_input_files(mut self, files: Vec<PathBuf>) -> Self {
        self.input_files = files;
        self
    }

    pub fn max_threads(&self) -> Option<u32> {
        self.max_threads
    }

    pub fn with_max_threads(mut self, threads: Option<u32>) -> Self {
        self.max_threads = threads;
        self
    }

    pub fn span(&self) -> tracing::Span {
        tracing::span!(tracing::Level::DEBUG, "job", job = self.name.as_str())
    }
}
