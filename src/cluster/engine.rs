use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AllocatorRegistry;
use crate::job::{MAX_RAM_ENV, MAX_THREADS_ENV, PipelineJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    #[serde(alias = "condor")]
    HtCondor,
    Slurm,
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineType::HtCondor => f.write_str("HTCondorEngine"),
            EngineType::Slurm => f.write_str("SlurmEngine"),
        }
    }
}

/// Static description of a cluster backend, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEngineConfig {
    #[serde(rename = "type")]
    pub engine_type: EngineType,
    #[serde(default)]
    pub request_cpus: Option<u32>,
    /// GB.
    #[serde(default)]
    pub request_memory: Option<u32>,
    #[serde(default)]
    pub extra_submit_lines: Vec<String>,
    /// `NAME=value` entries exported into every job.
    #[serde(default)]
    pub environment_vars: Vec<String>,
    #[serde(default = "default_remote_executable")]
    pub remote_executable: String,
    #[serde(default)]
    pub java_home: Option<String>,
    #[serde(default)]
    pub job_args: Vec<String>,
    #[serde(default)]
    pub disallowed_nodes: Vec<String>,
}

fn default_remote_executable() -> String {
    "seqpipe".to_string()
}

impl ClusterEngineConfig {
    pub fn new(engine_type: EngineType) -> Self {
        Self {
            engine_type,
            request_cpus: None,
            request_memory: None,
            extra_submit_lines: Vec::new(),
            environment_vars: Vec::new(),
            remote_executable: default_remote_executable(),
            java_home: None,
            job_args: Vec::new(),
            disallowed_nodes: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {}", path.display()))?;
        let config: ClusterEngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse engine config: {}", path.display()))?;
        if config.remote_executable.trim().is_empty() {
            bail!("Engine config {} has an empty remote_executable", path.display());
        }
        Ok(config)
    }

    fn java_home(&self) -> Option<&str> {
        self.java_home
            .as_deref()
            .map(str::trim)
            .filter(|home| !home.is_empty())
    }
}

/// The resources a submission asks for after the allocator (if any) and the
/// static configuration have been consulted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceRequest {
    pub allocator: Option<String>,
    pub cpus: Option<u32>,
    pub memory_gb: Option<u32>,
    pub extra_lines: Vec<String>,
    pub environment: Vec<String>,
}

/// Asks the allocator selected for the job's active task, then falls back to
/// the engine's static request values.
pub fn resolve_resources(
    config: &ClusterEngineConfig,
    registry: &AllocatorRegistry,
    job: &PipelineJob,
) -> ResourceRequest {
    let mut request = ResourceRequest {
        extra_lines: config.extra_submit_lines.clone(),
        ..ResourceRequest::default()
    };
    let mut allocator_env = BTreeMap::new();

    if let Some(factory) = job.active_task().and_then(|task| registry.resolve(task)) {
        let allocator = factory.allocator();
        debug!("using resource allocator: {}", factory.name());
        request.allocator = Some(factory.name().to_string());
        request.cpus = allocator.max_request_cpus(job);
        request.memory_gb = allocator.max_request_memory(job);
        allocator.add_extra_submit_script_lines(job, config.engine_type, &mut request.extra_lines);
        allocator_env = allocator.environment_vars(job, config.engine_type);
    }

    request.cpus = request.cpus.or(config.request_cpus);
    request.memory_gb = request.memory_gb.or(config.request_memory);

    if let Some(cpus) = request.cpus {
        request.environment.push(format!("{MAX_THREADS_ENV}={cpus}"));
    }
    if let Some(ram) = request.memory_gb {
        request.environment.push(format!("{MAX_RAM_ENV}={ram}"));
    }
    if let Some(home) = config.java_home() {
        request.environment.push(format!("JAVA_HOME='{home}'"));
    }
    request
        .environment
        .extend(config.environment_vars.iter().cloned());
    request.environment.extend(
        allocator_env
            .into_iter()
            .map(|(name, value)| format!("{name}={value}")),
    );
    request
}

/// Where a job's submission script and logs live.
#[derive(Debug, Clone)]
pub struct SubmitTarget {
    pub out_dir: PathBuf,
    pub basename: String,
    pub job_guid: String,
}

impl SubmitTarget {
    pub fn new(out_dir: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        let basename = basename.into();
        Self {
            out_dir: out_dir.into(),
            job_guid: basename.clone(),
            basename,
        }
    }

    pub fn with_job_guid(mut self, guid: impl Into<String>) -> Self {
        self.job_guid = guid.into();
        self
    }

    fn log_file(&self, suffix: &str) -> String {
        self.out_dir
            .join(format!("{}-{suffix}", self.basename))
            .display()
            .to_string()
    }
}

pub fn render_submit_script(
    config: &ClusterEngineConfig,
    request: &ResourceRequest,
    target: &SubmitTarget,
) -> String {
    match config.engine_type {
        EngineType::HtCondor => render_htcondor(config, request, target),
        EngineType::Slurm => render_slurm(config, request, target),
    }
}

fn render_htcondor(
    config: &ClusterEngineConfig,
    request: &ResourceRequest,
    target: &SubmitTarget,
) -> String {
    let java_log = target.log_file("$(Cluster).$(Process).java.log");
    let mut lines = vec![
        format!("initialdir={}", target.out_dir.display()),
        format!("executable={}", config.remote_executable),
        format!("output={java_log}"),
        format!("error={java_log}"),
        format!("log={}", target.log_file("$(Cluster).$(Process).condor.log")),
    ];
    if let Some(cpus) = request.cpus {
        lines.push(format!("request_cpus = {cpus}"));
    }
    if let Some(ram) = request.memory_gb {
        lines.push(format!("request_memory = {ram} GB"));
    }
    if !request.environment.is_empty() {
        lines.push(format!("environment = \"{}\"", request.environment.join(" ")));
    }
    lines.push("getenv = True".to_string());
    lines.extend(request.extra_lines.iter().cloned());
    if !config.job_args.is_empty() {
        let quoted = config.job_args.join("' '").replace('"', "\"\"");
        lines.push(format!("arguments = \"'{quoted}'\""));
    }
    lines.push("queue 1".to_string());
    lines.join("\n")
}

fn render_slurm(
    config: &ClusterEngineConfig,
    request: &ResourceRequest,
    target: &SubmitTarget,
) -> String {
    let java_log = target.log_file("%j.java.log");
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "#".to_string(),
        format!("#SBATCH --job-name={}", target.job_guid),
        "#SBATCH --ntasks=1".to_string(),
        "#SBATCH --get-user-env".to_string(),
        format!("#SBATCH --output=\"{java_log}\""),
        format!("#SBATCH --error=\"{java_log}\""),
    ];
    if !config.disallowed_nodes.is_empty() {
        lines.push(format!("#SBATCH --exclude={}", config.disallowed_nodes.join(",")));
    }
    if let Some(cpus) = request.cpus {
        lines.push(format!("#SBATCH --cpus-per-task={cpus}"));
    }
    if let Some(ram) = request.memory_gb {
        // 2 GB above the RAM exported to the job.
        lines.push(format!("#SBATCH --mem={}000", ram.saturating_add(2)));
    }
    if !request.environment.is_empty() {
        lines.push(format!("#SBATCH --export={}", request.environment.join(",")));
    }
    lines.extend(request.extra_lines.iter().cloned());

    let mut srun = format!("srun {}", config.remote_executable);
    for arg in &config.job_args {
        srun.push(' ');
        srun.push_str(arg);
    }
    lines.push(srun);
    lines.join("\n")
}
