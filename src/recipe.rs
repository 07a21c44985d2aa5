use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cluster::TaskId;
use crate::executor::{JobArtifact, StepSpec, plan_steps};
use crate::job::{JobParameters, PipelineJob};
use crate::pipeline::{PipelineContext, ProviderRegistry, StepType};
use crate::support::{InMemoryMetadataStore, ReferenceGenome, Readset, SequenceJobSupport};
use crate::wrapper::ToolConfig;

/// A job description loaded from YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Recipe {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub tools_dir: Option<PathBuf>,
    #[serde(default)]
    pub sequence_tools_dir: Option<PathBuf>,
    #[serde(default)]
    pub package_paths: BTreeMap<String, PathBuf>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub params: BTreeMap<String, serde_yaml::Value>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub genome: Option<ReferenceGenome>,
    #[serde(default)]
    pub readset: Option<Readset>,
    /// Previously written support snapshot to start from.
    #[serde(default)]
    pub support: Option<PathBuf>,
    /// Metadata used to resolve data-file parameters.
    #[serde(default)]
    pub metadata: Option<InMemoryMetadataStore>,
    #[serde(default)]
    pub task_id: Option<String>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputSpec {
    pub path: String,
}

/// Everything needed to run a recipe: the executor context and the starting
/// artifact.
#[derive(Debug)]
pub struct PreparedJob {
    pub ctx: PipelineContext,
    pub artifact: JobArtifact,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file: {}", path.display()))?;
        let recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse job YAML: {}", path.display()))?;
        Ok(recipe)
    }

    pub fn expand_inputs(&self) -> Result<Vec<PathBuf>> {
        let mut resolved = Vec::new();
        for input in &self.inputs {
            let matches = glob(&input.path)
                .with_context(|| format!("Invalid glob pattern: {}", input.path))?;
            let mut found = false;
            for entry in matches {
                let path = entry?;
                if path.is_file() {
                    resolved.push(path);
                    found = true;
                }
            }
            if !found {
                anyhow::bail!("No inputs matched pattern: {}", input.path);
            }
        }
        Ok(resolved)
    }

    /// Job parameters as strings. Each step type used by the job is also
    /// listed under its lowercase name, e.g. `analysis: SamtoolsFlagstat`.
    pub fn job_parameters(&self) -> JobParameters {
        let mut params: JobParameters = self
            .params
            .iter()
            .map(|(key, value)| (key.clone(), yaml_to_param(value)))
            .collect();
        let mut by_type: BTreeMap<StepType, Vec<&str>> = BTreeMap::new();
        for spec in &self.steps {
            by_type
                .entry(spec.step_type)
                .or_default()
                .push(spec.provider.as_str());
        }
        for (step_type, providers) in by_type {
            params
                .entry(step_type.param_name().to_ascii_lowercase())
                .or_insert_with(|| providers.join(";"));
        }
        params
    }

    pub fn task(&self) -> Result<Option<TaskId>> {
        self.task_id
            .as_deref()
            .map(|raw| raw.parse::<TaskId>().map_err(anyhow::Error::msg))
            .transpose()
            .context("Invalid task_id")
    }

    pub fn tool_config(&self) -> ToolConfig {
        ToolConfig {
            tools_dir: self.tools_dir.clone(),
            sequence_tools_dir: self.sequence_tools_dir.clone(),
            package_paths: self.package_paths.clone(),
        }
    }

    pub fn to_job(&self, inputs: Vec<PathBuf>) -> Result<PipelineJob> {
        let mut job = PipelineJob::new(&self.name, self.job_parameters()).with_input_files(inputs);
        if let Some(task) = self.task()? {
            job = job.with_active_task(task);
        }
        Ok(job)
    }

    /// Builds the support cache for `job`: the snapshot named by `support`
    /// (if any), then the recipe's genome, readset and data-file parameters.
    pub fn prepare_support(
        &self,
        job: &PipelineJob,
        registry: &ProviderRegistry,
    ) -> Result<SequenceJobSupport> {
        let mut support = match &self.support {
            Some(path) => SequenceJobSupport::read_from_disk(path)
                .with_context(|| format!("Failed to load support snapshot: {}", path.display()))?,
            None => SequenceJobSupport::new(),
        };
        if let Some(genome) = &self.genome {
            support.cache_genome(genome.clone());
        }
        if let Some(readset) = &self.readset {
            support
                .cache_readset(readset.clone(), false)
                .with_context(|| format!("Failed to cache readset {}", readset.row_id))?;
        }

        let store = self.metadata.clone().unwrap_or_default();
        for planned in plan_steps(registry, &self.steps)? {
            for param in planned.provider.get_parameters() {
                param
                    .cache_value(job, &planned.provider, planned.step_idx, &mut support, &store)
                    .with_context(|| format!("Failed to cache parameter '{}'", param.name()))?;
            }
        }
        debug!(
            data = support.get_all_cached_data().len(),
            genomes = support.get_cached_genomes().count(),
            "Support cache prepared"
        );
        Ok(support)
    }

    pub fn prepare(&self, registry: &ProviderRegistry) -> Result<PreparedJob> {
        let inputs = self.expand_inputs()?;
        info!(job = self.name.as_str(), inputs = inputs.len(), "Preparing job");
        let job = self.to_job(inputs.clone())?;
        let support = self.prepare_support(&job, registry)?;
        std::fs::create_dir_all(&self.work_dir).with_context(|| {
            format!("Failed to create work directory: {}", self.work_dir.display())
        })?;

        let artifact = JobArtifact::from_inputs(&inputs)
            .with_genome(self.genome.clone())
            .with_readset(self.readset.clone());
        let ctx = PipelineContext::new(
            Arc::new(job),
            Arc::new(support),
            Arc::new(self.tool_config()),
            &self.work_dir,
        );
        Ok(PreparedJob { ctx, artifact })
    }
}

pub(crate) fn yaml_to_param(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
