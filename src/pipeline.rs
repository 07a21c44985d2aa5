use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{PipelineJobError, Result};
use crate::job::PipelineJob;
use crate::output::PipelineStepOutput;
use crate::params::{ParamValue, ToolParameterDescriptor};
use crate::support::{ReferenceGenome, Readset, SequenceJobSupport};
use crate::wrapper::{CommandWrapper, ToolConfig};

/// The closed set of step capabilities. The name doubles as the prefix of
/// job parameter keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepType {
    ReferenceLibraryCreation,
    Assembly,
    BamPostProcessing,
    Analysis,
    VariantProcessing,
}

impl StepType {
    pub const ALL: [StepType; 5] = [
        StepType::ReferenceLibraryCreation,
        StepType::Assembly,
        StepType::BamPostProcessing,
        StepType::Analysis,
        StepType::VariantProcessing,
    ];

    pub fn param_name(self) -> &'static str {
        match self {
            StepType::ReferenceLibraryCreation => "ReferenceLibraryCreation",
            StepType::Assembly => "Assembly",
            StepType::BamPostProcessing => "BamPostProcessing",
            StepType::Analysis => "Analysis",
            StepType::VariantProcessing => "VariantProcessing",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.param_name())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        StepType::ALL
            .into_iter()
            .find(|ty| ty.param_name().to_ascii_lowercase() == normalized)
            .ok_or_else(|| format!("Unknown step type '{s}'"))
    }
}

/// What a step produced plus the file the next step should consume, if any.
#[derive(Debug, Default)]
pub struct StepResult {
    pub output: PipelineStepOutput,
    pub primary: Option<PathBuf>,
}

impl StepResult {
    pub fn new(output: PipelineStepOutput, primary: Option<PathBuf>) -> Self {
        Self { output, primary }
    }
}

pub struct ReadsInput<'a> {
    pub readset: Option<&'a Readset>,
    pub fastq1: &'a Path,
    pub fastq2: Option<&'a Path>,
    pub genome: Option<&'a ReferenceGenome>,
    pub output_dir: &'a Path,
    pub basename: &'a str,
}

pub struct BamInput<'a> {
    pub readset: Option<&'a Readset>,
    pub bam: &'a Path,
    pub genome: &'a ReferenceGenome,
    pub output_dir: &'a Path,
}

pub struct VcfInput<'a> {
    pub vcf: &'a Path,
    pub genome: &'a ReferenceGenome,
    pub output_dir: &'a Path,
}

pub trait ReferenceLibraryStep: Send {
    fn create_index(&self, genome: &ReferenceGenome, output_dir: &Path) -> Result<StepResult>;
}

pub trait AssemblyStep: Send {
    fn perform_assembly(&self, input: &ReadsInput<'_>) -> Result<StepResult>;
}

pub trait BamProcessingStep: Send {
    fn process_bam(&self, input: &BamInput<'_>) -> Result<StepResult>;
}

pub trait AnalysisStep: Send {
    fn perform_analysis(&self, input: &BamInput<'_>) -> Result<StepResult>;
}

pub trait VariantProcessingStep: Send {
    fn process_variants(&self, input: &VcfInput<'_>) -> Result<StepResult>;
}

/// A step instance, tagged with the capability it implements.
pub enum PipelineStep {
    ReferenceLibrary(Box<dyn ReferenceLibraryStep>),
    Assembly(Box<dyn AssemblyStep>),
    BamPostProcessing(Box<dyn BamProcessingStep>),
    Analysis(Box<dyn AnalysisStep>),
    VariantProcessing(Box<dyn VariantProcessingStep>),
}

impl PipelineStep {
    pub fn step_type(&self) -> StepType {
        match self {
            PipelineStep::ReferenceLibrary(_) => StepType::ReferenceLibraryCreation,
            PipelineStep::Assembly(_) => StepType::Assembly,
            PipelineStep::BamPostProcessing(_) => StepType::BamPostProcessing,
            PipelineStep::Analysis(_) => StepType::Analysis,
            PipelineStep::VariantProcessing(_) => StepType::VariantProcessing,
        }
    }
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PipelineStep")
            .field(&self.step_type())
            .finish()
    }
}

/// Everything a step may read while it runs. The support cache is frozen
/// behind an `Arc` once the job has been prepared.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    job: Arc<PipelineJob>,
    support: Arc<SequenceJobSupport>,
    tools: Arc<ToolConfig>,
    work_dir: PathBuf,
}

impl PipelineContext {
    pub fn new(
        job: Arc<PipelineJob>,
        support: Arc<SequenceJobSupport>,
        tools: Arc<ToolConfig>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job,
            support,
            tools,
            work_dir: work_dir.into(),
        }
    }

    pub fn job(&self) -> &PipelineJob {
        &self.job
    }

    pub fn support(&self) -> &SequenceJobSupport {
        &self.support
    }

    pub fn tools(&self) -> &ToolConfig {
        &self.tools
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

/// What a constructor receives: the provider, the job context, and the
/// position of this provider among repeated uses in the job.
#[derive(Debug, Clone)]
pub struct StepBinding {
    pub provider: Arc<PipelineStepProvider>,
    pub ctx: PipelineContext,
    pub step_idx: usize,
}

type StepConstructor = Arc<dyn Fn(StepBinding) -> Result<PipelineStep> + Send + Sync>;

pub struct PipelineStepProvider {
    step_type: StepType,
    name: String,
    label: String,
    tool_name: Option<String>,
    description: String,
    parameters: Vec<ToolParameterDescriptor>,
    prerequisites: Vec<(StepType, String)>,
    website_url: Option<String>,
    constructor: StepConstructor,
}

impl fmt::Debug for PipelineStepProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStepProvider")
            .field("step_type", &self.step_type)
            .field("name", &self.name)
            .field("parameters", &self.parameters.len())
            .field("prerequisites", &self.prerequisites)
            .finish_non_exhaustive()
    }
}

impl PipelineStepProvider {
    pub fn new<F>(
        step_type: StepType,
        name: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParameterDescriptor>,
        constructor: F,
    ) -> Self
    where
        F: Fn(StepBinding) -> Result<PipelineStep> + Send + Sync + 'static,
    {
        Self {
            step_type,
            name: name.into(),
            label: label.into(),
            tool_name: None,
            description: description.into(),
            parameters,
            prerequisites: Vec::new(),
            website_url: None,
            constructor: Arc::new(constructor),
        }
    }

    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_website(mut self, url: impl Into<String>) -> Self {
        self.website_url = Some(url.into());
        self
    }

    pub fn with_prerequisite(mut self, step_type: StepType, name: impl Into<String>) -> Self {
        self.prerequisites.push((step_type, name.into()));
        self
    }

    pub fn step_type(&self) -> StepType {
        self.step_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn website_url(&self) -> Option<&str> {
        self.website_url.as_deref()
    }

    pub fn prerequisites(&self) -> &[(StepType, String)] {
        &self.prerequisites
    }

    /// Parameters in declaration order.
    pub fn get_parameters(&self) -> &[ToolParameterDescriptor] {
        &self.parameters
    }

    pub fn get_parameter_by_name(&self, name: &str) -> Option<&ToolParameterDescriptor> {
        self.parameters.iter().find(|param| param.name() == name)
    }

    /// Concatenates the tokens of every bound parameter in declaration order.
    pub fn client_command_args(
        &self,
        job: &PipelineJob,
        step_idx: usize,
        separator: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for param in &self.parameters {
            args.extend(param.command_line_tokens(job, self, step_idx, separator)?);
        }
        Ok(args)
    }

    /// Builds a step bound to `ctx`. The step must implement the capability
    /// this provider was registered under.
    pub fn create(self: &Arc<Self>, ctx: PipelineContext, step_idx: usize) -> Result<PipelineStep> {
        let step = (self.constructor)(StepBinding {
            provider: Arc::clone(self),
            ctx,
            step_idx,
        })?;
        if step.step_type() != self.step_type {
            return Err(PipelineJobError::CapabilityMismatch {
                name: self.name.clone(),
                declared: self.step_type,
                produced: step.step_type(),
            });
        }
        Ok(step)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "stepType": self.step_type.param_name(),
            "name": self.name,
            "label": self.label,
            "toolName": self.tool_name,
            "description": self.description,
            "websiteURL": self.website_url,
            "parameters": self
                .parameters
                .iter()
                .map(ToolParameterDescriptor::to_json)
                .collect::<Vec<_>>(),
            "prerequisites": self
                .prerequisites
                .iter()
                .map(|(ty, name)| format!("{ty}.{name}"))
                .collect::<Vec<_>>(),
        })
    }
}

/// Registered step providers. Populated during startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<PipelineStepProvider>>,
    index: HashMap<(StepType, String), usize>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: PipelineStepProvider) -> Result<()> {
        let key = (provider.step_type, provider.name.clone());
        if self.index.contains_key(&key) {
            return Err(PipelineJobError::DuplicateProvider {
                step_type: key.0,
                name: key.1,
            });
        }
        self.index.insert(key, self.providers.len());
        self.providers.push(Arc::new(provider));
        Ok(())
    }

    pub fn find(&self, step_type: StepType, name: &str) -> Option<&Arc<PipelineStepProvider>> {
        self.index
            .get(&(step_type, name.to_string()))
            .map(|idx| &self.providers[*idx])
    }

    pub fn get(&self, step_type: StepType, name: &str) -> Result<&Arc<PipelineStepProvider>> {
        self.find(step_type, name)
            .ok_or_else(|| PipelineJobError::UnknownProvider {
                step_type,
                name: name.to_string(),
            })
    }

    /// Providers in registration order.
    pub fn providers(&self) -> impl Iterator<Item = &Arc<PipelineStepProvider>> {
        self.providers.iter()
    }

    pub fn providers_of(
        &self,
        step_type: StepType,
    ) -> impl Iterator<Item = &Arc<PipelineStepProvider>> {
        self.providers
            .iter()
            .filter(move |provider| provider.step_type == step_type)
    }

    pub fn known_providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .providers
            .iter()
            .map(|provider| format!("{}.{}", provider.step_type, provider.name))
            .collect();
        names.sort();
        names
    }

    /// The provider and its transitive prerequisites, dependencies first.
    pub fn resolve_prerequisites(
        &self,
        step_type: StepType,
        name: &str,
    ) -> Result<Vec<Arc<PipelineStepProvider>>> {
        let root = self.get(step_type, name)?;
        let mut ordered = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();
        self.visit(root, &mut visiting, &mut done, &mut ordered)?;
        Ok(ordered)
    }

    fn visit(
        &self,
        provider: &Arc<PipelineStepProvider>,
        visiting: &mut HashSet<(StepType, String)>,
        done: &mut HashSet<(StepType, String)>,
        ordered: &mut Vec<Arc<PipelineStepProvider>>,
    ) -> Result<()> {
        let key = (provider.step_type, provider.name.clone());
        if done.contains(&key) {
            return Ok(());
        }
        if !visiting.insert(key.clone()) {
            return Err(PipelineJobError::PrerequisiteCycle {
                name: provider.name.clone(),
            });
        }
        for (ty, name) in &provider.prerequisites {
            let prerequisite =
                self.find(*ty, name)
                    .ok_or_else(|| PipelineJobError::MissingPrerequisite {
                        name: provider.name.clone(),
                        prerequisite: format!("{ty}.{name}"),
                    })?;
            self.visit(prerequisite, visiting, done, ordered)?;
        }
        visiting.remove(&key);
        done.insert(key);
        ordered.push(Arc::clone(provider));
        Ok(())
    }
}

/// Shared plumbing for steps that drive one external tool: the binding plus
/// an owned [`CommandWrapper`].
#[derive(Debug)]
pub struct CommandStep {
    binding: StepBinding,
    wrapper: CommandWrapper,
}

impl CommandStep {
    pub fn new(binding: StepBinding) -> Self {
        let mut wrapper = CommandWrapper::from_config(binding.ctx.tools());
        wrapper.set_working_dir(binding.ctx.work_dir());
        Self { binding, wrapper }
    }

    pub fn provider(&self) -> &PipelineStepProvider {
        &self.binding.provider
    }

    pub fn ctx(&self) -> &PipelineContext {
        &self.binding.ctx
    }

    pub fn job(&self) -> &PipelineJob {
        self.binding.ctx.job()
    }

    pub fn step_idx(&self) -> usize {
        self.binding.step_idx
    }

    pub fn wrapper(&self) -> &CommandWrapper {
        &self.wrapper
    }

    pub fn wrapper_mut(&mut self) -> &mut CommandWrapper {
        &mut self.wrapper
    }

    pub fn executable(&self, exe: &str, package: Option<&str>) -> PathBuf {
        self.binding.ctx.tools().executable(exe, package)
    }

    pub fn client_command_args(&self, separator: Option<&str>) -> Result<Vec<String>> {
        self.provider()
            .client_command_args(self.job(), self.step_idx(), separator)
    }

    /// Reads parameter `name` of this step's provider from the job.
    pub fn param<T: ParamValue>(&self, name: &str) -> Result<Option<T>> {
        match self.provider().get_parameter_by_name(name) {
            Some(param) => param.extract_value_at(self.job(), self.provider(), self.step_idx()),
            None => Ok(None),
        }
    }

    /// Fails with `MissingOutput` when `path` does not exist, after logging
    /// what the directory does contain.
    pub fn require_output(&self, path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            match std::fs::read_dir(dir) {
                Ok(entries) => {
                    tracing::debug!("files in output directory: {}", dir.display());
                    for entry in entries.flatten() {
                        tracing::debug!("{}", entry.file_name().to_string_lossy());
                    }
                }
                Err(_) => tracing::debug!("output directory not found: {}", dir.display()),
            }
        }
        Err(PipelineJobError::MissingOutput {
            path: path.to_path_buf(),
        })
    }

    /// Copies the wrapper's command history into `output`.
    pub fn record_commands(&self, output: &mut PipelineStepOutput) {
        output.add_commands_executed(self.wrapper.commands_executed());
    }
}
