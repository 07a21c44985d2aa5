use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{PipelineJobError, Result};
use crate::observability::MetricsCollector;
use crate::output::PipelineStepOutput;
use crate::pipeline::{
    BamInput, PipelineContext, PipelineStep, PipelineStepProvider, ProviderRegistry, ReadsInput,
    StepResult, StepType, VcfInput,
};
use crate::support::{ReferenceGenome, Readset};

/// One entry of a job's ordered step list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_type: StepType,
    pub provider: String,
}

/// The files a job is currently working on. Each step reads the slot its
/// capability consumes and may replace it with what it produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobArtifact {
    pub readset: Option<Readset>,
    pub genome: Option<ReferenceGenome>,
    pub fastq1: Option<PathBuf>,
    pub fastq2: Option<PathBuf>,
    pub bam: Option<PathBuf>,
    pub vcf: Option<PathBuf>,
    pub contigs: Option<PathBuf>,
    pub aligner_index: Option<PathBuf>,
    /// Files handed to the job. Steps may consume them but they are never
    /// classified for deletion.
    pub supplied: BTreeSet<PathBuf>,
}

impl JobArtifact {
    /// Sorts input files into slots by extension. Unrecognized files are skipped.
    pub fn from_inputs(inputs: &[PathBuf]) -> Self {
        let mut artifact = Self {
            supplied: inputs.iter().cloned().collect(),
            ..Self::default()
        };
        for input in inputs {
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            let name = name.strip_suffix(".gz").unwrap_or(&name);
            if name.ends_with(".fastq") || name.ends_with(".fq") {
                if artifact.fastq1.is_none() {
                    artifact.fastq1 = Some(input.clone());
                } else if artifact.fastq2.is_none() {
                    artifact.fastq2 = Some(input.clone());
                }
            } else if name.ends_with(".bam") {
                artifact.bam = Some(input.clone());
            } else if name.ends_with(".vcf") {
                artifact.vcf = Some(input.clone());
            } else {
                debug!(input = %input.display(), "Ignoring unrecognized input");
            }
        }
        artifact
    }

    pub fn with_genome(mut self, genome: Option<ReferenceGenome>) -> Self {
        if let Some(genome) = &genome {
            self.supplied.insert(genome.source_fasta.clone());
        }
        self.genome = genome;
        self
    }

    pub fn with_readset(mut self, readset: Option<Readset>) -> Self {
        self.readset = readset;
        self
    }

    /// Base name used for files derived from the reads.
    pub fn basename(&self) -> String {
        if let Some(readset) = &self.readset {
            return readset.name.replace(char::is_whitespace, "_");
        }
        self.fastq1
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| {
                let n = n.to_string_lossy();
                n.split('.').next().unwrap_or_default().to_string()
            })
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "reads".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub provider: Arc<PipelineStepProvider>,
    pub step_idx: usize,
}

impl PlannedStep {
    pub fn label(&self) -> String {
        let base = format!("{}.{}", self.provider.step_type(), self.provider.name());
        if self.step_idx > 0 {
            format!("{base}.{}", self.step_idx)
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    pub primary: Option<PathBuf>,
    pub commands_executed: Vec<String>,
}

/// What a finished job hands to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub steps: Vec<StepReport>,
    pub output: PipelineStepOutput,
    pub artifact: JobArtifact,
}

pub struct PipelineExecutor {
    steps: Vec<PlannedStep>,
    ctx: PipelineContext,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(steps: Vec<PlannedStep>, ctx: PipelineContext) -> Self {
        Self {
            steps,
            ctx,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Runs every step in order against `artifact`. The first failure stops
    /// the job; no later step is started.
    #[instrument(skip(self, artifact), fields(job = self.ctx.job().name()))]
    pub fn process(
        &self,
        artifact: &mut JobArtifact,
    ) -> Result<(PipelineStepOutput, Vec<StepReport>)> {
        let mut ledger = PipelineStepOutput::new();
        let mut reports = Vec::with_capacity(self.steps.len());
        for planned in &self.steps {
            let label = planned.label();
            let span = tracing::span!(tracing::Level::DEBUG, "step", step = label.as_str());
            let _span_guard = span.enter();
            let _timer = self.metrics.start_step(&label);

            let mut result = match self.run_step(planned, artifact) {
                Ok(result) => result,
                Err(err) => {
                    self.metrics.record_step_failure();
                    return Err(err);
                }
            };
            result
                .output
                .retain_files(artifact.supplied.iter().map(PathBuf::as_path));
            self.metrics
                .record_step_success(result.output.commands_executed().len());
            apply_primary(planned.provider.step_type(), result.primary.clone(), artifact);
            info!(step = label.as_str(), primary = ?result.primary, "Step completed");

            reports.push(StepReport {
                step: label,
                primary: result.primary,
                commands_executed: result.output.commands_executed().to_vec(),
            });
            ledger.merge(result.output);
        }
        Ok((ledger, reports))
    }

    pub fn execute(&self, mut artifact: JobArtifact) -> Result<JobReport> {
        self.metrics.reset();
        let started = Instant::now();
        let outcome = self.process(&mut artifact);
        self.metrics.record_total_duration(started.elapsed());
        let (output, steps) = outcome?;
        Ok(JobReport {
            job: self.ctx.job().name().to_string(),
            steps,
            output,
            artifact,
        })
    }

    fn run_step(&self, planned: &PlannedStep, artifact: &JobArtifact) -> Result<StepResult> {
        let provider = &planned.provider;
        let output_dir = self.step_output_dir(planned);
        fs::create_dir_all(&output_dir).map_err(|err| {
            PipelineJobError::io(
                format!("Failed to create step directory {}", output_dir.display()),
                err,
            )
        })?;

        let step = provider.create(self.ctx.clone(), planned.step_idx)?;
        debug!(step_type = %step.step_type(), dir = %output_dir.display(), "Dispatching step");
        let missing = |what: &str| {
            PipelineJobError::MissingInput(format!("{what} for {}", planned.label()))
        };

        match step {
            PipelineStep::ReferenceLibrary(step) => {
                let genome = artifact.genome.as_ref().ok_or_else(|| missing("reference genome"))?;
                step.create_index(genome, &output_dir)
            }
            PipelineStep::Assembly(step) => {
                let fastq1 = artifact.fastq1.as_deref().ok_or_else(|| missing("FASTQ file"))?;
                let basename = artifact.basename();
                step.perform_assembly(&ReadsInput {
                    readset: artifact.readset.as_ref(),
                    fastq1,
                    fastq2: artifact.fastq2.as_deref(),
                    genome: artifact.genome.as_ref(),
                    output_dir: &output_dir,
                    basename: &basename,
                })
            }
            PipelineStep::BamPostProcessing(step) => {
                let input = bam_input(artifact, &output_dir, missing)?;
                step.process_bam(&input)
            }
            PipelineStep::Analysis(step) => {
                let input = bam_input(artifact, &output_dir, missing)?;
                step.perform_analysis(&input)
            }
            PipelineStep::VariantProcessing(step) => {
                let vcf = artifact.vcf.as_deref().ok_or_else(|| missing("VCF file"))?;
                let genome = artifact.genome.as_ref().ok_or_else(|| missing("reference genome"))?;
                step.process_variants(&VcfInput {
                    vcf,
                    genome,
                    output_dir: &output_dir,
                })
            }
        }
    }

    fn step_output_dir(&self, planned: &PlannedStep) -> PathBuf {
        let mut dir = planned.provider.name().to_ascii_lowercase().replace(' ', "_");
        if planned.step_idx > 0 {
            dir.push_str(&format!("_{}", planned.step_idx));
        }
        self.ctx.work_dir().join(dir)
    }
}

fn bam_input<'a>(
    artifact: &'a JobArtifact,
    output_dir: &'a Path,
    missing: impl Fn(&str) -> PipelineJobError,
) -> Result<BamInput<'a>> {
    Ok(BamInput {
        readset: artifact.readset.as_ref(),
        bam: artifact.bam.as_deref().ok_or_else(|| missing("BAM file"))?,
        genome: artifact.genome.as_ref().ok_or_else(|| missing("reference genome"))?,
        output_dir,
    })
}

fn apply_primary(step_type: StepType, primary: Option<PathBuf>, artifact: &mut JobArtifact) {
    let Some(primary) = primary else {
        return;
    };
    match step_type {
        StepType::ReferenceLibraryCreation => artifact.aligner_index = Some(primary),
        StepType::Assembly => artifact.contigs = Some(primary),
        StepType::BamPostProcessing => artifact.bam = Some(primary),
        StepType::VariantProcessing => artifact.vcf = Some(primary),
        StepType::Analysis => {}
    }
}

/// Resolves each spec against the registry, numbering repeated providers so
/// their job parameters stay distinct.
pub fn plan_steps(registry: &ProviderRegistry, specs: &[StepSpec]) -> Result<Vec<PlannedStep>> {
    let mut seen: HashMap<(StepType, &str), usize> = HashMap::new();
    let mut planned = Vec::with_capacity(specs.len());
    for spec in specs {
        let provider = registry.get(spec.step_type, &spec.provider)?;
        let counter = seen.entry((spec.step_type, spec.provider.as_str())).or_insert(0);
        planned.push(PlannedStep {
            provider: Arc::clone(provider),
            step_idx: *counter,
        });
        *counter += 1;
    }
    Ok(planned)
}

pub fn build_pipeline(
    registry: &ProviderRegistry,
    specs: &[StepSpec],
    ctx: PipelineContext,
) -> Result<PipelineExecutor> {
    let steps = plan_steps(registry, specs)?;
    Ok(PipelineExecutor::new(steps, ctx))
}
