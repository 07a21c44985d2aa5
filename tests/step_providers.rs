use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use seqpipe::error::PipelineJobError;
use seqpipe::executor::{JobArtifact, StepSpec, build_pipeline};
use seqpipe::job::PipelineJob;
use seqpipe::output::PipelineStepOutput;
use seqpipe::params::{CommandLineParam, ToolParameterDescriptor};
use seqpipe::pipeline::{
    AnalysisStep, BamInput, BamProcessingStep, PipelineContext, PipelineStep,
    PipelineStepProvider, StepResult, StepType,
};
use seqpipe::services::{PipelineServices, ServicesBuilder};
use seqpipe::support::{ReferenceGenome, SequenceJobSupport};
use seqpipe::wrapper::ToolConfig;
use tempfile::tempdir;

fn job(params: &[(&str, &str)]) -> PipelineJob {
    let params: BTreeMap<_, _> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    PipelineJob::new("test-job", params).with_max_threads(None)
}

fn context(job: PipelineJob, work_dir: &Path) -> PipelineContext {
    PipelineContext::new(
        Arc::new(job),
        Arc::new(SequenceJobSupport::new()),
        Arc::new(ToolConfig::default()),
        work_dir,
    )
}

#[test]
fn trinity_arguments_come_from_job_parameters() {
    let services = PipelineServices::with_defaults().unwrap();
    let trinity = services
        .providers()
        .get(StepType::Assembly, "TrinityAssembly")
        .unwrap();

    let with_length = job(&[("Assembly.TrinityAssembly.min_contig_length", "150")]);
    assert_eq!(
        trinity.client_command_args(&with_length, 0, None).unwrap(),
        vec!["--min_contig_length", "150"]
    );
    assert_eq!(
        trinity.client_command_args(&with_length, 0, Some("=")).unwrap(),
        vec!["--min_contig_length=150"]
    );
    // The second use of a provider reads suffixed keys only.
    assert!(trinity.client_command_args(&with_length, 1, None).unwrap().is_empty());

    let blank = job(&[("Assembly.TrinityAssembly.min_contig_length", "")]);
    assert!(trinity.client_command_args(&blank, 0, None).unwrap().is_empty());
}

#[test]
fn command_args_follow_declaration_order() {
    let bound = |param, name: &str| {
        ToolParameterDescriptor::create_command_line_param(
            param,
            name,
            name,
            "",
            "textfield",
            None,
            None,
        )
    };
    let provider = PipelineStepProvider::new(
        StepType::Analysis,
        "Mixed",
        "Mixed",
        "Bound, unbound and positional parameters",
        vec![
            bound(CommandLineParam::create("-a"), "alpha"),
            ToolParameterDescriptor::create("note", "Note", "", "textfield", None, None),
            bound(CommandLineParam::create_switch("--fast"), "fast"),
            bound(CommandLineParam::create_switch("--slow"), "slow"),
            bound(CommandLineParam::create("-b"), "beta"),
            bound(CommandLineParam::Positional, "target"),
        ],
        |_| Err(PipelineJobError::MissingInput("unused".into())),
    );
    let mixed = job(&[
        ("Analysis.Mixed.alpha", "1"),
        ("Analysis.Mixed.note", "ignored"),
        ("Analysis.Mixed.fast", "true"),
        ("Analysis.Mixed.slow", "false"),
        ("Analysis.Mixed.target", "reads.fq"),
    ]);

    assert_eq!(
        provider.client_command_args(&mixed, 0, None).unwrap(),
        vec!["-a", "1", "--fast", "reads.fq"]
    );
    assert_eq!(
        provider.client_command_args(&mixed, 0, Some("=")).unwrap(),
        vec!["-a=1", "--fast", "reads.fq"]
    );
}

#[test]
fn provider_json_lists_parameters() {
    let services = PipelineServices::with_defaults().unwrap();
    let sort = services
        .providers()
        .get(StepType::BamPostProcessing, "SamtoolsSort")
        .unwrap();
    let json = sort.to_json();
    assert_eq!(json["name"], "SamtoolsSort");
    assert_eq!(json["stepType"], "BamPostProcessing");
    assert_eq!(json["parameters"][0]["name"], "sortByName");
    assert_eq!(json["parameters"][0]["commandLineParam"], "-n");
    assert_eq!(json["parameters"][1]["fieldXtype"], "ldk-integerfield");
}

#[test]
fn mismatched_capability_is_rejected() {
    struct Noop;

    impl AnalysisStep for Noop {
        fn perform_analysis(&self, _input: &BamInput<'_>) -> seqpipe::Result<StepResult> {
            Ok(StepResult::default())
        }
    }

    let mut builder = ServicesBuilder::new();
    builder
        .register_provider(PipelineStepProvider::new(
            StepType::BamPostProcessing,
            "Liar",
            "Liar",
            "Claims to process BAMs",
            Vec::new(),
            |_| Ok(PipelineStep::Analysis(Box::new(Noop))),
        ))
        .unwrap();
    let services = builder.build();

    let dir = tempdir().unwrap();
    let provider = services
        .providers()
        .get(StepType::BamPostProcessing, "Liar")
        .unwrap();
    let err = provider.create(context(job(&[]), dir.path()), 0).unwrap_err();
    assert!(matches!(
        err,
        PipelineJobError::CapabilityMismatch {
            declared: StepType::BamPostProcessing,
            produced: StepType::Analysis,
            ..
        }
    ));
}

struct CopyBam {
    calls: Arc<AtomicUsize>,
}

impl BamProcessingStep for CopyBam {
    fn process_bam(&self, input: &BamInput<'_>) -> seqpipe::Result<StepResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let copy = input.output_dir.join("copy.bam");
        std::fs::copy(input.bam, &copy)
            .map_err(|err| PipelineJobError::io("copy failed", err))?;
        let mut output = PipelineStepOutput::new();
        output.add_output(&copy, "Copied BAM");
        output.add_intermediate_file(input.bam, None);
        output.add_commands_executed(["cp"]);
        Ok(StepResult::new(output, Some(copy)))
    }
}

struct Inspect {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl AnalysisStep for Inspect {
    fn perform_analysis(&self, input: &BamInput<'_>) -> seqpipe::Result<StepResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PipelineJobError::NonZeroExit {
                program: "inspect".into(),
                code: 2,
            });
        }
        let mut output = PipelineStepOutput::new();
        output.add_input(input.bam, "Inspected BAM");
        Ok(StepResult::new(output, None))
    }
}

fn services(
    copies: &Arc<AtomicUsize>,
    inspections: &Arc<AtomicUsize>,
    fail: bool,
) -> PipelineServices {
    let mut builder = ServicesBuilder::new();
    let copy_calls = Arc::clone(copies);
    builder
        .register_provider(PipelineStepProvider::new(
            StepType::BamPostProcessing,
            "Copy",
            "Copy",
            "Copies the BAM",
            Vec::new(),
            move |_| {
                Ok(PipelineStep::BamPostProcessing(Box::new(CopyBam {
                    calls: Arc::clone(&copy_calls),
                })))
            },
        ))
        .unwrap();
    let inspect_calls = Arc::clone(inspections);
    builder
        .register_provider(
            PipelineStepProvider::new(
                StepType::Analysis,
                "Inspect",
                "Inspect",
                "Looks at the BAM",
                Vec::new(),
                move |_| {
                    Ok(PipelineStep::Analysis(Box::new(Inspect {
                        calls: Arc::clone(&inspect_calls),
                        fail,
                    })))
                },
            )
            .with_prerequisite(StepType::BamPostProcessing, "Copy"),
        )
        .unwrap();
    builder.build()
}

fn specs() -> Vec<StepSpec> {
    vec![
        StepSpec {
            step_type: StepType::BamPostProcessing,
            provider: "Copy".into(),
        },
        StepSpec {
            step_type: StepType::Analysis,
            provider: "Inspect".into(),
        },
        StepSpec {
            step_type: StepType::BamPostProcessing,
            provider: "Copy".into(),
        },
    ]
}

fn artifact(dir: &Path) -> JobArtifact {
    let bam = dir.join("sample.bam");
    std::fs::write(&bam, b"BAM\x01").unwrap();
    JobArtifact::from_inputs(&[bam])
        .with_genome(Some(ReferenceGenome::new(dir.join("genome.fasta"), Some(1))))
}

#[test]
fn executor_chains_primary_outputs_and_merges_ledgers() {
    let dir = tempdir().unwrap();
    let copies = Arc::new(AtomicUsize::new(0));
    let inspections = Arc::new(AtomicUsize::new(0));
    let services = services(&copies, &inspections, false);

    let resolved = services
        .providers()
        .resolve_prerequisites(StepType::Analysis, "Inspect")
        .unwrap();
    let names: Vec<_> = resolved.iter().map(|p| p.name().to_string()).collect();
    assert_eq!(names, vec!["Copy", "Inspect"]);

    let work = dir.path().join("work");
    let executor =
        build_pipeline(services.providers(), &specs(), context(job(&[]), &work)).unwrap();
    let labels: Vec<_> = executor.steps().iter().map(|s| s.label()).collect();
    assert_eq!(
        labels,
        vec!["BamPostProcessing.Copy", "Analysis.Inspect", "BamPostProcessing.Copy.1"]
    );

    let report = executor.execute(artifact(dir.path())).unwrap();
    assert_eq!(copies.load(Ordering::SeqCst), 2);
    assert_eq!(inspections.load(Ordering::SeqCst), 1);

    let first_copy = work.join("copy").join("copy.bam");
    let second_copy = work.join("copy_1").join("copy.bam");
    assert_eq!(report.artifact.bam.as_deref(), Some(second_copy.as_path()));
    assert_eq!(std::fs::read(&second_copy).unwrap(), b"BAM\x01");

    assert_eq!(report.output.outputs().len(), 2);
    assert_eq!(report.output.inputs()[0].file, first_copy);
    // Only BAMs the job produced itself are intermediates.
    let intermediates = report.output.intermediate_files();
    assert!(!intermediates.contains(&dir.path().join("sample.bam")));
    assert!(intermediates.contains(&first_copy));
    // Intermediates are only classified, never removed.
    assert!(dir.path().join("sample.bam").exists());
    assert!(first_copy.exists());

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.steps_succeeded, 3);
    assert_eq!(snapshot.steps_failed, 0);
    assert_eq!(snapshot.commands_executed, 2);
    assert!(snapshot.steps.contains_key("BamPostProcessing.Copy.1"));
}

#[test]
fn first_failure_stops_the_job() {
    let dir = tempdir().unwrap();
    let copies = Arc::new(AtomicUsize::new(0));
    let inspections = Arc::new(AtomicUsize::new(0));
    let services = services(&copies, &inspections, true);

    let executor = build_pipeline(
        services.providers(),
        &specs(),
        context(job(&[]), &dir.path().join("work")),
    )
    .unwrap();
    let err = executor.execute(artifact(dir.path())).unwrap_err();
    assert!(matches!(err, PipelineJobError::NonZeroExit { code: 2, .. }));
    assert_eq!(copies.load(Ordering::SeqCst), 1);
    assert_eq!(inspections.load(Ordering::SeqCst), 1);

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.steps_succeeded, 1);
    assert_eq!(snapshot.steps_failed, 1);
}

#[test]
fn missing_inputs_are_reported_before_running() {
    let dir = tempdir().unwrap();
    let copies = Arc::new(AtomicUsize::new(0));
    let inspections = Arc::new(AtomicUsize::new(0));
    let services = services(&copies, &inspections, false);

    let executor = build_pipeline(
        services.providers(),
        &specs()[..1],
        context(job(&[]), &dir.path().join("work")),
    )
    .unwrap();
    let empty = JobArtifact::from_inputs(&[PathBuf::from("notes.txt")]);
    let err = executor.execute(empty).unwrap_err();
    assert!(matches!(err, PipelineJobError::MissingInput(_)));
    assert_eq!(copies.load(Ordering::SeqCst), 0);
}
