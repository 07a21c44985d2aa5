use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use seqpipe::cluster::TaskId;
use seqpipe::cluster::engine::{
    ClusterEngineConfig, SubmitTarget, render_submit_script, resolve_resources,
};
use seqpipe::executor::build_pipeline;
use seqpipe::lockfile::generate_lock;
use seqpipe::observability::log_snapshot;
use seqpipe::pipeline::StepType;
use seqpipe::recipe::Recipe;
use seqpipe::services::PipelineServices;
use seqpipe::validation::{ValidationReport, validate_recipe};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match cli.command {
        Commands::ListSteps => list_steps(),
        Commands::Describe {
            step_type,
            provider,
        } => describe_provider(&step_type, &provider),
        Commands::Validate { job } => validate_job_cmd(job),
        Commands::Lock { job, output } => lock_job(job, output),
        Commands::Args {
            job,
            step_type,
            provider,
            separator,
            step_idx,
        } => print_args(job, &step_type, &provider, separator.as_deref(), step_idx),
        Commands::Run {
            job,
            report,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            otlp_endpoint,
        } => {
            let _ = otlp_endpoint; // already handled in tracing configuration
            run_job(
                job,
                report,
                print_metrics,
                metrics_json,
                metrics_prometheus,
            )
        }
        Commands::SubmitScript { job, engine, task } => submit_script(job, engine, task),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "seqpipe", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "seqpipe")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn parse_step_type(raw: &str) -> Result<StepType> {
    raw.parse::<StepType>().map_err(|err| anyhow!(err))
}

fn list_steps() -> Result<()> {
    let services = PipelineServices::with_defaults()?;
    println!("Available steps:");
    for step_type in StepType::ALL {
        let mut providers = services.providers().providers_of(step_type).peekable();
        if providers.peek().is_none() {
            continue;
        }
        println!("{step_type}:");
        for provider in providers {
            match provider.tool_name() {
                Some(tool) => println!("- {} ({tool})", provider.name()),
                None => println!("- {}", provider.name()),
            }
        }
    }
    Ok(())
}

fn describe_provider(step_type: &str, name: &str) -> Result<()> {
    let services = PipelineServices::with_defaults()?;
    let provider = services.providers().get(parse_step_type(step_type)?, name)?;
    let json = serde_json::to_string_pretty(&provider.to_json())?;
    println!("{json}");
    Ok(())
}

/// Logs every finding and turns errors into a single failure.
fn report_findings(job_path: &Path, report: &ValidationReport, action: &str) -> Result<()> {
    for warning in &report.warnings {
        warn!(file = %job_path.display(), "{warning}");
    }
    if report.is_ok() {
        return Ok(());
    }
    for error_msg in &report.errors {
        error!(file = %job_path.display(), "{error_msg}");
    }
    Err(anyhow!(
        "{action} failed with {} validation error(s)",
        report.errors.len()
    ))
}

fn validate_job_cmd(job_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&job_path)?;
    let services = PipelineServices::with_defaults()?;
    let report = validate_recipe(&recipe, services.providers());
    report_findings(&job_path, &report, "Job validation")?;
    info!(file = %job_path.display(), "Job validation passed");
    println!(
        "{}: ok ({} warning(s))",
        job_path.display(),
        report.warnings.len()
    );
    Ok(())
}

fn lock_job(job_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&job_path)?;
    let services = PipelineServices::with_defaults()?;
    let report = validate_recipe(&recipe, services.providers());
    report_findings(&job_path, &report, "Lockfile generation")?;

    ensure_parent_dir(&output_path)?;
    generate_lock(&recipe, services.providers(), &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn print_args(
    job_path: PathBuf,
    step_type: &str,
    name: &str,
    separator: Option<&str>,
    step_idx: usize,
) -> Result<()> {
    let recipe = Recipe::load(&job_path)?;
    let services = PipelineServices::with_defaults()?;
    let provider = services.providers().get(parse_step_type(step_type)?, name)?;
    let job = recipe.to_job(Vec::new())?;
    let args = provider
        .client_command_args(&job, step_idx, separator)
        .with_context(|| format!("Failed to render arguments for {step_type}.{name}"))?;
    println!("{}", args.join(" "));
    Ok(())
}

fn run_job(
    job_path: PathBuf,
    report_path: Option<PathBuf>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
) -> Result<()> {
    let recipe = Recipe::load(&job_path)?;
    let services = PipelineServices::with_defaults()?;
    let validation = validate_recipe(&recipe, services.providers());
    report_findings(&job_path, &validation, "Job run")?;

    let prepared = recipe.prepare(services.providers())?;
    let executor = build_pipeline(services.providers(), &recipe.steps, prepared.ctx)?;
    let metrics_handle = executor.metrics();

    let outcome = executor.execute(prepared.artifact);

    if print_metrics || metrics_json.is_some() || metrics_prometheus.is_some() {
        let snapshot = metrics_handle.snapshot();
        if print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = metrics_json {
            ensure_parent_dir(&path)?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = metrics_prometheus {
            ensure_parent_dir(&path)?;
            std::fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    let report = outcome.with_context(|| format!("Job '{}' failed", recipe.name))?;
    for step in &report.steps {
        info!(
            step = step.step.as_str(),
            commands = step.commands_executed.len(),
            primary = ?step.primary,
            "Step finished"
        );
    }
    info!(
        job = report.job.as_str(),
        outputs = report.output.outputs().len(),
        "Job completed"
    );

    if let Some(path) = report_path {
        ensure_parent_dir(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        to_writer_pretty(file, &report)
            .with_context(|| format!("Failed to write job report: {}", path.display()))?;
        info!(report = %path.display(), "Job report written");
    }
    Ok(())
}

fn submit_script(job_path: PathBuf, engine_path: PathBuf, task: Option<String>) -> Result<()> {
    let recipe = Recipe::load(&job_path)?;
    let config = ClusterEngineConfig::load(&engine_path)?;
    let services = PipelineServices::with_defaults()?;

    let mut job = recipe.to_job(recipe.expand_inputs()?)?;
    if let Some(raw) = task {
        let task: TaskId = raw.parse().map_err(|err: String| anyhow!(err))?;
        job = job.with_active_task(task);
    }

    let request = resolve_resources(&config, services.allocators(), &job);
    info!(
        engine = %config.engine_type,
        allocator = ?request.allocator,
        cpus = ?request.cpus,
        memory_gb = ?request.memory_gb,
        "Resources resolved"
    );
    let target = SubmitTarget::new(&recipe.work_dir, &recipe.name);
    println!("{}", render_submit_script(&config, &request, &target));
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "seqpipe",
    version,
    about = "Sequence analysis pipeline step runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered step providers grouped by step type.
    ListSteps,
    /// Print a provider's parameters as JSON.
    Describe { step_type: String, provider: String },
    Validate {
        job: PathBuf,
    },
    Lock {
        job: PathBuf,
        output: PathBuf,
    },
    /// Print the command-line arguments a provider renders for a job.
    Args {
        job: PathBuf,
        step_type: String,
        provider: String,
        #[arg(long)]
        separator: Option<String>,
        #[arg(long = "step-idx", default_value_t = 0)]
        step_idx: usize,
    },
    Run {
        job: PathBuf,
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Render a cluster submission script for a job.
    SubmitScript {
        job: PathBuf,
        #[arg(long)]
        engine: PathBuf,
        #[arg(long)]
        task: Option<String>,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
