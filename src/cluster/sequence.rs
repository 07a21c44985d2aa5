use std::fs;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use super::{AllocatorFactory, ClusterResourceAllocator, EngineType, TaskId};
use crate::job::PipelineJob;
use crate::params::convert;

/// Tasks under this namespace belong to the sequence pipeline.
pub const SEQUENCE_TASK_NAMESPACE: &str = "sequenceanalysis.pipeline";
pub const SEQUENCE_PRIORITY: i32 = 50;

const CPUS_KEY: &str = "resourceSettings.resourceSettings.cpus";
const RAM_KEY: &str = "resourceSettings.resourceSettings.ram";
const WEEK_LONG_KEY: &str = "resourceSettings.resourceSettings.weekLongJob";
const HIGH_IO_KEY: &str = "resourceSettings.resourceSettings.highio";
/// Recipe parameter naming the aligner(s) a job runs, e.g. `alignment: STAR`.
/// No step type writes it, so recipes that align set it explicitly.
pub const ALIGNER_KEY: &str = "alignment";

const GB: f64 = 1e9;
const LARGE_TOOL_RAM: u32 = 48;

#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceJobResourceAllocatorFactory;

impl AllocatorFactory for SequenceJobResourceAllocatorFactory {
    fn name(&self) -> &str {
        "SequenceJobResourceAllocator"
    }

    fn allocator(&self) -> Box<dyn ClusterResourceAllocator> {
        Box::new(SequenceJobResourceAllocator::default())
    }

    fn priority(&self, task: &TaskId) -> Option<i32> {
        task.namespace
            .starts_with(SEQUENCE_TASK_NAMESPACE)
            .then_some(SEQUENCE_PRIORITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Normalization,
    Alignment,
    CacheAlignerIndexes,
    OutputHandler,
    Other,
}

impl TaskKind {
    fn of(job: &PipelineJob) -> Self {
        let Some(task) = job.active_task() else {
            return TaskKind::Other;
        };
        match task.simple_name() {
            name if name.ends_with("SequenceNormalizationTask") => TaskKind::Normalization,
            name if name.ends_with("SequenceAlignmentTask") => TaskKind::Alignment,
            name if name.ends_with("CacheAlignerIndexesTask") => TaskKind::CacheAlignerIndexes,
            name if name.ends_with("SequenceOutputHandlerRemoteTask") => TaskKind::OutputHandler,
            _ => TaskKind::Other,
        }
    }
}

/// Sizes requests for sequence pipeline tasks from job overrides, the task
/// kind and the total size of the job's input files.
#[derive(Debug, Default)]
pub struct SequenceJobResourceAllocator {
    total_file_size: OnceCell<Option<u64>>,
}

impl SequenceJobResourceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes across existing input files, or `None` when the job has no
    /// inputs to measure. Computed once per allocator.
    fn total_file_size(&self, job: &PipelineJob) -> Option<u64> {
        *self.total_file_size.get_or_init(|| {
            let files = job.input_files();
            if files.is_empty() {
                return None;
            }
            let total: u64 = files
                .iter()
                .filter_map(|file| fs::metadata(file).ok())
                .map(|meta| meta.len())
                .sum();
            info!(files = files.len(), total_bytes = total, "Measured job input files");
            Some(total)
        })
    }

    fn job_override<T: crate::params::ParamValue>(job: &PipelineJob, key: &str) -> Option<T> {
        let raw = job.parameter(key)?;
        match convert(key, raw) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!("ignoring job resource setting: {err}");
                None
            }
        }
    }

    fn uses_tool(job: &PipelineJob, step_key: &str, tool: &str) -> bool {
        job.parameter(step_key)
            .is_some_and(|providers| providers.contains(tool))
    }

    fn add_week_long_lines(engine: EngineType, lines: &mut Vec<String>) {
        match engine {
            EngineType::HtCondor => lines.push("concurrency_limits = WEEK_LONG_JOBS".to_string()),
            EngineType::Slurm => {
                lines.retain(|line| {
                    !line.contains("#SBATCH --partition=") && !line.contains("#SBATCH --time=")
                });
                lines.push("#SBATCH --partition=long_jobs".to_string());
                lines.push("#SBATCH --time=14400".to_string());
            }
        }
    }

    fn add_high_io_flag(job: &PipelineJob, engine: EngineType, lines: &mut Vec<String>) {
        if Self::job_override::<bool>(job, HIGH_IO_KEY) != Some(true) {
            return;
        }
        match engine {
            EngineType::HtCondor => {
                debug!("adding highio as supplied by job");
                lines.push("concurrency_limits = highio".to_string());
            }
            other => debug!("highio was selected, but it is not supported on {other}"),
        }
    }
}

impl ClusterResourceAllocator for SequenceJobResourceAllocator {
    fn max_request_cpus(&self, job: &PipelineJob) -> Option<u32> {
        if let Some(cpus) = Self::job_override::<u32>(job, CPUS_KEY) {
            debug!("using CPUs supplied by job: {cpus}");
            return Some(cpus);
        }

        let kind = TaskKind::of(job);
        if kind == TaskKind::Normalization {
            debug!("setting max CPUs to 8");
            return Some(8);
        }

        let total = self.total_file_size(job)? as f64;
        if kind != TaskKind::Alignment {
            return None;
        }
        let cpus = if total < 10.0 * GB {
            8
        } else if total < 20.0 * GB {
            16
        } else {
            24
        };
        debug!(total_bytes = total, cpus, "CPUs sized from input files");
        Some(cpus)
    }

    fn max_request_memory(&self, job: &PipelineJob) -> Option<u32> {
        let mut ram = Self::job_override::<u32>(job, RAM_KEY);
        if let Some(ram) = ram {
            debug!("using RAM supplied by job: {ram}");
        }

        let kind = TaskKind::of(job);
        match kind {
            TaskKind::Normalization => {
                debug!("setting memory to 24");
                return Some(24);
            }
            TaskKind::CacheAlignerIndexes => {
                debug!("setting memory to 48");
                return Some(48);
            }
            _ => {}
        }

        let Some(total) = self.total_file_size(job) else {
            return ram;
        };

        let mut large_tools = Vec::new();
        if matches!(kind, TaskKind::Alignment | TaskKind::OutputHandler)
            && Self::uses_tool(job, "analysis", "HaplotypeCaller")
        {
            large_tools.push("HaplotypeCaller");
        }
        if kind == TaskKind::Alignment {
            if ram.is_none() {
                ram = Some(if total as f64 <= 30.0 * GB { 24 } else { 48 });
                debug!(total_bytes = total, ram, "memory sized from input files");
            }
            for tool in ["STAR", "Bismark", "Bowtie2"] {
                if Self::uses_tool(job, ALIGNER_KEY, tool) {
                    large_tools.push(tool);
                }
            }
        }

        for tool in large_tools {
            let adjusted = ram.map_or(LARGE_TOOL_RAM, |current| current.max(LARGE_TOOL_RAM));
            if ram != Some(adjusted) {
                debug!("adjusting RAM for {tool} to: {adjusted}");
            }
            ram = Some(adjusted);
        }
        ram
    }

    fn add_extra_submit_script_lines(
        &self,
        job: &PipelineJob,
        engine: EngineType,
        lines: &mut Vec<String>,
    ) {
        if Self::job_override::<bool>(job, WEEK_LONG_KEY) == Some(true) {
            debug!("adding week-long job lines as supplied by job");
            Self::add_week_long_lines(engine, lines);
            return;
        }
        Self::add_high_io_flag(job, engine, lines);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;

    use super::*;

    fn task(name: &str) -> TaskId {
        TaskId::new(format!("{SEQUENCE_TASK_NAMESPACE}.{name}"))
    }

    fn job(params: &[(&str, &str)], task_name: &str) -> PipelineJob {
        let params: BTreeMap<_, _> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineJob::new("test", params)
            .with_active_task(task(task_name))
            .with_max_threads(None)
    }

    fn sized_input(bytes: u64) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fastq");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn priority_only_for_sequence_tasks() {
        let factory = SequenceJobResourceAllocatorFactory;
        assert_eq!(factory.priority(&task("SequenceAlignmentTask")), Some(50));
        assert_eq!(factory.priority(&TaskId::new("cluster.ClusterTask")), None);
    }

    #[test]
    fn job_overrides_win() {
        let job = job(&[(CPUS_KEY, "12"), (RAM_KEY, "64")], "SequenceAlignmentTask");
        let allocator = SequenceJobResourceAllocator::new();
        assert_eq!(allocator.max_request_cpus(&job), Some(12));
        assert_eq!(allocator.max_request_memory(&job), Some(64));
    }

    #[test]
    fn normalization_task_is_fixed() {
        let job = job(&[], "SequenceNormalizationTask");
        let allocator = SequenceJobResourceAllocator::new();
        assert_eq!(allocator.max_request_cpus(&job), Some(8));
        assert_eq!(allocator.max_request_memory(&job), Some(24));
    }

    #[test]
    fn small_alignment_inputs_get_small_requests() {
        let (_dir, input) = sized_input(1024);
        let job = job(&[], "SequenceAlignmentTask").with_input_files(vec![input]);
        let allocator = SequenceJobResourceAllocator::new();
        assert_eq!(allocator.max_request_cpus(&job), Some(8));
        assert_eq!(allocator.max_request_memory(&job), Some(24));
    }

    #[test]
    fn large_tools_raise_memory_floor() {
        let (_dir, input) = sized_input(10);
        let job = job(&[(ALIGNER_KEY, "STAR")], "SequenceAlignmentTask")
            .with_input_files(vec![input]);
        let allocator = SequenceJobResourceAllocator::new();
        assert_eq!(allocator.max_request_memory(&job), Some(48));
    }

    #[test]
    fn without_inputs_there_is_no_opinion() {
        let job = job(&[], "SequenceAlignmentTask");
        let allocator = SequenceJobResourceAllocator::new();
        assert_eq!(allocator.max_request_cpus(&job), None);
        assert_eq!(allocator.max_request_memory(&job), None);
    }

    #[test]
    fn week_long_slurm_replaces_partition() {
        let job = job(&[(WEEK_LONG_KEY, "true")], "SequenceAlignmentTask");
        let mut lines = vec![
            "#SBATCH --partition=exacloud".to_string(),
            "#SBATCH --time=2160".to_string(),
            "#SBATCH --qos=normal".to_string(),
        ];
        SequenceJobResourceAllocator::new().add_extra_submit_script_lines(
            &job,
            EngineType::Slurm,
            &mut lines,
        );
        assert_eq!(
            lines,
            vec![
                "#SBATCH --qos=normal",
                "#SBATCH --partition=long_jobs",
                "#SBATCH --time=14400",
            ]
        );
    }

    #[test]
    fn high_io_only_on_htcondor() {
        let job = job(&[(HIGH_IO_KEY, "yes")], "SequenceAlignmentTask");
        let allocator = SequenceJobResourceAllocator::new();

        let mut condor = Vec::new();
        allocator.add_extra_submit_script_lines(&job, EngineType::HtCondor, &mut condor);
        assert_eq!(condor, vec!["concurrency_limits = highio"]);

        let mut slurm = Vec::new();
        allocator.add_extra_submit_script_lines(&job, EngineType::Slurm, &mut slurm);
        assert!(slurm.is_empty());
    }

    #[test]
    fn file_size_is_measured_once() {
        let (_dir, input) = sized_input(5);
        let job = job(&[], "SequenceAlignmentTask").with_input_files(vec![input.clone()]);
        let allocator = SequenceJobResourceAllocator::new();
        assert_eq!(allocator.total_file_size(&job), Some(5));

        let mut file = std::fs::OpenOptions::new().append(true).open(&input).unwrap();
        file.write_all(b"more bytes").unwrap();
        assert_eq!(allocator.total_file_size(&job), Some(5));
    }
}
