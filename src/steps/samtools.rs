use serde_json::json;

use super::unzipped_base_name;
use crate::error::Result;
use crate::output::PipelineStepOutput;
use crate::params::{CommandLineParam, ToolParameterDescriptor};
use crate::pipeline::{
    AnalysisStep, BamInput, BamProcessingStep, CommandStep, PipelineStep, PipelineStepProvider,
    StepResult, StepType,
};

pub const SORTED_BAM_ROLE: &str = "Sorted BAM";
pub const FLAGSTAT_ROLE: &str = "Flagstat Report";

pub fn sort_provider() -> PipelineStepProvider {
    PipelineStepProvider::new(
        StepType::BamPostProcessing,
        "SamtoolsSort",
        "Sort BAM",
        "Sorts the alignments by coordinate, or by read name when requested.",
        vec![
            ToolParameterDescriptor::create_command_line_param(
                CommandLineParam::create_switch("-n"),
                "sortByName",
                "Sort By Read Name",
                "If checked, reads are sorted by name instead of coordinate",
                "checkbox",
                None,
                Some(json!(false)),
            ),
            ToolParameterDescriptor::create_command_line_param(
                CommandLineParam::create("-l"),
                "compressionLevel",
                "Compression Level",
                "Compression level of the output BAM, 0 to 9",
                "ldk-integerfield",
                Some(json!({ "minValue": 0, "maxValue": 9 })),
                None,
            ),
        ],
        |binding| {
            let mut cmd = CommandStep::new(binding);
            cmd.wrapper_mut().set_throw_non_zero_exits(true);
            Ok(PipelineStep::BamPostProcessing(Box::new(SortStep { cmd })))
        },
    )
    .with_tool_name("samtools")
    .with_website("http://www.htslib.org/")
}

pub fn flagstat_provider() -> PipelineStepProvider {
    PipelineStepProvider::new(
        StepType::Analysis,
        "SamtoolsFlagstat",
        "Flagstat",
        "Summarizes alignment flags of the BAM.",
        Vec::new(),
        |binding| {
            let mut cmd = CommandStep::new(binding);
            cmd.wrapper_mut().set_throw_non_zero_exits(true);
            Ok(PipelineStep::Analysis(Box::new(FlagstatStep { cmd })))
        },
    )
    .with_tool_name("samtools")
    .with_website("http://www.htslib.org/")
}

struct SortStep {
    cmd: CommandStep,
}

impl BamProcessingStep for SortStep {
    fn process_bam(&self, input: &BamInput<'_>) -> Result<StepResult> {
        let sorted = input
            .output_dir
            .join(format!("{}.sorted.bam", unzipped_base_name(input.bam)));

        let mut args = vec![
            self.cmd.executable("samtools", None).display().to_string(),
            "sort".to_string(),
        ];
        if let Some(threads) = self.cmd.job().max_threads() {
            args.push("-@".to_string());
            args.push(threads.to_string());
        }
        args.extend(self.cmd.client_command_args(None)?);
        args.push("-o".to_string());
        args.push(sorted.display().to_string());
        args.push(input.bam.display().to_string());
        self.cmd.wrapper().execute_with_output(&args)?;

        self.cmd.require_output(&sorted)?;

        let mut output = PipelineStepOutput::new();
        output.add_input(input.bam, "Input BAM");
        output.add_output(&sorted, SORTED_BAM_ROLE);
        output.add_intermediate_file(input.bam, None);
        self.cmd.record_commands(&mut output);
        Ok(StepResult::new(output, Some(sorted)))
    }
}

struct FlagstatStep {
    cmd: CommandStep,
}

impl AnalysisStep for FlagstatStep {
    fn perform_analysis(&self, input: &BamInput<'_>) -> Result<StepResult> {
        let report = input
            .output_dir
            .join(format!("{}.flagstat.txt", unzipped_base_name(input.bam)));
        let args = vec![
            self.cmd.executable("samtools", None).display().to_string(),
            "flagstat".to_string(),
            input.bam.display().to_string(),
        ];
        self.cmd.wrapper().execute(&args, Some(&report))?;

        self.cmd.require_output(&report)?;

        let mut output = PipelineStepOutput::new();
        output.add_input(input.bam, "Input BAM");
        output.add_output(&report, FLAGSTAT_ROLE);
        output.add_sequence_output(
            &report,
            format!("Flagstat: {}", unzipped_base_name(input.bam)),
            "Alignment Stats",
            input.readset.map(|rs| rs.row_id),
            input.genome.genome_id,
        );
        self.cmd.record_commands(&mut output);
        Ok(StepResult::new(output, Some(report)))
    }
}
