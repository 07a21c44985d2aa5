use serde_json::json;

use crate::error::Result;
use crate::output::PipelineStepOutput;
use crate::params::{CommandLineParam, ToolParameterDescriptor};
use crate::pipeline::{
    AssemblyStep, CommandStep, PipelineStep, PipelineStepProvider, ReadsInput, StepResult,
    StepType,
};

pub const CONTIGS_ROLE: &str = "Assembled Contigs";

pub fn provider() -> PipelineStepProvider {
    PipelineStepProvider::new(
        StepType::Assembly,
        "TrinityAssembly",
        "Trinity",
        "Trinity is a de novo assembler. It will generate contigs using the input FASTQ reads after processing.",
        vec![ToolParameterDescriptor::create_command_line_param(
            CommandLineParam::create("--min_contig_length"),
            "min_contig_length",
            "Min Contig Length",
            "Any contigs below this value will be discarded",
            "ldk-integerfield",
            None,
            Some(json!(100)),
        )],
        |binding| {
            let mut cmd = CommandStep::new(binding);
            cmd.wrapper_mut().set_throw_non_zero_exits(true);
            Ok(PipelineStep::Assembly(Box::new(TrinityStep { cmd })))
        },
    )
    .with_tool_name("Trinity")
    .with_website("https://github.com/trinityrnaseq/trinityrnaseq/wiki")
}

struct TrinityStep {
    cmd: CommandStep,
}

impl AssemblyStep for TrinityStep {
    fn perform_assembly(&self, input: &ReadsInput<'_>) -> Result<StepResult> {
        let mut args = vec![self.cmd.executable("Trinity", Some("Trinity")).display().to_string()];
        args.extend(self.cmd.client_command_args(None)?);
        if let Some(threads) = self.cmd.job().max_threads() {
            args.push("--CPU".to_string());
            args.push(threads.to_string());
        }
        args.extend(["--seqType".to_string(), "fq".to_string()]);

        let mut output = PipelineStepOutput::new();
        output.add_input(input.fastq1, "Input FASTQ");
        match input.fastq2 {
            Some(fastq2) => {
                output.add_input(fastq2, "Input FASTQ");
                args.push("--left".to_string());
                args.push(input.fastq1.display().to_string());
                args.push("--right".to_string());
                args.push(fastq2.display().to_string());
            }
            None => {
                args.push("--single".to_string());
                args.push(input.fastq1.display().to_string());
            }
        }

        // Trinity refuses output directories whose name lacks "trinity".
        let mut basename = input.basename.to_string();
        if !basename.to_ascii_lowercase().contains("trinity") {
            basename = format!("trinity-{basename}");
        }
        let assembly_dir = input.output_dir.join(basename);
        args.push("--output".to_string());
        args.push(assembly_dir.display().to_string());

        self.cmd.wrapper().execute_with_output(&args)?;

        let fasta = assembly_dir.join("Trinity.fasta");
        self.cmd.require_output(&fasta)?;
        output.add_output(&fasta, CONTIGS_ROLE);
        output.add_sequence_output(
            &fasta,
            format!("{}: Trinity contigs", input.basename),
            CONTIGS_ROLE,
            input.readset.map(|rs| rs.row_id),
            input.genome.and_then(|genome| genome.genome_id),
        );
        self.cmd.record_commands(&mut output);
        Ok(StepResult::new(output, Some(fasta)))
    }
}
