use std::path::Path;

use serde_json::json;

use crate::error::{PipelineJobError, Result};
use crate::output::PipelineStepOutput;
use crate::params::{CommandLineParam, ToolParameterDescriptor};
use crate::pipeline::{
    CommandStep, PipelineStep, PipelineStepProvider, ReferenceLibraryStep, StepResult, StepType,
};
use crate::support::ReferenceGenome;

pub const INDEX_ROLE: &str = "BWA Index";

pub fn index_provider() -> PipelineStepProvider {
    PipelineStepProvider::new(
        StepType::ReferenceLibraryCreation,
        "BWA",
        "BWA Index",
        "Builds the BWA index for the reference genome. The index is kept until the job finishes so every alignment can reuse it.",
        vec![ToolParameterDescriptor::create_command_line_param(
            CommandLineParam::create("-a"),
            "algorithm",
            "Index Algorithm",
            "BWT construction algorithm: is for small genomes, bwtsw for large ones",
            "ldk-simplecombo",
            Some(json!({ "storeValues": "is;bwtsw" })),
            None,
        )],
        |binding| {
            let mut cmd = CommandStep::new(binding);
            cmd.wrapper_mut().set_throw_non_zero_exits(true);
            Ok(PipelineStep::ReferenceLibrary(Box::new(BwaIndexStep { cmd })))
        },
    )
    .with_tool_name("BWA")
    .with_website("http://bio-bwa.sourceforge.net/")
}

struct BwaIndexStep {
    cmd: CommandStep,
}

impl ReferenceLibraryStep for BwaIndexStep {
    fn create_index(&self, genome: &ReferenceGenome, output_dir: &Path) -> Result<StepResult> {
        let fasta = genome.working_fasta_file();
        let index_dir = output_dir.join("bwa");
        std::fs::create_dir_all(&index_dir).map_err(|err| {
            PipelineJobError::io(
                format!("Failed to create index directory {}", index_dir.display()),
                err,
            )
        })?;
        let stem = fasta
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "genome".to_string());
        let prefix = index_dir.join(&stem);

        let mut args = vec![
            self.cmd.executable("bwa", Some("BWA")).display().to_string(),
            "index".to_string(),
        ];
        args.extend(self.cmd.client_command_args(None)?);
        args.push("-p".to_string());
        args.push(prefix.display().to_string());
        args.push(fasta.display().to_string());
        self.cmd.wrapper().execute_with_output(&args)?;

        self.cmd.require_output(&index_dir.join(format!("{stem}.bwt")))?;

        let mut output = PipelineStepOutput::new();
        output.add_input(fasta, "Reference FASTA");
        output.add_output(&index_dir, INDEX_ROLE);
        output.add_deferred_delete_intermediate_file(&index_dir);
        self.cmd.record_commands(&mut output);
        Ok(StepResult::new(output, Some(index_dir)))
    }
}
