use serde_json::{Value, json};

use super::unzipped_base_name;
use crate::error::{PipelineJobError, Result};
use crate::output::PipelineStepOutput;
use crate::params::{CommandLineParam, ToolParameterDescriptor};
use crate::pipeline::{
    CommandStep, PipelineStep, PipelineStepProvider, StepResult, StepType, VariantProcessingStep,
    VcfInput,
};

pub const VCF_ROLE: &str = "VCF File";
pub const VCF_INDEX_ROLE: &str = "VCF Index";

const SELECT_TYPE_TO_INCLUDE: &str = "selectType";
const SELECT_TYPE_TO_EXCLUDE: &str = "selectTypeToExclude";
const SAMPLE_INCLUDE: &str = "sampleIncludes";
const SAMPLE_EXCLUDE: &str = "sampleExcludes";
const SELECTS: &str = "selects";

fn switch(arg: &str, name: &str, label: &str, description: &str) -> ToolParameterDescriptor {
    ToolParameterDescriptor::create_command_line_param(
        CommandLineParam::create_switch(arg),
        name,
        label,
        description,
        "checkbox",
        None,
        None,
    )
}

pub fn select_variants_provider() -> PipelineStepProvider {
    let variant_types = json!({
        "storeValues": "INDEL;SNP;MIXED;MNP;SYMBOLIC;NO_VARIATION",
        "multiSelect": true,
        "delimiter": ";",
    });
    PipelineStepProvider::new(
        StepType::VariantProcessing,
        "SelectVariants",
        "Select Variants",
        "Filter a VCF using GATK SelectVariants.",
        vec![
            ToolParameterDescriptor::create(
                SELECTS,
                "Select Expressions",
                "Filter expressions that can be used to subset variants.",
                "sequenceanalysis-variantfilterpanel",
                None,
                None,
            ),
            switch(
                "--exclude-filtered",
                "excludeFiltered",
                "Exclude Filtered",
                "If selected, any filtered sites will be removed",
            ),
            switch(
                "--exclude-non-variants",
                "excludeNonVariant",
                "Exclude Non-Variant",
                "If selected, any non-variant sites will be removed",
            ),
            switch(
                "--preserve-alleles",
                "noTrim",
                "Preserve Original Alleles",
                "If selected, all alleles from the input will be retained, even if not used by any remaining genotypes.",
            ),
            switch(
                "--remove-unused-alternates",
                "trimAlternates",
                "Remove Unused Alternates",
                "If selected, any alternate alleles not used in any genotypes will be trimmed.",
            ),
            switch(
                "--sites-only-vcf-output",
                "sitesOnly",
                "Sites Only VCF Output",
                "If selected, the resulting VCF will omit samples and include only the site information.",
            ),
            ToolParameterDescriptor::create(
                SELECT_TYPE_TO_INCLUDE,
                "Select Type(s) To Include",
                "Only variants of the selected type(s) will be included",
                "ldk-simplecombo",
                Some(variant_types.clone()),
                None,
            ),
            ToolParameterDescriptor::create(
                SELECT_TYPE_TO_EXCLUDE,
                "Select Type(s) To Exclude",
                "Variants of the selected type(s) will be excluded",
                "ldk-simplecombo",
                Some(variant_types),
                None,
            ),
            ToolParameterDescriptor::create(
                SAMPLE_INCLUDE,
                "Select Sample(s) Include",
                "Only genotypes of these samples will be retained",
                "sequenceanalysis-trimmingtextarea",
                None,
                None,
            ),
            ToolParameterDescriptor::create(
                SAMPLE_EXCLUDE,
                "Select Sample(s) To Exclude",
                "Genotypes of these samples will be removed",
                "sequenceanalysis-trimmingtextarea",
                None,
                None,
            ),
        ],
        |binding| {
            let mut cmd = CommandStep::new(binding);
            cmd.wrapper_mut().set_throw_non_zero_exits(true);
            Ok(PipelineStep::VariantProcessing(Box::new(SelectVariantsStep { cmd })))
        },
    )
    .with_tool_name("GATK")
    .with_website("https://gatk.broadinstitute.org/")
}

/// Adds `arg value` for each entry of a JSON array or `;`-separated list.
fn add_list_options(
    key: &str,
    text: Option<String>,
    arg: &str,
    options: &mut Vec<String>,
) -> Result<()> {
    let Some(text) = text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) else {
        return Ok(());
    };
    let values: Vec<String> = if text.starts_with('[') {
        let parsed: Vec<Value> = serde_json::from_str(&text)
            .map_err(|err| PipelineJobError::invalid_parameter(key, &text, err.to_string()))?;
        parsed
            .into_iter()
            .filter(|value| !value.is_null())
            .map(|value| match value {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect()
    } else {
        text.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };
    for value in values {
        options.push(arg.to_string());
        options.push(value);
    }
    Ok(())
}

/// Select expressions arrive as `[[label, expression], ...]`.
fn add_select_expressions(text: Option<String>, options: &mut Vec<String>) -> Result<()> {
    let Some(text) = text else {
        return Ok(());
    };
    let parsed: Vec<Vec<String>> = serde_json::from_str(&text)
        .map_err(|err| PipelineJobError::invalid_parameter(SELECTS, &text, err.to_string()))?;
    for entry in parsed {
        let Some(expression) = entry.get(1) else {
            return Err(PipelineJobError::invalid_parameter(
                SELECTS,
                entry.join(","),
                "improper select expression",
            ));
        };
        options.push("-select".to_string());
        options.push(expression.clone());
    }
    Ok(())
}

struct SelectVariantsStep {
    cmd: CommandStep,
}

impl SelectVariantsStep {
    fn options(&self) -> Result<Vec<String>> {
        let mut options = Vec::new();
        add_list_options(
            SELECT_TYPE_TO_INCLUDE,
            self.cmd.param(SELECT_TYPE_TO_INCLUDE)?,
            "--select-type-to-include",
            &mut options,
        )?;
        add_list_options(
            SELECT_TYPE_TO_EXCLUDE,
            self.cmd.param(SELECT_TYPE_TO_EXCLUDE)?,
            "--select-type-to-exclude",
            &mut options,
        )?;
        add_list_options(SAMPLE_INCLUDE, self.cmd.param(SAMPLE_INCLUDE)?, "-sn", &mut options)?;
        add_list_options(SAMPLE_EXCLUDE, self.cmd.param(SAMPLE_EXCLUDE)?, "-xl-sn", &mut options)?;
        add_select_expressions(self.cmd.param(SELECTS)?, &mut options)?;
        options.extend(self.cmd.client_command_args(None)?);
        Ok(options)
    }
}

impl VariantProcessingStep for SelectVariantsStep {
    fn process_variants(&self, input: &VcfInput<'_>) -> Result<StepResult> {
        let output_vcf = input.output_dir.join(format!(
            "{}.selectVariants.vcf.gz",
            unzipped_base_name(input.vcf)
        ));

        let mut args = vec![
            self.cmd.executable("gatk", Some("GATK")).display().to_string(),
            "SelectVariants".to_string(),
            "-R".to_string(),
            input.genome.working_fasta_file().display().to_string(),
            "-V".to_string(),
            input.vcf.display().to_string(),
            "-O".to_string(),
            output_vcf.display().to_string(),
        ];
        args.extend(self.options()?);
        self.cmd.wrapper().execute_with_output(&args)?;

        self.cmd.require_output(&output_vcf)?;

        let mut output = PipelineStepOutput::new();
        output.add_input(input.vcf, "Input VCF");
        output.add_output(&output_vcf, VCF_ROLE);
        let mut index = output_vcf.clone().into_os_string();
        index.push(".tbi");
        let index = std::path::PathBuf::from(index);
        if index.exists() {
            output.add_output(index, VCF_INDEX_ROLE);
        }
        self.cmd.record_commands(&mut output);
        Ok(StepResult::new(output, Some(output_vcf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_options_accept_json_or_semicolons() {
        let mut options = Vec::new();
        add_list_options("k", Some("SNP;INDEL".into()), "--select-type-to-include", &mut options)
            .unwrap();
        add_list_options("k", Some(r#"["s1", null, "s2"]"#.into()), "-sn", &mut options).unwrap();
        add_list_options("k", Some("   ".into()), "-xl-sn", &mut options).unwrap();
        assert_eq!(
            options,
            vec![
                "--select-type-to-include", "SNP", "--select-type-to-include", "INDEL", "-sn",
                "s1", "-sn", "s2",
            ]
        );
    }

    #[test]
    fn select_expressions_need_two_entries() {
        let mut options = Vec::new();
        add_select_expressions(Some(r#"[["qual", "QUAL > 30"]]"#.into()), &mut options).unwrap();
        assert_eq!(options, vec!["-select", "QUAL > 30"]);
        assert!(add_select_expressions(Some(r#"[["only"]]"#.into()), &mut options).is_err());
    }
}
