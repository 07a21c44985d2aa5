use serde::Serialize;

use crate::params::{ToolParameterDescriptor, convert};
use crate::pipeline::{PipelineStepProvider, ProviderRegistry, StepType};
use crate::recipe::{Recipe, yaml_to_param};

/// Keys outside the step namespaces that jobs may legitimately carry.
const PASSTHROUGH_PREFIXES: [&str; 1] = ["resourceSettings."];

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe, registry: &ProviderRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported job version: {}", recipe.version));
    }

    if recipe.name.trim().is_empty() {
        report.errors.push("Job name cannot be empty".into());
    }

    for (idx, input) in recipe.inputs.iter().enumerate() {
        if input.path.trim().is_empty() {
            report
                .errors
                .push("Input path patterns cannot be empty".into());
        } else if let Err(err) = glob::Pattern::new(&input.path) {
            report.errors.push(format!(
                "Input pattern {} ('{}') is not a valid glob: {}",
                idx + 1,
                input.path,
                err
            ));
        }
    }

    if recipe.steps.is_empty() {
        report
            .errors
            .push("Job must contain at least one step".into());
    }

    if let Err(err) = recipe.task() {
        report.errors.push(format!("{err:#}"));
    }

    for (idx, spec) in recipe.steps.iter().enumerate() {
        match registry.get(spec.step_type, &spec.provider) {
            Ok(provider) => report.merge(validate_step_order(idx, provider, recipe)),
            Err(err) => report
                .errors
                .push(format!("Step {} ({}): {}", idx + 1, spec.step_type, err)),
        }
    }

    for (key, value) in &recipe.params {
        report.merge(validate_param(key, &yaml_to_param(value), registry));
    }

    report
}

fn validate_step_order(
    idx: usize,
    provider: &PipelineStepProvider,
    recipe: &Recipe,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (step_type, name) in provider.prerequisites() {
        let satisfied = recipe.steps[..idx]
            .iter()
            .any(|prev| prev.step_type == *step_type && &prev.provider == name);
        if !satisfied {
            report.errors.push(format!(
                "Step {} ('{}') requires {}.{} earlier in the job",
                idx + 1,
                provider.name(),
                step_type,
                name
            ));
        }
    }
    report
}

fn validate_param(key: &str, value: &str, registry: &ProviderRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    if PASSTHROUGH_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
        return report;
    }

    let mut parts = key.splitn(3, '.');
    let (Some(step_type), Some(provider), Some(rest)) = (parts.next(), parts.next(), parts.next())
    else {
        report
            .warnings
            .push(format!("Parameter '{key}' is not of the form <StepType>.<Provider>.<name>"));
        return report;
    };
    let Ok(step_type) = step_type.parse::<StepType>() else {
        report
            .warnings
            .push(format!("Parameter '{key}' names an unknown step type"));
        return report;
    };
    let Some(provider) = registry.find(step_type, provider) else {
        report
            .warnings
            .push(format!("Parameter '{key}' names an unknown provider"));
        return report;
    };
    let name = strip_step_index(rest);
    let Some(descriptor) = provider.get_parameter_by_name(name) else {
        report.warnings.push(format!(
            "Parameter '{key}' is not declared by {}.{}",
            step_type,
            provider.name()
        ));
        return report;
    };

    if let Err(err) = check_value(descriptor, key, value) {
        report.errors.push(err.to_string());
    }
    report
}

/// `name.2` -> `name`; names without a numeric suffix are returned unchanged.
fn strip_step_index(rest: &str) -> &str {
    match rest.rsplit_once('.') {
        Some((name, idx)) if idx.chars().all(|c| c.is_ascii_digit()) && !idx.is_empty() => name,
        _ => rest,
    }
}

fn check_value(
    descriptor: &ToolParameterDescriptor,
    key: &str,
    value: &str,
) -> crate::error::Result<()> {
    if value.trim().is_empty() {
        return Ok(());
    }
    let xtype = descriptor.field_xtype();
    if xtype.contains("integerfield") {
        convert::<i64>(key, value)?;
    } else if xtype.contains("numberfield") {
        convert::<f64>(key, value)?;
    } else if xtype == "checkbox" {
        convert::<bool>(key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::register_defaults;

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        register_defaults(&mut registry).unwrap();
        registry
    }

    #[test]
    fn valid_job_passes() {
        let recipe: Recipe = serde_yaml::from_str(
            r#"
version: 1
name: sort-and-stat
params:
  BamPostProcessing.SamtoolsSort.compressionLevel: 6
  BamPostProcessing.SamtoolsSort.sortByName.1: false
steps:
  - { step_type: BamPostProcessing, provider: SamtoolsSort }
  - { step_type: Analysis, provider: SamtoolsFlagstat }
"#,
        )
        .unwrap();
        let report = validate_recipe(&recipe, &registry());
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn bad_values_and_unknown_keys_are_reported() {
        let recipe: Recipe = serde_yaml::from_str(
            r#"
version: 2
name: broken
params:
  Assembly.TrinityAssembly.min_contig_length: lots
  Assembly.TrinityAssembly.unknown: 1
  stray: x
steps:
  - { step_type: Analysis, provider: Missing }
"#,
        )
        .unwrap();
        let report = validate_recipe(&recipe, &registry());
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert!(report.errors.iter().any(|e| e.contains("Unsupported job version")));
        assert!(report.errors.iter().any(|e| e.contains("min_contig_length")));
        assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
    }

    #[test]
    fn step_index_suffix_is_ignored_for_lookup() {
        assert_eq!(strip_step_index("minLength.2"), "minLength");
        assert_eq!(strip_step_index("minLength"), "minLength");
        assert_eq!(strip_step_index("a.b"), "a.b");
    }
}
