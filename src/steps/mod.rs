use std::path::Path;

use crate::error::Result;
use crate::pipeline::ProviderRegistry;

pub mod bwa;
pub mod gatk;
pub mod samtools;
pub mod trinity;

pub fn register_defaults(registry: &mut ProviderRegistry) -> Result<()> {
    registry.register(trinity::provider())?;
    registry.register(bwa::index_provider())?;
    registry.register(samtools::sort_provider())?;
    registry.register(samtools::flagstat_provider())?;
    registry.register(gatk::select_variants_provider())?;
    Ok(())
}

/// File name without `.gz` and without its last remaining extension.
pub(crate) fn unzipped_base_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    match name.rsplit_once('.') {
        Some((base, _)) if !base.is_empty() => base.to_string(),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepType;

    #[test]
    fn defaults_register_one_provider_per_capability() {
        let mut registry = ProviderRegistry::new();
        register_defaults(&mut registry).unwrap();
        for step_type in StepType::ALL {
            assert_eq!(registry.providers_of(step_type).count(), 1, "{step_type}");
        }
        assert!(register_defaults(&mut registry).is_err());
    }

    #[test]
    fn base_name_drops_compression_and_extension() {
        assert_eq!(unzipped_base_name(Path::new("/x/calls.vcf.gz")), "calls");
        assert_eq!(unzipped_base_name(Path::new("sample.bam")), "sample");
        assert_eq!(unzipped_base_name(Path::new("README")), "README");
    }
}
