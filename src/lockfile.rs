use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::executor::{PlannedStep, plan_steps};
use crate::pipeline::ProviderRegistry;
use crate::recipe::Recipe;

#[derive(Debug, Serialize)]
pub struct JobLock {
    pub job_version: u32,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub inputs: Vec<String>,
    pub work_dir: String,
    pub params_hash: String,
    pub steps: Vec<StepLock>,
}

#[derive(Debug, Serialize)]
pub struct StepLock {
    pub step: String,
    pub tool: Option<String>,
    pub args_hash: String,
}

pub fn build_lock(recipe: &Recipe, registry: &ProviderRegistry) -> Result<JobLock> {
    let job = recipe.to_job(Vec::new())?;
    let mut steps = Vec::with_capacity(recipe.steps.len());
    for planned in plan_steps(registry, &recipe.steps)? {
        let args = planned
            .provider
            .client_command_args(&job, planned.step_idx, None)
            .with_context(|| format!("Failed to render arguments for {}", planned.label()))?;
        steps.push(StepLock {
            step: planned.label(),
            tool: planned.provider.tool_name().map(str::to_string),
            args_hash: hash_args(&planned, &args),
        });
    }

    Ok(JobLock {
        job_version: recipe.version,
        name: recipe.name.clone(),
        generated_at: Utc::now(),
        inputs: recipe.inputs.iter().map(|i| i.path.clone()).collect(),
        work_dir: recipe.work_dir.to_string_lossy().to_string(),
        params_hash: hash_params(recipe),
        steps,
    })
}

pub fn generate_lock(recipe: &Recipe, registry: &ProviderRegistry, path: &Path) -> Result<()> {
    let lock = build_lock(recipe, registry)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(())
}

fn hash_args(planned: &PlannedStep, args: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(planned.label().as_bytes());
    for arg in args {
        hasher.update([0u8]);
        hasher.update(arg.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn hash_params(recipe: &Recipe) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in recipe.job_parameters() {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}
