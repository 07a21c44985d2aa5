//! File bookkeeping for a single step invocation.
//!
//! Outputs are ordered `(file, role)` pairs. Intermediate files are
//! stage-scoped and may be deleted once the stage finishes; deferred-delete
//! files must survive until the whole job completes. A file may be both an
//! output and an intermediate, while deferred-delete registration is never
//! implied by either. This module only classifies files; deleting them is
//! the orchestrator's job.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFile {
    pub file: PathBuf,
    pub role: String,
}

/// A file that should be recorded as a sequence output of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceOutput {
    pub file: PathBuf,
    pub label: String,
    pub category: String,
    pub readset_id: Option<i64>,
    pub genome_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStepOutput {
    inputs: Vec<StepFile>,
    outputs: Vec<StepFile>,
    intermediate_files: BTreeSet<PathBuf>,
    deferred_delete_files: BTreeSet<PathBuf>,
    sequence_outputs: Vec<SequenceOutput>,
    commands_executed: Vec<String>,
}

impl PipelineStepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, file: impl Into<PathBuf>, role: impl Into<String>) {
        self.inputs.push(StepFile {
            file: file.into(),
            role: role.into(),
        });
    }

    pub fn add_output(&mut self, file: impl Into<PathBuf>, role: impl Into<String>) {
        self.outputs.push(StepFile {
            file: file.into(),
            role: role.into(),
        });
    }

    /// Registers `file` as stage-scoped. With a role it is also tracked as an output.
    pub fn add_intermediate_file(&mut self, file: impl Into<PathBuf>, role: Option<&str>) {
        let file = file.into();
        if let Some(role) = role {
            self.add_output(file.clone(), role);
        }
        self.intermediate_files.insert(file);
    }

    pub fn add_intermediate_files<I, P>(&mut self, files: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for file in files {
            self.add_intermediate_file(file, None);
        }
    }

    /// Registers `file` for deletion only once the entire job completes.
    pub fn add_deferred_delete_intermediate_file(&mut self, file: impl Into<PathBuf>) {
        self.deferred_delete_files.insert(file.into());
    }

    /// Withdraws `files` from both deletion sets. Outputs are untouched.
    pub fn retain_files<'a, I>(&mut self, files: I)
    where
        I: IntoIterator<Item = &'a Path>,
    {
        for file in files {
            self.intermediate_files.remove(file);
            self.deferred_delete_files.remove(file);
        }
    }

    pub fn add_sequence_output(
        &mut self,
        file: impl Into<PathBuf>,
        label: impl Into<String>,
        category: impl Into<String>,
        readset_id: Option<i64>,
        genome_id: Option<i64>,
    ) {
        self.sequence_outputs.push(SequenceOutput {
            file: file.into(),
            label: label.into(),
            category: category.into(),
            readset_id,
            genome_id,
        });
    }

    pub fn add_commands_executed<I, S>(&mut self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands_executed
            .extend(commands.into_iter().map(Into::into));
    }

    pub fn inputs(&self) -> &[StepFile] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[StepFile] {
        &self.outputs
    }

    pub fn outputs_of_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a Path> + 'a {
        self.outputs
            .iter()
            .filter(move |entry| entry.role == role)
            .map(|entry| entry.file.as_path())
    }

    pub fn intermediate_files(&self) -> &BTreeSet<PathBuf> {
        &self.intermediate_files
    }

    pub fn deferred_delete_intermediate_files(&self) -> &BTreeSet<PathBuf> {
        &self.deferred_delete_files
    }

    pub fn sequence_outputs(&self) -> &[SequenceOutput] {
        &self.sequence_outputs
    }

    pub fn commands_executed(&self) -> &[String] {
        &self.commands_executed
    }

    /// Folds another step's bookkeeping into this one, keeping output order.
    pub fn merge(&mut self, other: PipelineStepOutput) {
        self.inputs.extend(other.inputs);
        self.outputs.extend(other.outputs);
        self.intermediate_files.extend(other.intermediate_files);
        self.deferred_delete_files
            .extend(other.deferred_delete_files);
        self.sequence_outputs.extend(other.sequence_outputs);
        self.commands_executed.extend(other.commands_executed);
    }
}
