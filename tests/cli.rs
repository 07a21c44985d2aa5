use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::tempdir;

fn seqpipe() -> Command {
    Command::cargo_bin("seqpipe").expect("binary present")
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("utf8 stdout")
}

fn write_job(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("job.yaml");
    fs::write(&path, body).unwrap();
    path
}

const ASSEMBLY_JOB: &str = r#"
version: 1
name: assemble
params:
  Assembly.TrinityAssembly.min_contig_length: 150
  resourceSettings.resourceSettings.ram: 24
steps:
  - { step_type: Assembly, provider: TrinityAssembly }
"#;

#[test]
fn list_steps_groups_providers_by_type() {
    let stdout = stdout_of(seqpipe().arg("list-steps"));
    assert!(stdout.contains("Assembly:\n- TrinityAssembly (Trinity)"), "{stdout}");
    assert!(stdout.contains("BamPostProcessing:\n- SamtoolsSort (samtools)"), "{stdout}");
    assert!(stdout.contains("VariantProcessing:\n- SelectVariants"), "{stdout}");
}

#[test]
fn describe_prints_provider_json() {
    let stdout = stdout_of(seqpipe().args(["describe", "assembly", "TrinityAssembly"]));
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["name"], "TrinityAssembly");
    assert_eq!(json["parameters"][0]["name"], "min_contig_length");
    assert_eq!(json["parameters"][0]["commandLineParam"], "--min_contig_length");
}

#[test]
fn describe_unknown_provider_fails() {
    seqpipe()
        .args(["describe", "Assembly", "Velvet"])
        .assert()
        .failure();
}

#[test]
fn args_renders_job_parameters() {
    let dir = tempdir().unwrap();
    let job = write_job(dir.path(), ASSEMBLY_JOB);

    let stdout = stdout_of(seqpipe().arg("args").arg(&job).args(["Assembly", "TrinityAssembly"]));
    assert_eq!(stdout.trim(), "--min_contig_length 150");

    let stdout = stdout_of(
        seqpipe()
            .arg("args")
            .arg(&job)
            .args(["Assembly", "TrinityAssembly", "--separator", "="]),
    );
    assert_eq!(stdout.trim(), "--min_contig_length=150");
}

#[test]
fn validate_accepts_good_jobs_and_rejects_bad_ones() {
    let dir = tempdir().unwrap();
    let good = write_job(dir.path(), ASSEMBLY_JOB);
    let stdout = stdout_of(seqpipe().arg("validate").arg(&good));
    assert!(stdout.contains("ok"), "{stdout}");

    let bad = dir.path().join("bad.yaml");
    fs::write(
        &bad,
        r#"
version: 1
name: bad
params:
  Assembly.TrinityAssembly.min_contig_length: lots
steps:
  - { step_type: Assembly, provider: TrinityAssembly }
"#,
    )
    .unwrap();
    seqpipe().arg("validate").arg(&bad).assert().failure();
}

#[test]
fn lock_writes_step_hashes() {
    let dir = tempdir().unwrap();
    let job = write_job(dir.path(), ASSEMBLY_JOB);
    let lock = dir.path().join("locks").join("job.lock");

    seqpipe().arg("lock").arg(&job).arg(&lock).assert().success();

    let content = fs::read_to_string(&lock).unwrap();
    assert!(content.contains("step: Assembly.TrinityAssembly"), "{content}");
    assert!(content.contains("args_hash:"), "{content}");
}

#[test]
fn submit_script_uses_the_sequence_allocator() {
    let dir = tempdir().unwrap();
    let job = write_job(dir.path(), ASSEMBLY_JOB);
    let engine = dir.path().join("engine.yaml");
    fs::write(
        &engine,
        "type: slurm\nrequest_cpus: 4\nrequest_memory: 8\njob_args: [run, job.yaml]\n",
    )
    .unwrap();

    let stdout = stdout_of(
        seqpipe()
            .arg("submit-script")
            .arg(&job)
            .arg("--engine")
            .arg(&engine)
            .args(["--task", "sequenceanalysis.pipeline.SequenceAlignmentTask"]),
    );
    assert!(stdout.starts_with("#!/bin/bash"), "{stdout}");
    assert!(stdout.contains("#SBATCH --cpus-per-task=4\n"), "{stdout}");
    assert!(stdout.contains("#SBATCH --mem=26000\n"), "{stdout}");
    assert!(stdout.contains("SEQUENCEANALYSIS_MAX_RAM=24"), "{stdout}");
    assert!(stdout.trim_end().ends_with("srun seqpipe run job.yaml"), "{stdout}");
}

#[test]
fn completions_are_generated() {
    let stdout = stdout_of(seqpipe().args(["completions", "bash"]));
    assert!(stdout.contains("seqpipe"));
}
