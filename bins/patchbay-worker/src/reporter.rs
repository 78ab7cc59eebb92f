/// Outcome Reporter - classification and persistence of evaluation results
///
/// **Core Responsibility:**
/// Turn what happened to one instance into exactly one OutcomeKind, write
/// the per-instance files, and accumulate the batch summary.
///
/// **Classification Rules (first match wins):**
/// - Build error            → build_failure
/// - Patch apply error      → apply_failure
/// - Deadline exceeded      → timeout
/// - Any other error        → unexpected_error
/// - Report collected, eval script exited 0 → success
/// - Otherwise              → test_failure (includes a missing report)
///
/// A working-tree diff that changes during the test run is reported as a
/// warning only.

use crate::artifacts::ArtifactStatus;
use crate::error::HarnessError;
use crate::instance_log::InstanceLog;
use crate::patch::{ApplyStrategy, PatchApplication};
use anyhow::{Context, Result};
use patchbay_common::spec::BuildSpec;
use patchbay_common::types::{ExecutionResult, Instance, OutcomeKind, SummaryEntry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const PATCH_FILE: &str = "patch.diff";
pub const EVAL_SCRIPT_FILE: &str = "eval.sh";
pub const TEST_OUTPUT_FILE: &str = "test_output.txt";
pub const REPORT_FILE: &str = "report.json";
pub const OUTCOME_FILE: &str = "outcome.json";
pub const LOG_FILE: &str = "run_repo.log";
pub const BUILD_DIR_LINK: &str = "image_build_dir";

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    Build,
    ApplyPatch,
    Execute,
    Collect,
    Report,
}

/// What the pipeline observed for one instance, filled in stage by stage
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationTrace {
    pub stage: Stage,
    pub patch: Option<PatchApplication>,
    pub diff_before: Option<String>,
    pub diff_after: Option<String>,
    pub execution: Option<ExecutionResult>,
    pub artifact: Option<ArtifactStatus>,
}

impl Default for EvaluationTrace {
    fn default() -> Self {
        Self {
            stage: Stage::Setup,
            patch: None,
            diff_before: None,
            diff_after: None,
            execution: None,
            artifact: None,
        }
    }
}

impl EvaluationTrace {
    pub fn enter(&mut self, stage: Stage) {
        self.stage = stage;
    }

    /// `Some(true)` when both snapshots were taken and they differ
    pub fn diff_changed(&self) -> Option<bool> {
        match (&self.diff_before, &self.diff_after) {
            (Some(before), Some(after)) => Some(before != after),
            _ => None,
        }
    }
}

/// Classify the terminal state of one instance
pub fn classify(result: &Result<(), HarnessError>, trace: &EvaluationTrace) -> OutcomeKind {
    match result {
        Err(e) => e.outcome().unwrap_or(OutcomeKind::UnexpectedError),
        Ok(()) => {
            let collected = trace.artifact.as_ref().is_some_and(ArtifactStatus::is_collected);
            let exited_cleanly = trace.execution.as_ref().is_some_and(ExecutionResult::succeeded);

            if collected && exited_cleanly {
                OutcomeKind::Success
            } else {
                OutcomeKind::TestFailure
            }
        }
    }
}

/// Structured per-instance report, written as `outcome.json`
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub repo: String,
    pub outcome: OutcomeKind,
    pub stage: Stage,
    pub image_key: String,
    pub container_name: String,
    pub patch_strategy: Option<ApplyStrategy>,
    pub execution: Option<ExecutionResult>,
    pub artifact: Option<ArtifactStatus>,
    pub diff_changed: Option<bool>,
    pub report: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl InstanceReport {
    pub fn new(
        spec: &BuildSpec,
        outcome: OutcomeKind,
        trace: EvaluationTrace,
        report: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Self {
        let diff_changed = trace.diff_changed();
        Self {
            repo: spec.repo.clone(),
            outcome,
            stage: trace.stage,
            image_key: spec.image_key.clone(),
            container_name: spec.container_name.clone(),
            patch_strategy: trace.patch.map(|p| p.strategy),
            execution: trace.execution,
            artifact: trace.artifact,
            diff_changed,
            report,
            error,
        }
    }

    pub fn write(&self, log_dir: &Path) -> Result<PathBuf> {
        let path = log_dir.join(OUTCOME_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize instance report")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Create the per-repository log directory (idempotent)
pub fn prepare_log_dir(log_root: &Path, repo_name: &str) -> Result<PathBuf> {
    let dir = log_root.join(repo_name);
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create log dir {}", dir.display()))?;
    Ok(dir)
}

/// Point `<log_dir>/image_build_dir` at the image's build directory.
///
/// Convenience for humans browsing logs only; failures are logged and ignored.
pub fn link_build_dir(log_dir: &Path, build_dir: &Path, log: &InstanceLog) {
    let link = log_dir.join(BUILD_DIR_LINK);
    if link.symlink_metadata().is_ok() {
        return;
    }

    let target = std::path::absolute(build_dir).unwrap_or_else(|_| build_dir.to_path_buf());

    #[cfg(unix)]
    let linked = std::os::unix::fs::symlink(&target, &link);
    #[cfg(not(unix))]
    let linked: std::io::Result<()> = Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are only created on unix",
    ));

    if let Err(e) = linked {
        log.warn(format!("Could not link build dir {}: {}", target.display(), e));
    }
}

/// Write captured test output, annotating a timeout the way readers of these logs expect
pub fn write_test_output(log_dir: &Path, execution: &ExecutionResult, timeout_secs: u64) -> Result<PathBuf> {
    let path = log_dir.join(TEST_OUTPUT_FILE);
    let mut contents = execution.output.clone();
    if execution.timed_out {
        contents.push_str(&format!("\n\nTimeout error: {} seconds exceeded.", timeout_secs));
    }
    fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Batch-wide accumulator of summary entries, keyed by repository name.
///
/// Owned by the batch driver and persisted once, after the last instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OutcomeLedger {
    entries: BTreeMap<String, SummaryEntry>,
}

impl OutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, instance: &Instance, spec: &BuildSpec, outcome: OutcomeKind) {
        self.entries.insert(
            spec.repo_name.clone(),
            SummaryEntry {
                docker_image: spec.image_key.clone(),
                docker_container: spec.container_name.clone(),
                test_cmd: instance.test.test_cmd.clone(),
                base_commit: spec.base_commit.clone(),
                outcome,
            },
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SummaryEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn count(&self, outcome: OutcomeKind) -> usize {
        self.entries.values().filter(|e| e.outcome == outcome).count()
    }

    /// Write the summary as YAML via a temp file + rename, so readers never see half a file
    pub fn persist(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize summary")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, yaml).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move summary into place at {}", path.display()))?;
        Ok(())
    }
}
