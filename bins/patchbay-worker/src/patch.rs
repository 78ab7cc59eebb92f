/// Patch Applicator
///
/// Applies a candidate patch to the container's working tree:
/// 1. `git apply --allow-empty -v` (strict, accepts empty patches)
/// 2. `patch --batch --fuzz=5 -p1` when the strict attempt fails
///
/// Which strategy succeeded is returned and logged, since a fuzzy apply is a
/// weaker signal about the patch than a clean one.

use crate::engine::{ContainerRuntime, ExecRequest};
use crate::error::{EvaluationFailure, HarnessError};
use crate::instance_log::InstanceLog;
use anyhow::Context;
use serde::Serialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStrategy {
    GitApply,
    FuzzyPatch,
}

impl ApplyStrategy {
    fn command(self, container_patch_path: &str) -> Vec<String> {
        let args: Vec<&str> = match self {
            ApplyStrategy::GitApply => vec!["git", "apply", "--allow-empty", "-v", container_patch_path],
            ApplyStrategy::FuzzyPatch => vec!["patch", "--batch", "--fuzz=5", "-p1", "-i", container_patch_path],
        };
        args.into_iter().map(String::from).collect()
    }
}

impl fmt::Display for ApplyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStrategy::GitApply => f.write_str("git apply"),
            ApplyStrategy::FuzzyPatch => f.write_str("patch --fuzz=5"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchApplication {
    pub strategy: ApplyStrategy,
    pub output: String,
}

/// Where the patch lives on both sides
pub struct PatchPaths<'a> {
    pub host: &'a Path,
    pub container: &'a str,
    pub workdir: &'a str,
}

pub async fn apply_patch(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    repo: &str,
    patch: &str,
    paths: &PatchPaths<'_>,
    log: &InstanceLog,
) -> Result<PatchApplication, HarnessError> {
    tokio::fs::write(paths.host, patch)
        .await
        .with_context(|| format!("Failed to write patch to {}", paths.host.display()))?;
    log.info(format!(
        "Intermediate patch for {} written to {}, now applying to container...",
        repo,
        paths.host.display()
    ));

    runtime
        .copy_in(container_id, paths.host, paths.container)
        .await
        .context("Failed to copy patch into container")?;

    let strict = run_strategy(runtime, container_id, ApplyStrategy::GitApply, paths).await?;
    if strict.exit_code == Some(0) {
        return Ok(applied(ApplyStrategy::GitApply, strict.output, log));
    }

    log.info(format!(
        "Failed to apply patch with {} (exit {:?}), trying {}...",
        ApplyStrategy::GitApply,
        strict.exit_code,
        ApplyStrategy::FuzzyPatch
    ));

    let fuzzy = run_strategy(runtime, container_id, ApplyStrategy::FuzzyPatch, paths).await?;
    if fuzzy.exit_code == Some(0) {
        return Ok(applied(ApplyStrategy::FuzzyPatch, fuzzy.output, log));
    }

    let message = format!(
        "{}:\n{}\n{}:\n{}",
        ApplyStrategy::GitApply,
        strict.output.trim_end(),
        ApplyStrategy::FuzzyPatch,
        fuzzy.output.trim_end()
    );
    log.error(format!("{}:\n{}", EvaluationFailure::ApplyPatch, message));

    Err(HarnessError::evaluation(repo, EvaluationFailure::ApplyPatch, message))
}

async fn run_strategy(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    strategy: ApplyStrategy,
    paths: &PatchPaths<'_>,
) -> Result<patchbay_common::types::ExecutionResult, HarnessError> {
    let request = ExecRequest::new(strategy.command(paths.container))
        .working_dir(paths.workdir)
        .user("root");

    let result = runtime
        .exec(container_id, &request)
        .await
        .with_context(|| format!("Failed to run {}", strategy))?;

    Ok(result)
}

fn applied(strategy: ApplyStrategy, output: String, log: &InstanceLog) -> PatchApplication {
    log.info(format!(">>>>> Applied Patch ({}):\n{}", strategy, output));
    PatchApplication { strategy, output }
}
