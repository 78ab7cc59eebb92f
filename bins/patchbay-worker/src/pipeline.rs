/// Evaluation pipeline - one instance at a time, strictly sequential
///
/// Per instance:
/// 1. Resolve the BuildSpec (invalid instances are skipped, no summary entry)
/// 2. Prepare the log directory and `run_repo.log`
/// 3. Acquire a container lease (build failures stop here)
/// 4. Apply patch → snapshot diff → copy eval script → bounded run →
///    write test output → collect report → snapshot diff again
/// 5. Release the lease exactly once, whatever happened in step 4
/// 6. Classify, write `outcome.json`, record the summary entry
///
/// A panic inside step 4 is caught and treated as an unexpected error so
/// that teardown and reporting still run.

use crate::artifacts::{collect_report, read_report};
use crate::builder::ImageBuilder;
use crate::config::HarnessConfig;
use crate::engine::{ContainerRuntime, ExecRequest};
use crate::error::{EvaluationFailure, HarnessError};
use crate::executor::BoundedExecutor;
use crate::instance_log::InstanceLog;
use crate::lifecycle::{ContainerLease, LifecycleManager};
use crate::patch::{apply_patch, PatchPaths};
use crate::reporter::{
    classify, link_build_dir, prepare_log_dir, write_test_output, EvaluationTrace, InstanceReport,
    OutcomeLedger, Stage, EVAL_SCRIPT_FILE, LOG_FILE, PATCH_FILE, REPORT_FILE,
};
use anyhow::{anyhow, Context};
use futures_util::FutureExt;
use patchbay_common::spec::{make_spec, render_eval_template, BuildSpec, SpecError};
use patchbay_common::types::{Instance, OutcomeKind};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub struct Pipeline {
    lifecycle: LifecycleManager,
    config: HarnessConfig,
}

impl Pipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<dyn ImageBuilder>,
        config: HarnessConfig,
    ) -> Self {
        let lifecycle = LifecycleManager::new(runtime, builder, config.workdir.clone());
        Self { lifecycle, config }
    }

    /// Evaluate every instance in order. `shutdown` is checked between
    /// instances; the one in flight always runs to completion.
    pub async fn run_batch(&self, instances: &[Instance], shutdown: &AtomicBool) -> OutcomeLedger {
        let mut ledger = OutcomeLedger::new();
        let total = instances.len();

        for (idx, instance) in instances.iter().enumerate() {
            if shutdown.load(Ordering::SeqCst) {
                warn!(remaining = total - idx, "Shutdown requested, skipping remaining instances");
                break;
            }

            info!(instance = idx + 1, total = total, repo = %instance.repo, "Evaluating instance");

            match self.evaluate_instance(instance).await {
                Ok((spec, outcome)) => {
                    info!(repo = %spec.repo_name, outcome = %outcome, "Instance finished");
                    ledger.record(instance, &spec, outcome);
                }
                Err(e) => {
                    error!(repo = %instance.repo, error = %e, "Skipping invalid instance");
                }
            }
        }

        ledger
    }

    /// Run one instance end to end. Only an unresolvable instance is an error;
    /// every other failure is folded into the returned outcome.
    #[instrument(skip(self, instance), fields(repo = %instance.repo))]
    pub async fn evaluate_instance(&self, instance: &Instance) -> Result<(BuildSpec, OutcomeKind), SpecError> {
        let spec = make_spec(instance)?;

        let prepared = prepare_log_dir(&self.config.log_root, &spec.repo_name).and_then(|dir| {
            let log = InstanceLog::create(&spec.repo_name, &dir.join(LOG_FILE))?;
            Ok((dir, log))
        });

        let outcome = match prepared {
            Ok((log_dir, log)) => self.evaluate_with_log(instance, &spec, &log_dir, &log).await,
            Err(e) => {
                error!(repo = %spec.repo_name, error = ?e, "Failed to prepare log directory");
                OutcomeKind::UnexpectedError
            }
        };

        Ok((spec, outcome))
    }

    async fn evaluate_with_log(
        &self,
        instance: &Instance,
        spec: &BuildSpec,
        log_dir: &Path,
        log: &InstanceLog,
    ) -> OutcomeKind {
        let mut trace = EvaluationTrace::default();

        trace.enter(Stage::Build);
        let build_dir = self.config.image_build_root.join(spec.build_dir_name());
        link_build_dir(log_dir, &build_dir, log);

        let result = match self.lifecycle.acquire(spec, log).await {
            Ok(lease) => {
                let staged = AssertUnwindSafe(self.run_stages(instance, spec, &lease, log_dir, log, &mut trace))
                    .catch_unwind()
                    .await;
                let result = staged.unwrap_or_else(|panic| {
                    Err(HarnessError::Unexpected(anyhow!(
                        "evaluation panicked during {:?}: {}",
                        trace.stage,
                        panic_message(&*panic)
                    )))
                });
                lease.release(log).await;
                result
            }
            Err(e) => Err(HarnessError::from(e)),
        };

        match &result {
            Err(HarnessError::Build(e)) => log.error(format!(
                "Error building image {}: {}\nCheck ({}) for more information.",
                e.image_key,
                e.message,
                build_dir.display()
            )),
            Err(e @ HarnessError::Unexpected(_)) => log.error(format!(
                "Error in evaluating {}: {}\nCheck ({}) for more information.",
                spec.repo_name,
                e.detailed(),
                log.path().display()
            )),
            _ => {}
        }

        let outcome = classify(&result, &trace);
        let report = trace.artifact.as_ref().and_then(|status| read_report(status, log));
        let error = result.err().map(|e| e.detailed());

        match InstanceReport::new(spec, outcome, trace, report, error).write(log_dir) {
            Ok(path) => log.info(format!("Outcome {} written to {}", outcome, path.display())),
            Err(e) => log.warn(format!("Failed to write instance report: {:#}", e)),
        }

        outcome
    }

    async fn run_stages(
        &self,
        instance: &Instance,
        spec: &BuildSpec,
        lease: &ContainerLease,
        log_dir: &Path,
        log: &InstanceLog,
        trace: &mut EvaluationTrace,
    ) -> Result<(), HarnessError> {
        let runtime = lease.runtime();
        let container_id = lease.id();
        let workdir = self.config.workdir.as_str();

        trace.enter(Stage::ApplyPatch);
        let host_patch = log_dir.join(PATCH_FILE);
        let paths = PatchPaths {
            host: &host_patch,
            container: &self.config.container_patch_path,
            workdir,
        };
        let applied = apply_patch(runtime, container_id, &spec.repo_name, instance.patch_text(), &paths, log).await?;
        trace.patch = Some(applied);

        let diff_before = git_diff(runtime, container_id, workdir).await?;
        log.info(format!("Git diff before:\n{}", diff_before));
        trace.diff_before = Some(diff_before);

        trace.enter(Stage::Execute);
        let host_eval = log_dir.join(EVAL_SCRIPT_FILE);
        tokio::fs::write(&host_eval, self.eval_script(instance, spec))
            .await
            .with_context(|| format!("Failed to write {}", host_eval.display()))?;
        log.info(format!(
            "Eval script for {} written to {}; copying to container...",
            spec.repo_name,
            host_eval.display()
        ));
        runtime
            .copy_in(container_id, &host_eval, &self.config.container_eval_script_path)
            .await
            .context("Failed to copy eval script into container")?;

        let executor = BoundedExecutor::new(runtime, self.config.kill_grace());
        let command = format!("/bin/bash {}", self.config.container_eval_script_path);
        let execution = executor
            .run(container_id, &command, workdir, self.config.timeout())
            .await
            .context("Failed to run eval script")?;
        log.info(format!("Test runtime: {:.2} seconds", execution.elapsed_ms as f64 / 1000.0));

        let output_path = write_test_output(log_dir, &execution, self.config.timeout_secs)?;
        log.info(format!("Test output for {} written to {}", spec.repo_name, output_path.display()));
        let timed_out = execution.timed_out;
        trace.execution = Some(execution);

        trace.enter(Stage::Collect);
        let artifact = collect_report(
            runtime,
            container_id,
            &self.config.container_report_path,
            &log_dir.join(REPORT_FILE),
            log,
        )
        .await?;
        trace.artifact = Some(artifact);

        if timed_out {
            let message = format!("Test timed out after {} seconds.", self.config.timeout_secs);
            log.error(format!("{}: {}", EvaluationFailure::Timeout, message));
            return Err(HarnessError::evaluation(&spec.repo_name, EvaluationFailure::Timeout, message));
        }

        trace.enter(Stage::Report);
        let diff_after = git_diff(runtime, container_id, workdir).await?;
        if trace.diff_before.as_deref() != Some(diff_after.as_str()) {
            log.warn("Git diff changed after running eval script");
        }
        log.info(format!("Git diff after:\n{}", diff_after));
        trace.diff_after = Some(diff_after);

        Ok(())
    }

    fn eval_script(&self, instance: &Instance, spec: &BuildSpec) -> String {
        let test_cmd = instance.test.test_cmd.trim();
        let tests = instance.test.test_dir.trim();

        match &self.config.eval_script_template {
            Some(template) => render_eval_template(template, test_cmd, tests),
            None => spec.render_eval_script(test_cmd, tests),
        }
    }
}

/// Working-tree diff against HEAD, trimmed
async fn git_diff(runtime: &dyn ContainerRuntime, container_id: &str, workdir: &str) -> anyhow::Result<String> {
    let request = ExecRequest::new(["git", "-c", "core.fileMode=false", "diff"]).working_dir(workdir);
    let result = runtime
        .exec(container_id, &request)
        .await
        .context("Failed to snapshot git diff")?;
    Ok(result.output.trim().to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
