// Artifact Collector - pulls the test report out before teardown
use crate::engine::ContainerRuntime;
use crate::instance_log::InstanceLog;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Collected { path: PathBuf },
    /// The test command never produced the report (crash, timeout, ...)
    Missing,
}

impl ArtifactStatus {
    pub fn is_collected(&self) -> bool {
        matches!(self, ArtifactStatus::Collected { .. })
    }
}

/// Copy `container_path` to `host_path`, then delete it inside the container.
///
/// The in-container copy is removed even when it was missing, so a later
/// run reusing the container name never reads a stale report.
pub async fn collect_report(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    container_path: &str,
    host_path: &Path,
    log: &InstanceLog,
) -> Result<ArtifactStatus> {
    let found = runtime
        .copy_out(container_id, container_path, host_path)
        .await
        .with_context(|| format!("Failed to collect {}", container_path))?;

    runtime
        .delete_file(container_id, container_path)
        .await
        .with_context(|| format!("Failed to delete {} in container", container_path))?;

    if found {
        log.info(format!("Report copied from {} to {}", container_path, host_path.display()));
        Ok(ArtifactStatus::Collected {
            path: host_path.to_path_buf(),
        })
    } else {
        log.warn(format!(
            "Missing artifact: {} was not produced by the test run",
            container_path
        ));
        Ok(ArtifactStatus::Missing)
    }
}

/// Parse a collected report; a report that is not JSON is kept on disk but not embedded
pub fn read_report(status: &ArtifactStatus, log: &InstanceLog) -> Option<serde_json::Value> {
    let ArtifactStatus::Collected { path } = status else {
        return None;
    };

    let parsed = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from));

    match parsed {
        Ok(value) => Some(value),
        Err(e) => {
            log.warn(format!("Report at {} is not valid JSON: {}", path.display(), e));
            None
        }
    }
}
