// Harness configuration for Patchbay Worker
use anyhow::{bail, Context, Result};
use patchbay_common::config::{
    CONTAINER_EVAL_SCRIPT_PATH, CONTAINER_PATCH_PATH, CONTAINER_REPORT_PATH, TESTBED_DIR,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Every field has a default, so an empty `{}` file is a valid configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Per-repository log directories are created under this root
    pub log_root: PathBuf,
    /// Where the image build collaborator keeps per-image build directories
    pub image_build_root: PathBuf,
    /// Summary mapping written once at batch end
    pub summary_path: PathBuf,
    /// Deadline for the eval script, in seconds
    pub timeout_secs: u64,
    pub workdir: String,
    pub container_patch_path: String,
    pub container_eval_script_path: String,
    pub container_report_path: String,
    /// Grace period given to `docker stop` before SIGKILL
    pub stop_timeout_secs: i64,
    /// Wait between SIGTERM and SIGKILL for a timed-out process group
    pub kill_grace_secs: u64,
    /// Pull images missing from the local cache instead of failing the build
    pub pull_missing_images: bool,
    /// Replaces the default eval script template when set
    pub eval_script_template: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("logs/run_setup"),
            image_build_root: PathBuf::from("logs/build_images/repo"),
            summary_path: PathBuf::from("config.yml"),
            timeout_secs: 1_800,
            workdir: TESTBED_DIR.to_string(),
            container_patch_path: CONTAINER_PATCH_PATH.to_string(),
            container_eval_script_path: CONTAINER_EVAL_SCRIPT_PATH.to_string(),
            container_report_path: CONTAINER_REPORT_PATH.to_string(),
            stop_timeout_secs: 10,
            kill_grace_secs: 5,
            pull_missing_images: false,
            eval_script_template: None,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Harness config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: HarnessConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, built-in defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be greater than zero");
        }
        if self.stop_timeout_secs < 0 {
            bail!("stop_timeout_secs must not be negative: {}", self.stop_timeout_secs);
        }
        if !self.workdir.starts_with('/') {
            bail!("workdir must be an absolute container path: {}", self.workdir);
        }
        for path in [
            &self.container_patch_path,
            &self.container_eval_script_path,
            &self.container_report_path,
        ] {
            if !path.starts_with('/') {
                bail!("container paths must be absolute: {}", path);
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Per-repository log directory
    pub fn log_dir(&self, repo_name: &str) -> PathBuf {
        self.log_root.join(repo_name)
    }
}
