use serde::{Deserialize, Serialize};
use std::fmt;

/// One evaluation unit read from the dataset.
///
/// Every field defaults when absent so that a malformed record reaches the
/// spec resolver (and is rejected there) instead of failing the whole load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub base_commit: String,
    /// `null` in the dataset means "no changes"
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub test: TestSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSpec {
    #[serde(default)]
    pub test_cmd: String,
    #[serde(default)]
    pub test_dir: String,
}

impl Instance {
    /// Repository name without the owner (`psf/requests` -> `requests`)
    pub fn repo_name(&self) -> &str {
        self.repo.rsplit('/').next().unwrap_or(&self.repo)
    }

    pub fn patch_text(&self) -> &str {
        self.patch.as_deref().unwrap_or("")
    }
}

/// Result of a single command run inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `None` when the command was cut off by its deadline
    pub exit_code: Option<i64>,
    /// stdout and stderr, interleaved in arrival order
    pub output: String,
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Terminal classification of one instance's evaluation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    TestFailure,
    ApplyFailure,
    BuildFailure,
    Timeout,
    UnexpectedError,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::TestFailure => "test_failure",
            OutcomeKind::ApplyFailure => "apply_failure",
            OutcomeKind::BuildFailure => "build_failure",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::UnexpectedError => "unexpected_error",
        };
        f.write_str(label)
    }
}

/// Per-repository line of the persisted summary file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub docker_image: String,
    pub docker_container: String,
    pub test_cmd: String,
    pub base_commit: String,
    pub outcome: OutcomeKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_from_dataset_record() {
        let raw = r#"{
            "repo": "psf/requests",
            "base_commit": "abc123",
            "patch": null,
            "test": {"test_cmd": "pytest", "test_dir": "tests/"},
            "src_dir": "src/requests"
        }"#;

        let instance: Instance = serde_json::from_str(raw).unwrap();

        assert_eq!(instance.repo_name(), "requests");
        assert_eq!(instance.patch_text(), "");
        assert_eq!(instance.test.test_cmd, "pytest");
        assert_eq!(instance.test.test_dir, "tests/");
    }

    #[test]
    fn test_instance_missing_fields_still_parse() {
        let instance: Instance = serde_json::from_str(r#"{"repo": "solo"}"#).unwrap();

        assert_eq!(instance.repo_name(), "solo");
        assert!(instance.base_commit.is_empty());
        assert!(instance.test.test_cmd.is_empty());
    }

    #[test]
    fn test_execution_result_succeeded() {
        let mut result = ExecutionResult {
            exit_code: Some(0),
            output: String::new(),
            elapsed_ms: 12,
            timed_out: false,
        };
        assert!(result.succeeded());

        result.exit_code = Some(1);
        assert!(!result.succeeded());

        result.exit_code = None;
        result.timed_out = true;
        assert!(!result.succeeded());
    }

    #[test]
    fn test_outcome_kind_serializes_snake_case() {
        let json = serde_json::to_string(&OutcomeKind::ApplyFailure).unwrap();
        assert_eq!(json, "\"apply_failure\"");
        assert_eq!(OutcomeKind::UnexpectedError.to_string(), "unexpected_error");
    }
}
