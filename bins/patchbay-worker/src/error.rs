// Closed error taxonomy for one instance's evaluation
use patchbay_common::spec::SpecError;
use patchbay_common::types::OutcomeKind;
use serde::Serialize;
use std::fmt;

/// Image or container construction failed; no container is running
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to build container from image {image_key}: {message}")]
pub struct BuildError {
    pub image_key: String,
    pub message: String,
}

impl BuildError {
    pub fn new(image_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            image_key: image_key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationFailure {
    ApplyPatch,
    Timeout,
}

impl fmt::Display for EvaluationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationFailure::ApplyPatch => f.write_str(">>>>> Patch Apply Failed"),
            EvaluationFailure::Timeout => f.write_str(">>>>> Tests Timed Out"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    InvalidInstance(#[from] SpecError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("{repo}: {failure}:\n{message}")]
    Evaluation {
        repo: String,
        failure: EvaluationFailure,
        message: String,
    },

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl HarnessError {
    pub fn evaluation(
        repo: impl Into<String>,
        failure: EvaluationFailure,
        message: impl Into<String>,
    ) -> Self {
        HarnessError::Evaluation {
            repo: repo.into(),
            failure,
            message: message.into(),
        }
    }

    /// Outcome for an instance that ended with this error.
    /// `None` for instances rejected before a spec existed.
    pub fn outcome(&self) -> Option<OutcomeKind> {
        match self {
            HarnessError::InvalidInstance(_) => None,
            HarnessError::Build(_) => Some(OutcomeKind::BuildFailure),
            HarnessError::Evaluation {
                failure: EvaluationFailure::ApplyPatch,
                ..
            } => Some(OutcomeKind::ApplyFailure),
            HarnessError::Evaluation {
                failure: EvaluationFailure::Timeout,
                ..
            } => Some(OutcomeKind::Timeout),
            HarnessError::Unexpected(_) => Some(OutcomeKind::UnexpectedError),
        }
    }

    /// Rendering for logs: unexpected errors keep their full context chain and backtrace
    pub fn detailed(&self) -> String {
        match self {
            HarnessError::Unexpected(e) => format!("{:?}", e),
            other => other.to_string(),
        }
    }
}
