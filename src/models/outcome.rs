use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::models::detection::Detection;

/// Failure taxonomy shared by every adapter. An idempotent duplicate is not a
/// failure and has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FailureKind {
    /// Broker, database or model-server connectivity.
    Transport,
    /// Malformed frame or data-integrity violation.
    Data,
    /// Accelerator or pool exhaustion, including timeouts waiting for either.
    Capacity,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, FailureKind::Data)
    }
}

/// A classified failure with a human readable reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Result of one processing attempt, consumed immediately by the pipeline.
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    Success(Vec<Detection>),
    TransientFailure(Failure),
    PermanentFailure(Failure),
}

impl From<Failure> for ProcessingOutcome {
    fn from(failure: Failure) -> Self {
        if failure.kind.is_transient() {
            ProcessingOutcome::TransientFailure(failure)
        } else {
            ProcessingOutcome::PermanentFailure(failure)
        }
    }
}
