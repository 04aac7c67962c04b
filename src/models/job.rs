use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::outcome::FailureKind;

/// Persisted state of a frame job in `job_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Processed,
    Failed,
}

/// One row of `job_status`. At most one row per `(stream_id, sequence_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub job_id: String,
    pub stream_id: String,
    pub sequence_number: i64,
    pub state: JobState,
    pub attempt_count: i32,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Entry appended to the dead-letter sink for operator review or replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub job_id: String,
    pub stream_id: String,
    pub sequence_number: Option<i64>,
    pub failure_kind: FailureKind,
    pub reason: String,
    pub attempt_count: u32,
    pub timestamp: DateTime<Utc>,
    /// Leading part of the raw message, kept only when it could not be parsed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload_excerpt: Option<String>,
}
