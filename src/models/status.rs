use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::models::frame::{FrameJob, MalformedDelivery};

/// Status code for a frame that reached a committed result.
pub const STATUS_OK: u16 = 2000;
/// Status code for a frame that was dead-lettered or dropped.
pub const STATUS_FAILED: u16 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FrameState {
    Processed,
    DeadLettered,
    Dropped,
}

/// Reply published once per consumed frame after it settles, so producers
/// can follow a job without reading the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStatus {
    pub code: u16,
    pub job_id: String,
    pub stream_id: String,
    pub sequence_number: Option<i64>,
    pub state: FrameState,
    pub message: String,
    /// Detections written by this delivery; `None` for a duplicate.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detections: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

impl FrameStatus {
    pub fn committed(job: &FrameJob, detections: usize) -> Self {
        Self::for_job(job, STATUS_OK, FrameState::Processed, "OK".to_string(), Some(detections))
    }

    /// Redelivery of a frame whose results were already committed.
    pub fn duplicate(job: &FrameJob) -> Self {
        Self::for_job(job, STATUS_OK, FrameState::Processed, "already processed".to_string(), None)
    }

    pub fn failed(job: &FrameJob, state: FrameState, reason: &str) -> Self {
        Self::for_job(job, STATUS_FAILED, state, reason.to_string(), None)
    }

    pub fn rejected(malformed: &MalformedDelivery, state: FrameState) -> Self {
        Self {
            code: STATUS_FAILED,
            job_id: malformed.job_id.clone().unwrap_or_else(|| "unknown".to_string()),
            stream_id: malformed.stream_id.clone().unwrap_or_else(|| "unknown".to_string()),
            sequence_number: malformed.sequence_number,
            state,
            message: malformed.reason.clone(),
            detections: None,
            timestamp: Utc::now(),
        }
    }

    fn for_job(job: &FrameJob, code: u16, state: FrameState, message: String, detections: Option<usize>) -> Self {
        Self {
            code,
            job_id: job.job_id.clone(),
            stream_id: job.stream_id.clone(),
            sequence_number: Some(job.sequence_number),
            state,
            message,
            detections,
            timestamp: Utc::now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == STATUS_OK
    }
}
