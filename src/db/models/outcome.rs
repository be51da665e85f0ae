//! Terminal outcomes and the user-facing status derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RecordState;

/// Row in `checkin_outcomes`, written when a record leaves the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInOutcome {
    pub idempotency_key: Uuid,
    pub subject_id: String,
    pub unit_code: String,
    pub state: RecordState,
    pub attempt_count: u32,
    pub detail: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

/// What the check-in screen shows after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SubmissionStatus {
    Queued {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Sending,
    Delivered,
    Failed {
        reason: String,
    },
    Expired {
        attempts: u32,
    },
}

impl SubmissionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SubmissionStatus::Queued { .. } => "queued, will retry",
            SubmissionStatus::Sending => "sending",
            SubmissionStatus::Delivered => "delivered",
            SubmissionStatus::Failed { .. } => "failed, please check in again",
            SubmissionStatus::Expired { .. } => "expired, check-in was lost",
        }
    }
}
