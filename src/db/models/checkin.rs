//! Check-in records held by the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordState {
    Pending,
    InFlight,
    Delivered,
    Expired,
    Failed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "Pending",
            RecordState::InFlight => "InFlight",
            RecordState::Delivered => "Delivered",
            RecordState::Expired => "Expired",
            RecordState::Failed => "Failed",
        }
    }

    /// Terminal records have left the outbox.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::Delivered | RecordState::Expired | RecordState::Failed
        )
    }
}

/// Opaque reference to an uploaded proof photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRef {
    pub uri: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInRecord {
    pub idempotency_key: Uuid,
    pub subject_id: String,
    pub unit_code: String,
    pub coordinates: GeoPoint,
    pub captured_at: DateTime<Utc>,
    pub photo: PhotoRef,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub state: RecordState,
}

impl CheckInRecord {
    /// A fresh record, eligible for delivery immediately.
    pub fn new(
        subject_id: String,
        unit_code: String,
        coordinates: GeoPoint,
        photo: PhotoRef,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            idempotency_key: Uuid::new_v4(),
            subject_id,
            unit_code,
            coordinates,
            captured_at,
            photo,
            attempt_count: 0,
            last_attempt_at: None,
            next_eligible_at: captured_at,
            enqueued_at: captured_at,
            state: RecordState::Pending,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.enqueued_at
    }
}
