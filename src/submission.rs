//! Turns an admitted check-in gesture into exactly one durable outbox record.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::db::helpers::is_storage_full;
use crate::db::{CheckInRecord, Database, EnqueueOutcome, PhotoRef};
use crate::geo::{evaluate, AdmissionDecision, GeoError, GeofenceTarget, IndeterminateReason, LocationReading};

/// Everything the check-in screen knows at the moment the worker taps "check in".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInRequest {
    pub subject_id: String,
    pub unit_code: String,
    pub reading: LocationReading,
    pub photo: PhotoRef,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CheckInError {
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(GeoError),
    #[error("no geofence configured for unit {0}")]
    UnknownUnit(String),
    #[error("geofence for unit {unit_code} is invalid: {source}")]
    InvalidTarget { unit_code: String, source: GeoError },
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("location unavailable: {}", .0.as_str())]
    LocationUnavailable(IndeterminateReason),
    #[error("you are {}m away from {unit_code}, must be within {}m", .distance_meters.round(), .radius_meters.round())]
    OutOfRange {
        unit_code: String,
        distance_meters: f64,
        radius_meters: f64,
    },
    #[error("a check-in is already pending ({idempotency_key})")]
    AlreadyPending { idempotency_key: Uuid },
    #[error("device storage is full, cannot queue check-in offline")]
    StorageFull,
    #[error(transparent)]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for CheckInError {
    fn from(err: anyhow::Error) -> Self {
        if is_storage_full(&err) {
            CheckInError::StorageFull
        } else {
            CheckInError::Storage(err)
        }
    }
}

pub struct SubmissionBuilder {
    db: Database,
    targets: BTreeMap<String, GeofenceTarget>,
    wake: Option<Arc<Notify>>,
}

impl SubmissionBuilder {
    pub fn new(db: Database, targets: BTreeMap<String, GeofenceTarget>) -> Self {
        Self {
            db,
            targets,
            wake: None,
        }
    }

    /// Nudges the delivery loop after every successful enqueue.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn target(&self, unit_code: &str) -> Option<&GeofenceTarget> {
        self.targets.get(unit_code)
    }

    /// Gates the request and persists a new `Pending` record. Success means
    /// the record is on disk; delivery happens later, possibly much later.
    pub async fn submit(&self, request: CheckInRequest) -> Result<CheckInRecord, CheckInError> {
        if request.subject_id.trim().is_empty() {
            return Err(CheckInError::MissingField("subject id"));
        }
        if request.unit_code.trim().is_empty() {
            return Err(CheckInError::MissingField("unit code"));
        }

        let target = self
            .targets
            .get(&request.unit_code)
            .ok_or_else(|| CheckInError::UnknownUnit(request.unit_code.clone()))?;
        target
            .validate()
            .map_err(|source| CheckInError::InvalidTarget {
                unit_code: request.unit_code.clone(),
                source,
            })?;

        if let Some(point) = request.reading.point() {
            point.validate().map_err(CheckInError::InvalidCoordinates)?;
        }

        let coordinates = match evaluate(&request.reading, target) {
            AdmissionDecision::Admitted { .. } => request.reading.point(),
            AdmissionDecision::Rejected { distance_meters } => {
                return Err(CheckInError::OutOfRange {
                    unit_code: request.unit_code,
                    distance_meters,
                    radius_meters: target.radius_meters,
                });
            }
            AdmissionDecision::Indeterminate { reason } => {
                return Err(CheckInError::LocationUnavailable(reason));
            }
        };
        let Some(coordinates) = coordinates else {
            return Err(CheckInError::LocationUnavailable(IndeterminateReason::NoFix));
        };

        if request.photo.uri.trim().is_empty() {
            return Err(CheckInError::MissingField("photo"));
        }
        if request.photo.content_type.trim().is_empty() {
            return Err(CheckInError::MissingField("photo content type"));
        }

        let record = CheckInRecord::new(
            request.subject_id,
            request.unit_code,
            coordinates,
            request.photo,
            request.captured_at,
        );

        match self.db.enqueue(&record).await? {
            EnqueueOutcome::Queued => {
                info!(
                    "Queued check-in {} for {} at {}",
                    record.idempotency_key, record.subject_id, record.unit_code
                );
                if let Some(wake) = &self.wake {
                    wake.notify_one();
                }
                Ok(record)
            }
            EnqueueOutcome::AlreadyPending(idempotency_key) => {
                warn!(
                    "Ignoring repeated check-in for {} at {}; {} is still pending",
                    record.subject_id, record.unit_code, idempotency_key
                );
                Err(CheckInError::AlreadyPending { idempotency_key })
            }
        }
    }
}
