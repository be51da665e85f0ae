//! Geofence gate: turns a location reading into an admission decision.
//!
//! The gate is stateless. Callers re-invoke it for every new reading rather
//! than caching a verdict, so a worker walking into range is admitted on the
//! next fix.

use serde::{Deserialize, Serialize};

use super::{haversine_distance, GeoError, GeoPoint};

pub const DEFAULT_RADIUS_METERS: f64 = 100.0;

fn default_radius() -> f64 {
    DEFAULT_RADIUS_METERS
}

/// Center and allowed radius for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceTarget {
    pub center: GeoPoint,
    #[serde(default = "default_radius")]
    pub radius_meters: f64,
}

impl GeofenceTarget {
    pub fn new(center: GeoPoint, radius_meters: f64) -> Result<Self, GeoError> {
        let target = Self {
            center,
            radius_meters,
        };
        target.validate()?;
        Ok(target)
    }

    pub fn validate(&self) -> Result<(), GeoError> {
        self.center.validate()?;
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(GeoError::Radius(self.radius_meters));
        }
        Ok(())
    }
}

/// Why the gate could not decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndeterminateReason {
    PermissionDenied,
    Unsupported,
    NoFix,
    SignalLost,
}

impl IndeterminateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndeterminateReason::PermissionDenied => "location permission denied",
            IndeterminateReason::Unsupported => "location not supported on this device",
            IndeterminateReason::NoFix => "waiting for a GPS fix",
            IndeterminateReason::SignalLost => "GPS signal lost",
        }
    }
}

/// One event from the location capability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LocationReading {
    Fix { point: GeoPoint },
    Unavailable { reason: IndeterminateReason },
}

impl LocationReading {
    pub fn point(&self) -> Option<GeoPoint> {
        match self {
            LocationReading::Fix { point } => Some(*point),
            LocationReading::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum AdmissionDecision {
    Admitted { distance_meters: f64 },
    Rejected { distance_meters: f64 },
    Indeterminate { reason: IndeterminateReason },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted { .. })
    }

    /// Message for the check-in screen.
    pub fn describe(&self, target: &GeofenceTarget) -> String {
        match self {
            AdmissionDecision::Admitted { distance_meters } => {
                format!("Within range ({}m from the unit)", distance_meters.round())
            }
            AdmissionDecision::Rejected { distance_meters } => format!(
                "You are {}m away from the unit. Must be within {}m.",
                distance_meters.round(),
                target.radius_meters.round()
            ),
            AdmissionDecision::Indeterminate { reason } => {
                format!("Location unavailable: {}", reason.as_str())
            }
        }
    }
}

pub fn evaluate(reading: &LocationReading, target: &GeofenceTarget) -> AdmissionDecision {
    match reading {
        LocationReading::Fix { point } => evaluate_point(Some(*point), target),
        LocationReading::Unavailable { reason } => {
            AdmissionDecision::Indeterminate { reason: *reason }
        }
    }
}

/// `None` means no fix has arrived yet.
pub fn evaluate_point(point: Option<GeoPoint>, target: &GeofenceTarget) -> AdmissionDecision {
    let Some(point) = point else {
        return AdmissionDecision::Indeterminate {
            reason: IndeterminateReason::NoFix,
        };
    };

    let distance_meters = haversine_distance(point, target.center);
    if distance_meters <= target.radius_meters {
        AdmissionDecision::Admitted { distance_meters }
    } else {
        AdmissionDecision::Rejected { distance_meters }
    }
}
