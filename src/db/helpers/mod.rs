use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::ErrorCode;
use uuid::Uuid;

use crate::db::models::RecordState;

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} contains out-of-range value {value}"))
}

/// Timestamps are stored as epoch milliseconds so ordering in SQL is numeric.
pub fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub fn from_millis(value: i64, field: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| anyhow!("{field} contains invalid timestamp {value}"))
}

pub fn from_optional_millis(value: Option<i64>, field: &str) -> Result<Option<DateTime<Utc>>> {
    value.map(|raw| from_millis(raw, field)).transpose()
}

pub fn parse_key(value: &str) -> Result<Uuid> {
    value
        .parse::<Uuid>()
        .with_context(|| format!("invalid idempotency key '{value}'"))
}

pub fn parse_state(value: &str) -> Result<RecordState> {
    match value {
        "Pending" => Ok(RecordState::Pending),
        "InFlight" => Ok(RecordState::InFlight),
        "Delivered" => Ok(RecordState::Delivered),
        "Expired" => Ok(RecordState::Expired),
        "Failed" => Ok(RecordState::Failed),
        other => Err(anyhow!("unknown record state {other}")),
    }
}

/// True when the error chain bottoms out in SQLite running out of space.
pub fn is_storage_full(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::DiskFull
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_survive_storage() {
        let now = from_millis(1_700_000_000_123, "now").unwrap();
        assert_eq!(from_millis(to_millis(now), "now").unwrap(), now);
    }

    #[test]
    fn detects_disk_full() {
        let full = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        let err = anyhow::Error::new(full).context("failed to enqueue");
        assert!(is_storage_full(&err));
        assert!(!is_storage_full(&anyhow!("something else")));
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            RecordState::Pending,
            RecordState::InFlight,
            RecordState::Delivered,
            RecordState::Expired,
            RecordState::Failed,
        ] {
            assert_eq!(parse_state(state.as_str()).unwrap(), state);
        }
    }
}
