use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{from_millis, parse_key, parse_state, to_millis, to_u32},
    models::{CheckInOutcome, CheckInRecord, RecordState, SubmissionStatus},
};

fn row_to_outcome(row: &Row) -> Result<CheckInOutcome> {
    let key: String = row.get("idempotency_key")?;
    let state: String = row.get("state")?;
    let attempt_count: i64 = row.get("attempt_count")?;
    let enqueued_at: i64 = row.get("enqueued_at")?;
    let resolved_at: i64 = row.get("resolved_at")?;

    Ok(CheckInOutcome {
        idempotency_key: parse_key(&key)?,
        subject_id: row.get("subject_id")?,
        unit_code: row.get("unit_code")?,
        state: parse_state(&state)?,
        attempt_count: to_u32(attempt_count, "attempt_count")?,
        detail: row.get("detail")?,
        enqueued_at: from_millis(enqueued_at, "enqueued_at")?,
        resolved_at: from_millis(resolved_at, "resolved_at")?,
    })
}

pub(super) fn insert_outcome(
    conn: &Connection,
    record: &CheckInRecord,
    state: RecordState,
    attempt_count: u32,
    detail: Option<&str>,
    resolved_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO checkin_outcomes (
            idempotency_key, subject_id, unit_code, state, attempt_count,
            detail, enqueued_at, resolved_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.idempotency_key.to_string(),
            record.subject_id,
            record.unit_code,
            state.as_str(),
            i64::from(attempt_count),
            detail,
            to_millis(record.enqueued_at),
            to_millis(resolved_at),
        ],
    )
    .with_context(|| format!("failed to record {} outcome", state.as_str()))?;
    Ok(())
}

impl Database {
    pub async fn get_outcome(&self, key: Uuid) -> Result<Option<CheckInOutcome>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT idempotency_key, subject_id, unit_code, state, attempt_count,
                        detail, enqueued_at, resolved_at
                 FROM checkin_outcomes
                 WHERE idempotency_key = ?1",
            )?;
            let mut rows = stmt.query(params![key.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_outcome(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Most recently resolved check-ins first.
    pub async fn recent_outcomes(&self, limit: u32) -> Result<Vec<CheckInOutcome>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT idempotency_key, subject_id, unit_code, state, attempt_count,
                        detail, enqueued_at, resolved_at
                 FROM checkin_outcomes
                 ORDER BY resolved_at DESC
                 LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![i64::from(limit)])?;
            let mut outcomes = Vec::new();
            while let Some(row) = rows.next()? {
                outcomes.push(row_to_outcome(row)?);
            }
            Ok(outcomes)
        })
        .await
    }

    /// User-facing status of a check-in, whether it is still queued or has
    /// been resolved. `None` for keys this device never saw.
    pub async fn submission_status(&self, key: Uuid) -> Result<Option<SubmissionStatus>> {
        self.execute(move |conn| {
            let key = key.to_string();
            let active: Option<(String, i64, i64)> = conn
                .query_row(
                    "SELECT state, attempt_count, next_eligible_at
                     FROM outbox WHERE idempotency_key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            if let Some((state, attempts, next_eligible_at)) = active {
                return match parse_state(&state)? {
                    RecordState::InFlight => Ok(Some(SubmissionStatus::Sending)),
                    _ => Ok(Some(SubmissionStatus::Queued {
                        attempts: to_u32(attempts, "attempt_count")?,
                        next_attempt_at: from_millis(next_eligible_at, "next_eligible_at")?,
                    })),
                };
            }

            let resolved: Option<(String, i64, Option<String>)> = conn
                .query_row(
                    "SELECT state, attempt_count, detail
                     FROM checkin_outcomes WHERE idempotency_key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((state, attempts, detail)) = resolved else {
                return Ok(None);
            };

            let status = match parse_state(&state)? {
                RecordState::Delivered => SubmissionStatus::Delivered,
                RecordState::Failed => SubmissionStatus::Failed {
                    reason: detail.unwrap_or_else(|| "rejected by server".into()),
                },
                _ => SubmissionStatus::Expired {
                    attempts: to_u32(attempts, "attempt_count")?,
                },
            };
            Ok(Some(status))
        })
        .await
    }
}
