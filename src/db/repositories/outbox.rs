use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{from_millis, from_optional_millis, parse_key, parse_state, to_millis, to_u32},
    models::{CheckInRecord, PhotoRef, RecordState},
};
use crate::geo::GeoPoint;

use super::outcomes::insert_outcome;

const RECORD_COLUMNS: &str = "idempotency_key, subject_id, unit_code, latitude, longitude, \
     captured_at, photo_uri, photo_content_type, attempt_count, last_attempt_at, \
     next_eligible_at, enqueued_at, state";

/// Result of trying to add a check-in to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The same worker already has an active check-in for this unit.
    AlreadyPending(Uuid),
}

/// How a failed delivery attempt is settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Retry {
        next_eligible_at: DateTime<Utc>,
        detail: String,
    },
    Terminal {
        reason: String,
    },
}

fn row_to_record(row: &Row) -> Result<CheckInRecord> {
    let key: String = row.get("idempotency_key")?;
    let captured_at: i64 = row.get("captured_at")?;
    let last_attempt_at: Option<i64> = row.get("last_attempt_at")?;
    let next_eligible_at: i64 = row.get("next_eligible_at")?;
    let enqueued_at: i64 = row.get("enqueued_at")?;
    let attempt_count: i64 = row.get("attempt_count")?;
    let state: String = row.get("state")?;

    Ok(CheckInRecord {
        idempotency_key: parse_key(&key)?,
        subject_id: row.get("subject_id")?,
        unit_code: row.get("unit_code")?,
        coordinates: GeoPoint {
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
        },
        captured_at: from_millis(captured_at, "captured_at")?,
        photo: PhotoRef {
            uri: row.get("photo_uri")?,
            content_type: row.get("photo_content_type")?,
        },
        attempt_count: to_u32(attempt_count, "attempt_count")?,
        last_attempt_at: from_optional_millis(last_attempt_at, "last_attempt_at")?,
        next_eligible_at: from_millis(next_eligible_at, "next_eligible_at")?,
        enqueued_at: from_millis(enqueued_at, "enqueued_at")?,
        state: parse_state(&state)?,
    })
}

fn query_records(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<CheckInRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(args)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(row_to_record(row)?);
    }
    Ok(records)
}

fn find_claimed(conn: &Connection, key: &str, owner: &str) -> Result<Option<CheckInRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM outbox
         WHERE idempotency_key = ?1 AND state = 'InFlight' AND claim_owner = ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![key, owner])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_record(row)?)),
        None => Ok(None),
    }
}

/// Moves a record out of the outbox into the outcome log.
fn resolve(
    conn: &Connection,
    record: &CheckInRecord,
    state: RecordState,
    attempt_count: u32,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    insert_outcome(conn, record, state, attempt_count, detail, now)?;
    conn.execute(
        "DELETE FROM outbox WHERE idempotency_key = ?1",
        params![record.idempotency_key.to_string()],
    )?;
    Ok(())
}

impl Database {
    /// Appends a new `Pending` record unless the worker already has an active
    /// check-in for the unit. Returns only after the write has committed.
    pub async fn enqueue(&self, record: &CheckInRecord) -> Result<EnqueueOutcome> {
        let record = record.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            // The duplicate check and the insert run in the same DB task so a
            // double tap cannot slip a second record in between.
            let existing: Option<String> = tx
                .query_row(
                    "SELECT idempotency_key FROM outbox WHERE subject_id = ?1 AND unit_code = ?2",
                    params![record.subject_id, record.unit_code],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(key) = existing {
                return Ok(EnqueueOutcome::AlreadyPending(parse_key(&key)?));
            }

            tx.execute(
                "INSERT INTO outbox (
                    idempotency_key, subject_id, unit_code, latitude, longitude,
                    captured_at, photo_uri, photo_content_type, attempt_count,
                    last_attempt_at, next_eligible_at, enqueued_at, state
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'Pending')",
                params![
                    record.idempotency_key.to_string(),
                    record.subject_id,
                    record.unit_code,
                    record.coordinates.latitude,
                    record.coordinates.longitude,
                    to_millis(record.captured_at),
                    record.photo.uri,
                    record.photo.content_type,
                    i64::from(record.attempt_count),
                    record.last_attempt_at.map(to_millis),
                    to_millis(record.next_eligible_at),
                    to_millis(record.enqueued_at),
                ],
            )
            .context("failed to insert check-in into outbox")?;
            tx.commit().context("failed to commit enqueue")?;

            Ok(EnqueueOutcome::Queued)
        })
        .await
    }

    /// `Pending` records due at `now`, oldest first.
    pub async fn peek_ready(&self, now: DateTime<Utc>) -> Result<Vec<CheckInRecord>> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM outbox
                 WHERE state = 'Pending' AND next_eligible_at <= ?1
                 ORDER BY seq ASC"
            );
            query_records(conn, &sql, params![to_millis(now)])
        })
        .await
    }

    /// Claims a record for a delivery attempt on behalf of `owner`, the
    /// delivery session. Only one caller can win the claim; everyone else
    /// gets `false`.
    pub async fn mark_in_flight(&self, key: Uuid, owner: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.execute(move |conn| {
            let rows = conn.execute(
                "UPDATE outbox
                 SET state = 'InFlight',
                     claim_owner = ?2,
                     claimed_at = ?3,
                     last_attempt_at = ?3
                 WHERE idempotency_key = ?1 AND state = 'Pending'",
                params![key.to_string(), owner.to_string(), to_millis(now)],
            )?;
            Ok(rows == 1)
        })
        .await
    }

    /// Returns `false` when `owner` no longer holds the record, e.g. it
    /// expired or was recovered while the attempt was running.
    pub async fn mark_delivered(&self, key: Uuid, owner: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let Some(record) = find_claimed(&tx, &key.to_string(), &owner.to_string())? else {
                return Ok(false);
            };
            resolve(
                &tx,
                &record,
                RecordState::Delivered,
                record.attempt_count,
                None,
                now,
            )?;
            tx.commit().context("failed to commit delivery")?;
            Ok(true)
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        key: Uuid,
        owner: Uuid,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.execute(move |conn| match disposition {
            Disposition::Retry {
                next_eligible_at,
                detail,
            } => {
                let rows = conn.execute(
                    "UPDATE outbox
                     SET state = 'Pending',
                         attempt_count = attempt_count + 1,
                         next_eligible_at = ?3,
                         last_error = ?4,
                         claim_owner = NULL,
                         claimed_at = NULL
                     WHERE idempotency_key = ?1 AND state = 'InFlight' AND claim_owner = ?2",
                    params![
                        key.to_string(),
                        owner.to_string(),
                        to_millis(next_eligible_at),
                        detail
                    ],
                )?;
                Ok(rows == 1)
            }
            Disposition::Terminal { reason } => {
                let tx = conn.transaction()?;
                let Some(record) = find_claimed(&tx, &key.to_string(), &owner.to_string())? else {
                    return Ok(false);
                };
                resolve(
                    &tx,
                    &record,
                    RecordState::Failed,
                    record.attempt_count.saturating_add(1),
                    Some(&reason),
                    now,
                )?;
                tx.commit().context("failed to commit terminal failure")?;
                Ok(true)
            }
        })
        .await
    }

    /// Expires every record older than `retention`, whatever its attempt count
    /// or claim, and returns them for reporting.
    pub async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<Vec<CheckInRecord>> {
        let cutoff = now
            .checked_sub_signed(retention)
            .map(to_millis)
            .ok_or_else(|| anyhow!("retention window of {retention} reaches past the calendar"))?;
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM outbox WHERE enqueued_at < ?1 ORDER BY seq ASC"
            );
            let mut expired = query_records(&tx, &sql, params![cutoff])?;
            for record in &mut expired {
                let hours = record.age(now).num_hours();
                let detail = format!("gave up after {hours}h in the outbox");
                resolve(
                    &tx,
                    record,
                    RecordState::Expired,
                    record.attempt_count,
                    Some(&detail),
                    now,
                )?;
                record.state = RecordState::Expired;
            }
            tx.commit().context("failed to commit expiry")?;
            Ok(expired)
        })
        .await
    }

    /// Returns records claimed by any session other than `owner` to
    /// `Pending`. Only call this while holding the delivery lease: the lease
    /// guarantees no other session is still working on those claims.
    pub async fn recover_in_flight(&self, owner: Uuid) -> Result<usize> {
        self.execute(move |conn| {
            let rows = conn.execute(
                "UPDATE outbox
                 SET state = 'Pending', claim_owner = NULL, claimed_at = NULL
                 WHERE state = 'InFlight'
                   AND (claim_owner IS NULL OR claim_owner != ?1)",
                params![owner.to_string()],
            )?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_record(&self, key: Uuid) -> Result<Option<CheckInRecord>> {
        self.execute(move |conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox WHERE idempotency_key = ?1");
            let mut records = query_records(conn, &sql, params![key.to_string()])?;
            Ok(records.pop())
        })
        .await
    }

    pub async fn list_records(&self) -> Result<Vec<CheckInRecord>> {
        self.execute(|conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox ORDER BY seq ASC");
            query_records(conn, &sql, [])
        })
        .await
    }

    pub async fn active_record_for(
        &self,
        subject_id: &str,
        unit_code: &str,
    ) -> Result<Option<CheckInRecord>> {
        let subject_id = subject_id.to_string();
        let unit_code = unit_code.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM outbox WHERE subject_id = ?1 AND unit_code = ?2"
            );
            let mut records = query_records(conn, &sql, params![subject_id, unit_code])?;
            Ok(records.pop())
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    use crate::db::models::SubmissionStatus;

    pub(crate) fn test_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("outbox.sqlite3")).unwrap();
        (dir, db)
    }

    /// Delivery session used by tests that claim records directly.
    pub(crate) fn owner() -> Uuid {
        Uuid::from_u128(0xfeed)
    }

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 7, 30, 0).unwrap()
    }

    pub(crate) fn sample_record(subject: &str, captured_at: DateTime<Utc>) -> CheckInRecord {
        CheckInRecord::new(
            subject.to_string(),
            "TTVH001".to_string(),
            GeoPoint {
                latitude: 11.3135,
                longitude: 106.0981,
            },
            PhotoRef {
                uri: format!("https://photos.example/attendance/{subject}.jpg"),
                content_type: "image/jpeg".to_string(),
            },
            captured_at,
        )
    }

    #[tokio::test]
    async fn enqueued_record_is_pending_with_stable_key() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());

        assert_eq!(db.enqueue(&record).await.unwrap(), EnqueueOutcome::Queued);

        let loaded = db.get_record(record.idempotency_key).await.unwrap().unwrap();
        assert_eq!(loaded.idempotency_key, record.idempotency_key);
        assert_eq!(loaded.state, RecordState::Pending);
        assert_eq!(loaded.attempt_count, 0);
        assert_eq!(loaded.captured_at, record.captured_at);
        assert_eq!(loaded.photo, record.photo);
    }

    #[tokio::test]
    async fn second_active_record_for_same_worker_and_unit_is_refused() {
        let (_dir, db) = test_db();
        let first = sample_record("emp-1", t0());
        let second = sample_record("emp-1", t0() + Duration::seconds(1));

        db.enqueue(&first).await.unwrap();
        let outcome = db.enqueue(&second).await.unwrap();

        assert_eq!(
            outcome,
            EnqueueOutcome::AlreadyPending(first.idempotency_key)
        );
        assert_eq!(db.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn peek_ready_is_fifo_and_respects_eligibility() {
        let (_dir, db) = test_db();
        let a = sample_record("emp-a", t0());
        let b = sample_record("emp-b", t0() + Duration::seconds(5));
        let mut later = sample_record("emp-c", t0());
        later.next_eligible_at = t0() + Duration::minutes(10);

        db.enqueue(&a).await.unwrap();
        db.enqueue(&b).await.unwrap();
        db.enqueue(&later).await.unwrap();

        let ready = db.peek_ready(t0() + Duration::minutes(1)).await.unwrap();
        let keys: Vec<Uuid> = ready.iter().map(|r| r.idempotency_key).collect();
        assert_eq!(keys, vec![a.idempotency_key, b.idempotency_key]);

        let ready = db.peek_ready(t0() + Duration::minutes(10)).await.unwrap();
        assert_eq!(ready.len(), 3);
    }

    #[tokio::test]
    async fn only_one_claim_wins() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());
        db.enqueue(&record).await.unwrap();

        let key = record.idempotency_key;
        let (first, second) = tokio::join!(
            db.mark_in_flight(key, owner(), t0()),
            db.mark_in_flight(key, owner(), t0())
        );
        assert!(first.unwrap() ^ second.unwrap());

        let loaded = db.get_record(key).await.unwrap().unwrap();
        assert_eq!(loaded.state, RecordState::InFlight);
        assert_eq!(loaded.last_attempt_at, Some(t0()));
        assert!(db.peek_ready(t0()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_returns_record_to_pending() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());
        db.enqueue(&record).await.unwrap();
        let key = record.idempotency_key;

        assert!(db.mark_in_flight(key, owner(), t0()).await.unwrap());
        let retry_at = t0() + Duration::seconds(5);
        let applied = db
            .mark_failed(
                key,
                owner(),
                Disposition::Retry {
                    next_eligible_at: retry_at,
                    detail: "timeout".into(),
                },
                t0(),
            )
            .await
            .unwrap();
        assert!(applied);

        let loaded = db.get_record(key).await.unwrap().unwrap();
        assert_eq!(loaded.state, RecordState::Pending);
        assert_eq!(loaded.attempt_count, 1);
        assert_eq!(loaded.next_eligible_at, retry_at);
        assert!(db.peek_ready(t0()).await.unwrap().is_empty());
        assert_eq!(db.peek_ready(retry_at).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delivered_record_leaves_the_outbox() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());
        db.enqueue(&record).await.unwrap();
        let key = record.idempotency_key;

        assert!(db.mark_in_flight(key, owner(), t0()).await.unwrap());
        assert!(db.mark_delivered(key, owner(), t0()).await.unwrap());

        assert!(db.get_record(key).await.unwrap().is_none());
        assert_eq!(
            db.submission_status(key).await.unwrap(),
            Some(SubmissionStatus::Delivered)
        );
        // The worker may check in again once the previous one has landed.
        let again = sample_record("emp-1", t0() + Duration::hours(9));
        assert_eq!(db.enqueue(&again).await.unwrap(), EnqueueOutcome::Queued);
    }

    #[tokio::test]
    async fn terminal_failure_is_removed_and_reported() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());
        db.enqueue(&record).await.unwrap();
        let key = record.idempotency_key;

        assert!(db.mark_in_flight(key, owner(), t0()).await.unwrap());
        let applied = db
            .mark_failed(
                key,
                owner(),
                Disposition::Terminal {
                    reason: "400 Bad Request: invalid bcvh_code".into(),
                },
                t0(),
            )
            .await
            .unwrap();
        assert!(applied);

        assert!(db.get_record(key).await.unwrap().is_none());
        assert!(db.peek_ready(t0() + Duration::days(1)).await.unwrap().is_empty());
        match db.submission_status(key).await.unwrap() {
            Some(SubmissionStatus::Failed { reason }) => assert!(reason.contains("400")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transitions_require_an_in_flight_claim() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());
        db.enqueue(&record).await.unwrap();
        let key = record.idempotency_key;

        assert!(!db.mark_delivered(key, owner(), t0()).await.unwrap());
        assert!(!db
            .mark_failed(
                key,
                owner(),
                Disposition::Terminal {
                    reason: "nope".into()
                },
                t0()
            )
            .await
            .unwrap());
        assert_eq!(
            db.get_record(key).await.unwrap().unwrap().state,
            RecordState::Pending
        );
    }

    #[tokio::test]
    async fn expiry_ignores_attempt_count_and_claims() {
        let (_dir, db) = test_db();
        let fresh = sample_record("emp-fresh", t0() + Duration::hours(2));
        let untried = sample_record("emp-untried", t0());
        let claimed = sample_record("emp-claimed", t0());
        db.enqueue(&fresh).await.unwrap();
        db.enqueue(&untried).await.unwrap();
        db.enqueue(&claimed).await.unwrap();
        assert!(db
            .mark_in_flight(claimed.idempotency_key, owner(), t0())
            .await
            .unwrap());

        let now = t0() + Duration::hours(25);
        let expired = db.purge_expired(now, Duration::hours(24)).await.unwrap();

        let keys: Vec<Uuid> = expired.iter().map(|r| r.idempotency_key).collect();
        assert_eq!(keys, vec![untried.idempotency_key, claimed.idempotency_key]);
        assert!(expired.iter().all(|r| r.state == RecordState::Expired));

        let remaining = db.list_records().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].idempotency_key, fresh.idempotency_key);

        // The in-flight attempt for the expired record comes back stale.
        assert!(!db
            .mark_delivered(claimed.idempotency_key, owner(), now)
            .await
            .unwrap());
        assert!(matches!(
            db.submission_status(claimed.idempotency_key).await.unwrap(),
            Some(SubmissionStatus::Expired { .. })
        ));
    }

    #[tokio::test]
    async fn record_at_exactly_the_retention_window_is_kept() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());
        db.enqueue(&record).await.unwrap();

        let expired = db
            .purge_expired(t0() + Duration::hours(24), Duration::hours(24))
            .await
            .unwrap();
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn unrepresentable_retention_window_is_an_error_not_a_dead_worker() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());
        db.enqueue(&record).await.unwrap();

        assert!(db
            .purge_expired(t0(), Duration::days(100_000_000))
            .await
            .is_err());

        // The outbox keeps working afterwards.
        assert_eq!(db.list_records().await.unwrap().len(), 1);
        assert!(db
            .purge_expired(t0() + Duration::hours(1), Duration::hours(24))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn claims_are_settled_and_recovered_only_across_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.sqlite3");
        let daemon_db = Database::new(path.clone()).unwrap();
        let other_db = Database::new(path).unwrap();
        let daemon = Uuid::new_v4();
        let other = Uuid::new_v4();

        let record = sample_record("emp-1", t0());
        let key = record.idempotency_key;
        daemon_db.enqueue(&record).await.unwrap();
        assert!(daemon_db.mark_in_flight(key, daemon, t0()).await.unwrap());

        // A second session can neither claim nor settle the daemon's attempt.
        assert!(!other_db.mark_in_flight(key, other, t0()).await.unwrap());
        assert!(!other_db.mark_delivered(key, other, t0()).await.unwrap());

        // The holder's own claims are never treated as orphaned.
        assert_eq!(daemon_db.recover_in_flight(daemon).await.unwrap(), 0);
        assert!(daemon_db.mark_delivered(key, daemon, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn queued_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.sqlite3");
        let record = sample_record("emp-1", t0());

        {
            let db = Database::new(path.clone()).unwrap();
            db.enqueue(&record).await.unwrap();
            assert!(db.mark_in_flight(record.idempotency_key, owner(), t0()).await.unwrap());
        }

        let db = Database::new(path).unwrap();
        assert_eq!(db.recover_in_flight(Uuid::new_v4()).await.unwrap(), 1);
        let loaded = db.get_record(record.idempotency_key).await.unwrap().unwrap();
        assert_eq!(loaded.state, RecordState::Pending);
        assert_eq!(db.peek_ready(t0()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn active_record_lookup_is_scoped_to_worker_and_unit() {
        let (_dir, db) = test_db();
        let record = sample_record("emp-1", t0());
        db.enqueue(&record).await.unwrap();

        assert!(db
            .active_record_for("emp-1", "TTVH001")
            .await
            .unwrap()
            .is_some());
        assert!(db
            .active_record_for("emp-2", "TTVH001")
            .await
            .unwrap()
            .is_none());
        assert!(db
            .active_record_for("emp-1", "TTVH002")
            .await
            .unwrap()
            .is_none());
    }
}
