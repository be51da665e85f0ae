use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::{connection::Database, helpers::to_millis};

impl Database {
    /// Takes or renews the delivery lease for `owner` until `now + ttl`.
    ///
    /// Returns `false` while another session holds an unexpired lease; that
    /// session may be in the middle of an attempt and owns its claims.
    pub async fn acquire_lease(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool> {
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| anyhow!("lease of {ttl} reaches past the calendar"))?;
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let holder: Option<(String, i64)> = tx
                .query_row(
                    "SELECT owner, expires_at FROM delivery_lease WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let owner = owner.to_string();
            if let Some((holder, holder_expires_at)) = holder {
                if holder != owner && holder_expires_at > to_millis(now) {
                    return Ok(false);
                }
            }

            tx.execute(
                "INSERT INTO delivery_lease (id, owner, acquired_at, expires_at)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     owner = excluded.owner,
                     acquired_at = CASE WHEN delivery_lease.owner = excluded.owner
                                        THEN delivery_lease.acquired_at
                                        ELSE excluded.acquired_at END,
                     expires_at = excluded.expires_at",
                params![owner, to_millis(now), to_millis(expires_at)],
            )?;
            tx.commit().context("failed to commit delivery lease")?;
            Ok(true)
        })
        .await
    }

    /// Gives the lease up if `owner` still holds it.
    pub async fn release_lease(&self, owner: Uuid) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM delivery_lease WHERE id = 1 AND owner = ?1",
                params![owner.to_string()],
            )?;
            Ok(())
        })
        .await
    }
}
