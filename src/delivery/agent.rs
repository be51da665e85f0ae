use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{CheckInRecord, Database, Disposition};

use super::backoff::BackoffPolicy;
use super::clock::{Clock, SystemClock};
use super::remote::{DeliveryOutcome, RemoteStore};

// Set to false to silence the per-record delivery chatter.
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const EVENT_CAPACITY: usize = 64;
/// Slack on top of the attempt timeout before an unrenewed lease lapses.
const LEASE_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Maximum queued age before a record is expired.
    pub retention: chrono::Duration,
    pub backoff: BackoffPolicy,
    /// Per-attempt ceiling; hitting it counts as a transient failure.
    pub attempt_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::hours(24),
            backoff: BackoffPolicy::default(),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl DeliveryPolicy {
    /// Long enough to cover one attempt between renewals.
    pub fn lease_ttl(&self) -> chrono::Duration {
        let ttl = self
            .attempt_timeout
            .saturating_mul(2)
            .saturating_add(LEASE_MARGIN);
        chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// When a record that failed at `finished_at` may be tried again.
    ///
    /// A delay that does not fit the calendar falls back to the retention
    /// window, by which point the record has expired anyway.
    pub fn retry_at(&self, finished_at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| finished_at.checked_add_signed(delay))
            .or_else(|| finished_at.checked_add_signed(self.retention))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Reported to whoever is watching the outbox (the check-in screen, the CLI).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DeliveryEvent {
    Delivered {
        idempotency_key: Uuid,
        attempts: u32,
    },
    Retrying {
        idempotency_key: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        detail: String,
    },
    Failed {
        idempotency_key: Uuid,
        reason: String,
    },
    Expired {
        idempotency_key: Uuid,
        attempts: u32,
    },
}

impl DeliveryEvent {
    pub fn idempotency_key(&self) -> Uuid {
        match self {
            DeliveryEvent::Delivered {
                idempotency_key, ..
            }
            | DeliveryEvent::Retrying {
                idempotency_key, ..
            }
            | DeliveryEvent::Failed {
                idempotency_key, ..
            }
            | DeliveryEvent::Expired {
                idempotency_key, ..
            } => *idempotency_key,
        }
    }
}

/// Counts from one pass over the outbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub expired: usize,
    /// Attempts whose result arrived after the record had already left the outbox.
    pub stale: usize,
    /// Claims left behind by a session that no longer holds the lease.
    pub recovered: usize,
    /// Another process is delivering; this pass touched nothing.
    pub lease_held_elsewhere: bool,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct DeliveryAgent<R> {
    db: Database,
    remote: Arc<R>,
    policy: DeliveryPolicy,
    events: broadcast::Sender<DeliveryEvent>,
    clock: Arc<dyn Clock>,
    /// Identifies this session's lease and claims.
    owner: Uuid,
}

impl<R: RemoteStore> DeliveryAgent<R> {
    pub fn new(db: Database, remote: Arc<R>, policy: DeliveryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            remote,
            policy,
            events,
            clock: Arc::new(SystemClock),
            owner: Uuid::new_v4(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// One pass: take the delivery lease, recover claims of dead sessions,
    /// expire what is too old, then deliver every ready record in order, one
    /// at a time. A failing record never stops the pass.
    ///
    /// The clock is read again for every claim and every result, so a slow
    /// attempt pushes the records behind it (and its own backoff) later.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let started = self.clock.now();

        if !self
            .db
            .acquire_lease(self.owner, started, self.policy.lease_ttl())
            .await?
        {
            log_debug!("another session holds the delivery lease, skipping pass");
            report.lease_held_elsewhere = true;
            return Ok(report);
        }

        report.recovered = self.db.recover_in_flight(self.owner).await?;
        if report.recovered > 0 {
            log_info!(
                "returned {} interrupted check-in(s) to the queue",
                report.recovered
            );
        }

        match self.db.purge_expired(started, self.policy.retention).await {
            Ok(expired) => {
                for record in expired {
                    log_warn!(
                        "check-in {} expired after {} attempts ({}h queued)",
                        record.idempotency_key,
                        record.attempt_count,
                        record.age(started).num_hours()
                    );
                    report.expired += 1;
                    self.emit(DeliveryEvent::Expired {
                        idempotency_key: record.idempotency_key,
                        attempts: record.attempt_count,
                    });
                }
            }
            Err(err) => log_error!("failed to purge expired check-ins: {err:?}"),
        }

        let ready = self.db.peek_ready(started).await?;
        if !ready.is_empty() {
            log_debug!("{} check-in(s) ready for delivery", ready.len());
        }

        for record in ready {
            let key = record.idempotency_key;
            let claimed_at = self.clock.now();
            if !self
                .db
                .acquire_lease(self.owner, claimed_at, self.policy.lease_ttl())
                .await?
            {
                log_warn!("delivery lease lost mid-pass, leaving the rest of the queue");
                report.lease_held_elsewhere = true;
                break;
            }
            if let Err(err) = self.deliver_record(record, claimed_at, &mut report).await {
                log_error!("delivery of check-in {key} failed locally: {err:?}");
            }
        }

        Ok(report)
    }

    /// Hands the lease back so the next session does not wait for it to lapse.
    pub async fn release_lease(&self) -> Result<()> {
        self.db.release_lease(self.owner).await
    }

    async fn deliver_record(
        &self,
        record: CheckInRecord,
        claimed_at: DateTime<Utc>,
        report: &mut DrainReport,
    ) -> Result<()> {
        let key = record.idempotency_key;

        if !self.db.mark_in_flight(key, self.owner, claimed_at).await? {
            log_debug!("check-in {key} already claimed, skipping");
            return Ok(());
        }

        let outcome =
            match tokio::time::timeout(self.policy.attempt_timeout, self.remote.deliver(&record))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::Transient(format!(
                    "attempt timed out after {}ms",
                    self.policy.attempt_timeout.as_millis()
                )),
            };
        let finished_at = self.clock.now();

        // Every transition below is conditional on the record still being
        // claimed by us; anything else means it expired while we were waiting.
        match outcome {
            DeliveryOutcome::Accepted | DeliveryOutcome::Duplicate => {
                if self.db.mark_delivered(key, self.owner, finished_at).await? {
                    log_info!(
                        "check-in {key} delivered after {} failed attempt(s)",
                        record.attempt_count
                    );
                    report.delivered += 1;
                    self.emit(DeliveryEvent::Delivered {
                        idempotency_key: key,
                        attempts: record.attempt_count,
                    });
                } else {
                    self.note_stale(key, report);
                }
            }
            DeliveryOutcome::Transient(detail) => {
                let attempts = record.attempt_count.saturating_add(1);
                let delay = self.policy.backoff.delay(attempts);
                let next_attempt_at = self.policy.retry_at(finished_at, delay);
                let applied = self
                    .db
                    .mark_failed(
                        key,
                        self.owner,
                        Disposition::Retry {
                            next_eligible_at: next_attempt_at,
                            detail: detail.clone(),
                        },
                        finished_at,
                    )
                    .await?;
                if applied {
                    log_warn!(
                        "check-in {key} attempt {attempts} failed ({detail}); retrying in {}s",
                        delay.as_secs()
                    );
                    report.retried += 1;
                    self.emit(DeliveryEvent::Retrying {
                        idempotency_key: key,
                        attempts,
                        next_attempt_at,
                        detail,
                    });
                } else {
                    self.note_stale(key, report);
                }
            }
            DeliveryOutcome::Rejected(reason) => {
                let applied = self
                    .db
                    .mark_failed(
                        key,
                        self.owner,
                        Disposition::Terminal {
                            reason: reason.clone(),
                        },
                        finished_at,
                    )
                    .await?;
                if applied {
                    log_error!("check-in {key} rejected by server: {reason}");
                    report.failed += 1;
                    self.emit(DeliveryEvent::Failed {
                        idempotency_key: key,
                        reason,
                    });
                } else {
                    self.note_stale(key, report);
                }
            }
        }

        Ok(())
    }

    fn note_stale(&self, key: Uuid, report: &mut DrainReport) {
        log_warn!("discarding stale delivery result for check-in {key}");
        report.stale += 1;
    }

    fn emit(&self, event: DeliveryEvent) {
        // No subscribers is fine; outcomes are also persisted.
        let _ = self.events.send(event);
    }
}

/// Background loop: drains on every tick and whenever `wake` is notified
/// (connectivity came back, a new check-in was queued).
pub async fn delivery_loop<R: RemoteStore>(
    agent: Arc<DeliveryAgent<R>>,
    poll_interval: Duration,
    wake: Arc<Notify>,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {
                log_debug!("delivery loop woken");
            }
            _ = cancel_token.cancelled() => {
                log_info!("delivery loop shutting down");
                break;
            }
        }

        tokio::select! {
            result = agent.drain_once() => match result {
                Ok(report) if report.lease_held_elsewhere => {
                    log_debug!("outbox pass skipped, another session is delivering");
                }
                Ok(report) if !report.is_empty() => log_info!("outbox pass: {report:?}"),
                Ok(_) => {}
                Err(err) => log_error!("outbox pass failed: {err:?}"),
            },
            _ = cancel_token.cancelled() => {
                // A record claimed mid-attempt stays InFlight under our owner
                // id; the next lease holder returns it to Pending.
                log_info!("delivery loop cancelled mid-pass");
                break;
            }
        }
    }

    if let Err(err) = agent.release_lease().await {
        log_error!("failed to release delivery lease: {err:?}");
    }
}
