use chrono::{DateTime, Utc};

/// Wall-clock source for the delivery agent. Every claim, retry schedule and
/// expiry check reads it at the moment it happens.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
