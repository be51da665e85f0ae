pub mod lease;
pub mod outbox;
pub mod outcomes;

pub use outbox::{Disposition, EnqueueOutcome};
