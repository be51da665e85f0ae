mod connection;
pub mod helpers;
mod migrations;
pub mod models;
pub mod repositories;

pub use connection::Database;
pub use models::{CheckInOutcome, CheckInRecord, PhotoRef, RecordState, SubmissionStatus};
pub use repositories::{Disposition, EnqueueOutcome};
