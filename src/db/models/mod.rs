pub mod checkin;
pub mod outcome;

pub use checkin::{CheckInRecord, PhotoRef, RecordState};
pub use outcome::{CheckInOutcome, SubmissionStatus};
