pub mod cli;
pub mod db;
pub mod delivery;
pub mod geo;
pub mod settings;
pub mod submission;
mod utils;

use clap::Parser;

pub use db::{CheckInRecord, Database, RecordState, SubmissionStatus};
pub use delivery::{DeliveryAgent, DeliveryController, DeliveryEvent, DeliveryPolicy, RemoteStore};
pub use geo::{evaluate, haversine_distance, AdmissionDecision, GateWatcher, GeoPoint, GeofenceTarget};
pub use submission::{CheckInError, CheckInRequest, SubmissionBuilder};

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    let default_level = if settings::debug_mode() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    log::debug!("fieldcheck starting up...");

    cli::run(cli::Cli::parse()).await
}
