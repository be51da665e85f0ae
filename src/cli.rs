//! Command-line front end for the check-in pipeline.
//!
//! `check-in` goes through the geofence gate and the outbox exactly like the
//! mobile screen would; `run` drains the outbox against the configured
//! endpoint until interrupted. A running `run` drains immediately on SIGUSR1,
//! which a network hook can send when connectivity returns.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::db::{CheckInRecord, Database, PhotoRef};
use crate::delivery::{
    DeliveryAgent, DeliveryController, DeliveryEvent, RemoteStore, RestRemote,
};
use crate::geo::{GeoPoint, IndeterminateReason, LocationReading};
use crate::settings::SettingsStore;
use crate::submission::{CheckInRequest, SubmissionBuilder};

const DB_FILE: &str = "fieldcheck.sqlite3";
const SETTINGS_FILE: &str = "settings.json";

/// Fieldcheck: geofenced attendance check-ins that survive going offline.
#[derive(Debug, Parser)]
#[command(name = "fieldcheck", version)]
pub struct Cli {
    /// Where the outbox database and settings live.
    /// Defaults to the platform data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check in at a unit. The record is queued locally and delivered later.
    CheckIn {
        /// Worker identity, as issued by the login service.
        #[arg(long)]
        subject: String,

        /// Unit code configured in settings (e.g. TTVH001).
        #[arg(long)]
        unit: String,

        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,

        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,

        /// Why no coordinates are available, when `--lat/--lon` are omitted.
        #[arg(long, value_enum, conflicts_with = "lat")]
        unavailable: Option<LocationProblem>,

        /// Reference to the already uploaded proof photo.
        #[arg(long)]
        photo: String,

        #[arg(long, default_value = "image/jpeg")]
        content_type: String,

        /// Try to deliver right away, waiting up to this many seconds for
        /// the first result. The record stays queued either way.
        #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "15")]
        send: Option<u64>,
    },

    /// Show where a check-in is: queued, sending or resolved.
    Status {
        /// Idempotency key printed by `check-in`.
        key: Uuid,
    },

    /// List check-ins still waiting in the outbox, oldest first.
    List,

    /// Show recently resolved check-ins, newest first.
    Outcomes {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Deliver queued check-ins to the configured endpoint.
    Run {
        /// Make a single pass over the outbox and exit.
        #[arg(long)]
        once: bool,
    },

    /// Expire check-ins older than the retention window without delivering.
    Purge,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LocationProblem {
    Denied,
    Unsupported,
    NoFix,
    SignalLost,
}

impl From<LocationProblem> for IndeterminateReason {
    fn from(problem: LocationProblem) -> Self {
        match problem {
            LocationProblem::Denied => IndeterminateReason::PermissionDenied,
            LocationProblem::Unsupported => IndeterminateReason::Unsupported,
            LocationProblem::NoFix => IndeterminateReason::NoFix,
            LocationProblem::SignalLost => IndeterminateReason::SignalLost,
        }
    }
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("fieldcheck"))
        .ok_or_else(|| anyhow!("could not determine the platform data directory; pass --data-dir"))
}

struct Workspace {
    db: Database,
    settings: SettingsStore,
}

impl Workspace {
    fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let db = Database::new(data_dir.join(DB_FILE))?;
        let settings = SettingsStore::new(data_dir.join(SETTINGS_FILE))?;
        Ok(Self { db, settings })
    }

    fn agent(&self) -> Result<DeliveryAgent<RestRemote>> {
        let api_key = self.settings.api_key();
        let remote = RestRemote::new(&self.settings.endpoint(), api_key.as_deref())
            .with_context(|| {
                format!(
                    "endpoint is not usable; edit {}",
                    self.settings.path().display()
                )
            })?;
        Ok(DeliveryAgent::new(
            self.db.clone(),
            Arc::new(remote),
            self.settings.delivery_policy(),
        ))
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let workspace = Workspace::open(cli.data_dir)?;

    match cli.command {
        Command::CheckIn {
            subject,
            unit,
            lat,
            lon,
            unavailable,
            photo,
            content_type,
            send,
        } => {
            let reading = match (lat, lon) {
                (Some(latitude), Some(longitude)) => LocationReading::Fix {
                    point: GeoPoint {
                        latitude,
                        longitude,
                    },
                },
                _ => LocationReading::Unavailable {
                    reason: unavailable
                        .map(IndeterminateReason::from)
                        .unwrap_or(IndeterminateReason::NoFix),
                },
            };
            let request = CheckInRequest {
                subject_id: subject,
                unit_code: unit,
                reading,
                photo: PhotoRef {
                    uri: photo,
                    content_type,
                },
                captured_at: Utc::now(),
            };
            match send {
                Some(wait_secs) => {
                    cmd_check_in_and_send(&workspace, request, Duration::from_secs(wait_secs))
                        .await
                }
                None => cmd_check_in(&workspace, request).await,
            }
        }
        Command::Status { key } => cmd_status(&workspace, key).await,
        Command::List => cmd_list(&workspace).await,
        Command::Outcomes { limit } => cmd_outcomes(&workspace, limit).await,
        Command::Run { once } => cmd_run(&workspace, once).await,
        Command::Purge => cmd_purge(&workspace).await,
    }
}

async fn cmd_check_in(workspace: &Workspace, request: CheckInRequest) -> Result<()> {
    let builder = SubmissionBuilder::new(workspace.db.clone(), workspace.settings.units());
    let record = builder.submit(request).await?;
    println!("{}", record.idempotency_key);
    eprintln!(
        "queued check-in for {} at {}; run `fieldcheck run` to deliver",
        record.subject_id, record.unit_code
    );
    Ok(())
}

async fn cmd_check_in_and_send(
    workspace: &Workspace,
    request: CheckInRequest,
    wait: Duration,
) -> Result<()> {
    let agent = Arc::new(workspace.agent()?);
    let builder = SubmissionBuilder::new(workspace.db.clone(), workspace.settings.units());
    let (record, event) = submit_and_deliver(
        builder,
        agent,
        request,
        workspace.settings.poll_interval(),
        wait,
    )
    .await?;

    println!("{}", record.idempotency_key);
    match event {
        Some(event) => print_event(&event),
        None => eprintln!(
            "no answer within {}s; check-in stays queued, run `fieldcheck run` to deliver",
            wait.as_secs()
        ),
    }
    Ok(())
}

/// Queues a check-in with the delivery loop running beside it. The builder
/// shares the loop's waker, so the enqueue itself starts the attempt. Returns
/// the first delivery event for the new record, if one arrives within `wait`.
async fn submit_and_deliver<R: RemoteStore>(
    builder: SubmissionBuilder,
    agent: Arc<DeliveryAgent<R>>,
    request: CheckInRequest,
    poll_interval: Duration,
    wait: Duration,
) -> Result<(CheckInRecord, Option<DeliveryEvent>)> {
    let mut events = agent.subscribe();
    let mut controller = DeliveryController::new();
    controller.start(agent, poll_interval).await?;
    let builder = builder.with_wake(controller.waker());

    let record = match builder.submit(request).await {
        Ok(record) => record,
        Err(err) => {
            controller.stop().await?;
            return Err(err.into());
        }
    };

    let key = record.idempotency_key;
    let event = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) if event.idempotency_key() == key => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    controller.stop().await?;
    Ok((record, event))
}

async fn cmd_status(workspace: &Workspace, key: Uuid) -> Result<()> {
    let status = workspace
        .db
        .submission_status(key)
        .await?
        .ok_or_else(|| anyhow!("no check-in with key {key} on this device"))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    eprintln!("{}", status.label());
    Ok(())
}

async fn cmd_list(workspace: &Workspace) -> Result<()> {
    let records = workspace.db.list_records().await?;
    if records.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    let now = Utc::now();
    for record in &records {
        println!("{}", format_record(record, now));
    }
    Ok(())
}

fn format_record(record: &CheckInRecord, now: chrono::DateTime<Utc>) -> String {
    let age_minutes = record.age(now).num_minutes();
    format!(
        "{}  {:<9} {} @ {}  attempts={} queued {}m ago, next {}",
        record.idempotency_key,
        record.state.as_str(),
        record.subject_id,
        record.unit_code,
        record.attempt_count,
        age_minutes,
        record.next_eligible_at.format("%Y-%m-%d %H:%M:%S")
    )
}

async fn cmd_outcomes(workspace: &Workspace, limit: u32) -> Result<()> {
    let outcomes = workspace.db.recent_outcomes(limit).await?;
    if outcomes.is_empty() {
        println!("No resolved check-ins yet.");
        return Ok(());
    }
    for outcome in &outcomes {
        println!(
            "{}  {:<9} {} @ {}  attempts={} resolved {}{}",
            outcome.idempotency_key,
            outcome.state.as_str(),
            outcome.subject_id,
            outcome.unit_code,
            outcome.attempt_count,
            outcome.resolved_at.format("%Y-%m-%d %H:%M:%S"),
            outcome
                .detail
                .as_deref()
                .map(|detail| format!("  ({detail})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_run(workspace: &Workspace, once: bool) -> Result<()> {
    let agent = Arc::new(workspace.agent()?);

    if once {
        let report = agent.drain_once().await?;
        agent.release_lease().await?;
        println!(
            "delivered={} retried={} failed={} expired={} stale={} recovered={}",
            report.delivered,
            report.retried,
            report.failed,
            report.expired,
            report.stale,
            report.recovered
        );
        if report.lease_held_elsewhere {
            bail!("another fieldcheck session is delivering from this data directory");
        }
        return Ok(());
    }

    let mut events = agent.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {missed} delivery events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut controller = DeliveryController::new();
    controller
        .start(agent, workspace.settings.poll_interval())
        .await?;

    let mut online = OnlineSignal::new()?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                break;
            }
            _ = online.recv() => {
                info!("Connectivity restored, draining now");
                controller.notify_online();
            }
        }
    }
    info!("Interrupted, stopping delivery");

    controller.stop().await?;
    reporter.abort();
    Ok(())
}

/// Connectivity notifications from the platform's network hook. On Unix the
/// hook sends SIGUSR1, e.g. from a NetworkManager dispatcher script.
struct OnlineSignal {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl OnlineSignal {
    fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            signal: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
                .context("failed to listen for SIGUSR1")?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if self.signal.recv().await.is_some() {
            return;
        }
        std::future::pending::<()>().await
    }
}

fn print_event(event: &DeliveryEvent) {
    match event {
        DeliveryEvent::Delivered {
            idempotency_key,
            attempts,
        } => println!("delivered {idempotency_key} (after {attempts} failed attempts)"),
        DeliveryEvent::Retrying {
            idempotency_key,
            attempts,
            next_attempt_at,
            detail,
        } => println!(
            "retrying {idempotency_key} at {} (attempt {attempts} failed: {detail})",
            next_attempt_at.format("%H:%M:%S")
        ),
        DeliveryEvent::Failed {
            idempotency_key,
            reason,
        } => println!("FAILED {idempotency_key}: {reason}; check in again"),
        DeliveryEvent::Expired {
            idempotency_key,
            attempts,
        } => println!("EXPIRED {idempotency_key} after {attempts} attempts; check-in was lost"),
    }
}

async fn cmd_purge(workspace: &Workspace) -> Result<()> {
    let retention = workspace.settings.delivery_policy().retention;
    let expired = workspace.db.purge_expired(Utc::now(), retention).await?;
    for record in &expired {
        println!(
            "expired {} ({} @ {}, {} attempts)",
            record.idempotency_key, record.subject_id, record.unit_code, record.attempt_count
        );
    }
    eprintln!("{} check-in(s) expired", expired.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    use crate::db::{RecordState, SubmissionStatus};
    use crate::delivery::remote::testing::MemoryRemote;
    use crate::submission::CheckInError;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_check_in_with_negative_coordinates() {
        let cli = Cli::try_parse_from([
            "fieldcheck",
            "--data-dir",
            "/tmp/fc",
            "check-in",
            "--subject",
            "emp-1",
            "--unit",
            "TTVH001",
            "--lat",
            "-33.86",
            "--lon",
            "151.21",
            "--photo",
            "https://photos.example/1.jpg",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/fc")));
        match cli.command {
            Command::CheckIn {
                lat,
                lon,
                content_type,
                ..
            } => {
                assert_eq!(lat, Some(-33.86));
                assert_eq!(lon, Some(151.21));
                assert_eq!(content_type, "image/jpeg");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn latitude_without_longitude_is_refused() {
        let result = Cli::try_parse_from([
            "fieldcheck",
            "check-in",
            "--subject",
            "emp-1",
            "--unit",
            "TTVH001",
            "--lat",
            "11.3",
            "--photo",
            "p.jpg",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn send_takes_an_optional_wait() {
        let parse = |extra: &[&str]| {
            let mut args = vec![
                "fieldcheck",
                "check-in",
                "--subject",
                "emp-1",
                "--unit",
                "TTVH001",
                "--unavailable",
                "no-fix",
                "--photo",
                "p.jpg",
            ];
            args.extend_from_slice(extra);
            match Cli::try_parse_from(args).unwrap().command {
                Command::CheckIn { send, .. } => send,
                other => panic!("unexpected command {other:?}"),
            }
        };
        assert_eq!(parse(&[]), None);
        assert_eq!(parse(&["--send"]), Some(15));
        assert_eq!(parse(&["--send", "3"]), Some(3));
    }

    /// Standing on the office seeded into fresh settings.
    fn office_request(subject: &str) -> CheckInRequest {
        CheckInRequest {
            subject_id: subject.into(),
            unit_code: "TTVH001".into(),
            reading: LocationReading::Fix {
                point: GeoPoint {
                    latitude: 11.3135,
                    longitude: 106.0981,
                },
            },
            photo: PhotoRef {
                uri: "p.jpg".into(),
                content_type: "image/jpeg".into(),
            },
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn check_in_then_list_from_a_fresh_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::open(Some(dir.path().to_path_buf())).unwrap();
        assert!(dir.path().join(SETTINGS_FILE).exists());

        cmd_check_in(&workspace, office_request("emp-1")).await.unwrap();

        let records = workspace.db.list_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(format_record(&records[0], Utc::now()).contains("emp-1 @ TTVH001"));
    }

    #[test]
    fn run_needs_a_configured_endpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::open(Some(dir.path().to_path_buf())).unwrap();
        assert!(workspace.agent().is_err());
    }

    #[tokio::test]
    async fn check_in_with_send_delivers_through_the_running_loop() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::open(Some(dir.path().to_path_buf())).unwrap();
        let remote = Arc::new(MemoryRemote::default());
        let agent = Arc::new(DeliveryAgent::new(
            workspace.db.clone(),
            remote.clone(),
            workspace.settings.delivery_policy(),
        ));
        let builder = SubmissionBuilder::new(workspace.db.clone(), workspace.settings.units());

        let (record, event) = submit_and_deliver(
            builder,
            agent,
            office_request("emp-1"),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let key = record.idempotency_key;
        assert_eq!(
            event,
            Some(DeliveryEvent::Delivered {
                idempotency_key: key,
                attempts: 0
            })
        );
        assert_eq!(remote.row_count(), 1);
        assert_eq!(
            workspace.db.submission_status(key).await.unwrap(),
            Some(SubmissionStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn check_in_with_send_still_gates_the_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::open(Some(dir.path().to_path_buf())).unwrap();
        let remote = Arc::new(MemoryRemote::default());
        let agent = Arc::new(DeliveryAgent::new(
            workspace.db.clone(),
            remote.clone(),
            workspace.settings.delivery_policy(),
        ));
        let builder = SubmissionBuilder::new(workspace.db.clone(), workspace.settings.units());

        let mut far_away = office_request("emp-1");
        far_away.reading = LocationReading::Fix {
            point: GeoPoint {
                latitude: 11.4,
                longitude: 106.0981,
            },
        };
        let err = submit_and_deliver(
            builder,
            agent,
            far_away,
            Duration::from_secs(3600),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CheckInError>(),
            Some(CheckInError::OutOfRange { .. })
        ));
        assert_eq!(remote.calls(), 0);
        assert!(workspace.db.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_once_refuses_while_another_session_delivers() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{ "endpoint": { "baseUrl": "http://127.0.0.1:9" } }"#,
        )
        .unwrap();
        let workspace = Workspace::open(Some(dir.path().to_path_buf())).unwrap();
        cmd_check_in(&workspace, office_request("emp-1")).await.unwrap();

        let daemon = Uuid::new_v4();
        assert!(workspace
            .db
            .acquire_lease(daemon, Utc::now(), chrono::Duration::minutes(5))
            .await
            .unwrap());

        let err = cmd_run(&workspace, true).await.unwrap_err();
        assert!(err.to_string().contains("another fieldcheck session"));

        let records = workspace.db.list_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt_count, 0);
        assert_eq!(records[0].state, RecordState::Pending);
    }
}
