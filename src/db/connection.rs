use std::{
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

/// How long a write waits on another process (a second `fieldcheck` sharing
/// the data directory) before SQLite reports the database as busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type OutboxTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum WorkerCommand {
    Run(OutboxTask),
    Shutdown,
}

struct WorkerHandle {
    sender: mpsc::Sender<WorkerCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let mut guard = self
            .thread
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(WorkerCommand::Shutdown) {
                error!("Failed to send shutdown to outbox thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join outbox thread: {join_err:?}");
            }
        }
    }
}

/// Opens the outbox file with the durability settings every write relies on.
fn open_outbox(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path).context("failed to open SQLite database")?;

    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        error!("Failed to enable WAL mode: {err}");
    }
    // An acknowledged enqueue must survive a process kill.
    conn.pragma_update(None, "synchronous", "FULL")
        .context("failed to set synchronous=FULL")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;

    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

/// Handle to the outbox database.
///
/// A single worker thread owns the SQLite connection and runs submitted tasks
/// one at a time, so every state transition on a record is serialized without
/// holding any lock across a network await. A task that panics is reported
/// to its caller as an error; the worker keeps serving the next one.
#[derive(Clone)]
pub struct Database {
    worker: Arc<WorkerHandle>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let path_for_thread = db_path.clone();

        let thread = thread::Builder::new()
            .name("fieldcheck-db".into())
            .spawn(move || {
                let mut conn = match open_outbox(&path_for_thread) {
                    Ok(conn) => {
                        if ready_tx.send(Ok(())).is_err() {
                            return;
                        }
                        conn
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(command) = command_rx.recv() {
                    match command {
                        WorkerCommand::Run(task) => {
                            if panic::catch_unwind(AssertUnwindSafe(|| task(&mut conn))).is_err() {
                                error!("Outbox task panicked; its caller gets an error");
                            }
                        }
                        WorkerCommand::Shutdown => break,
                    }
                }

                info!("Outbox thread shutting down");
            })
            .context("failed to spawn outbox worker thread")?;

        ready_rx
            .recv()
            .context("outbox worker exited before signaling readiness")??;

        info!("Outbox database opened at {}", db_path.display());

        Ok(Self {
            worker: Arc::new(WorkerHandle {
                sender: command_tx,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = WorkerCommand::Run(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Outbox caller dropped before receiving result");
            }
        }));

        self.worker
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send task to outbox thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("outbox task ended without a result"))?
    }
}
