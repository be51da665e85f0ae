use log::info;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::fence::{evaluate, AdmissionDecision, GeofenceTarget, IndeterminateReason, LocationReading};

/// Re-evaluates the geofence for every location reading and publishes the
/// latest decision. Consumers only ever see the newest verdict.
pub struct GateWatcher {
    decisions: watch::Receiver<AdmissionDecision>,
    handle: JoinHandle<()>,
}

impl GateWatcher {
    pub fn spawn(
        target: GeofenceTarget,
        mut readings: mpsc::Receiver<LocationReading>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(AdmissionDecision::Indeterminate {
            reason: IndeterminateReason::NoFix,
        });

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    reading = readings.recv() => {
                        let Some(reading) = reading else {
                            break;
                        };
                        let decision = evaluate(&reading, &target);
                        // Receivers may all be gone; the gate keeps running for new subscribers.
                        tx.send_replace(decision);
                    }
                    _ = cancel_token.cancelled() => break,
                }
            }
            info!("Gate watcher stopped");
        });

        Self {
            decisions: rx,
            handle,
        }
    }

    pub fn latest(&self) -> AdmissionDecision {
        *self.decisions.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdmissionDecision> {
        self.decisions.clone()
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
