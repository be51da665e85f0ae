use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::agent::{delivery_loop, DeliveryAgent};
use super::remote::RemoteStore;

pub struct DeliveryController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    wake: Arc<Notify>,
}

impl Default for DeliveryController {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Handle for whoever learns about connectivity or new records first
    /// (the submission builder, a network monitor).
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Spawns the delivery loop. Claims left by a dead session are recovered
    /// by the loop's first pass, once it holds the delivery lease.
    pub async fn start<R: RemoteStore>(
        &mut self,
        agent: Arc<DeliveryAgent<R>>,
        poll_interval: Duration,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("delivery already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(delivery_loop(
            agent,
            poll_interval,
            self.wake.clone(),
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        info!("Delivery started, polling every {}s", poll_interval.as_secs());
        Ok(())
    }

    /// Connectivity came back: drain now instead of waiting for the next tick.
    pub fn notify_online(&self) {
        self.wake.notify_one();
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("delivery loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}
