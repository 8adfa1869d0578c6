use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Installed,
    Pending,
}

/// Tells the scheduler whether the host application finished installing.
/// No task runs before the gate reports `Installed`.
#[async_trait]
pub trait InstallGate: Send + Sync {
    async fn check(&self) -> Result<InstallState>;
}

/// Shutdown was requested while waiting for installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Cancelled while waiting for installation")]
pub struct Cancelled;

/// Gate that is always open.
pub struct AlwaysInstalled;

#[async_trait]
impl InstallGate for AlwaysInstalled {
    async fn check(&self) -> Result<InstallState> {
        Ok(InstallState::Installed)
    }
}

/// Writer side of a [`SignalGate`], held by whatever performs installation.
#[derive(Clone)]
pub struct InstallSignal {
    tx: watch::Sender<bool>,
}

impl InstallSignal {
    pub fn mark_installed(&self) {
        self.tx.send_replace(true);
    }
}

/// Gate flipped from outside the scheduler through an [`InstallSignal`].
pub struct SignalGate {
    rx: watch::Receiver<bool>,
}

#[async_trait]
impl InstallGate for SignalGate {
    async fn check(&self) -> Result<InstallState> {
        let installed = *self.rx.borrow();
        if installed {
            Ok(InstallState::Installed)
        } else {
            Ok(InstallState::Pending)
        }
    }
}

pub fn install_signal() -> (InstallSignal, SignalGate) {
    let (tx, rx) = watch::channel(false);
    (InstallSignal { tx }, SignalGate { rx })
}

/// Poll `gate` until it reports `Installed`.
///
/// A pending installation is retried quietly. A failing check is logged and
/// retried as well. Returns `Err(Cancelled)` as soon as `token` fires.
pub async fn wait_installed(
    gate: &dyn InstallGate,
    token: &CancellationToken,
    poll_interval: Duration,
) -> Result<(), Cancelled> {
    let mut announced = false;
    loop {
        if token.is_cancelled() {
            return Err(Cancelled);
        }

        match gate.check().await {
            Ok(InstallState::Installed) => return Ok(()),
            Ok(InstallState::Pending) => {
                if !announced {
                    info!("Waiting for installation to complete before running tasks");
                    announced = true;
                }
                debug!("Installation still pending");
            }
            Err(e) => warn!("Failed to check installation state: {:#}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = token.cancelled() => return Err(Cancelled),
        }
    }
}
