use std::io;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Process-wide stop request, triggered by SIGINT/SIGTERM or programmatically.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Triggers this signal on the first SIGINT or SIGTERM. The listener exits
    /// without triggering if the signal handlers cannot be installed.
    pub fn listen_for_os_signals(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                received = wait_for_os_signal() => match received {
                    Ok(name) => {
                        info!(signal = name, "Received shutdown signal, stopping");
                        token.cancel();
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to listen for shutdown signals");
                    }
                },
            }
        })
    }
}

async fn wait_for_os_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|()| "SIGINT")
    }
}
