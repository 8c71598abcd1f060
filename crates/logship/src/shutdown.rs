// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Why the pipeline was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Stopped through [`ShutdownCoordinator::trigger`].
    Requested,
    /// SIGINT or SIGTERM.
    Signal,
    /// The signal handler could not be installed.
    SignalError,
}

/// One broadcast stop signal shared by every loop of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the broadcast token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled with this coordinator that can also be cancelled on its own.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// Waits for SIGINT, SIGTERM or an explicit trigger, then triggers.
    pub async fn wait_for_signal(&self) -> ShutdownReason {
        let reason = tokio::select! {
            () = self.token.cancelled() => ShutdownReason::Requested,
            result = terminate_signal() => match result {
                Ok(()) => {
                    info!("Received termination signal, shutting down");
                    ShutdownReason::Signal
                }
                Err(e) => {
                    error!("Failed to listen for termination signals: {}", e);
                    ShutdownReason::SignalError
                }
            },
        };
        self.trigger();
        reason
    }
}

#[cfg(unix)]
async fn terminate_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn terminate_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
