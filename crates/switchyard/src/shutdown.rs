//! Signal-triggered, bounded shutdown.

use std::io;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use thiserror::Error;

use crate::error::HubError;
use crate::hub::Hub;

const SHUTDOWN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::shutdown");

/// Abstraction over shutdown notification mechanisms.
pub trait ShutdownSignal: Send + Sync {
    /// Blocks until shutdown should proceed.
    ///
    /// Returns `true` when a shutdown was requested and `false` when the
    /// listener was released without one.
    ///
    /// # Errors
    ///
    /// Fails when the underlying listener breaks.
    fn wait(&self) -> Result<bool, ShutdownError>;

    /// Wakes a pending [`ShutdownSignal::wait`] without requesting shutdown.
    fn release(&self);
}

/// Errors reported by shutdown signal listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The shutdown bridge thread could not be spawned.
    #[error("failed to spawn shutdown bridge: {source}")]
    Bridge {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The shutdown bridge thread panicked.
    #[error("shutdown bridge panicked")]
    BridgePanicked,
}

/// Shutdown listener for SIGHUP, SIGINT, SIGTERM and SIGQUIT.
pub struct SystemShutdownSignal {
    signals: Mutex<Signals>,
    handle: Handle,
}

impl SystemShutdownSignal {
    /// Installs the signal handlers.
    ///
    /// Signals arriving before [`ShutdownSignal::wait`] runs are kept.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Install`] when registration fails.
    pub fn install() -> Result<Self, ShutdownError> {
        let signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
            .map_err(|source| ShutdownError::Install { source })?;
        let handle = signals.handle();
        Ok(Self {
            signals: Mutex::new(signals),
            handle,
        })
    }
}

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self) -> Result<bool, ShutdownError> {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(signals.forever().next().is_some_and(|signal| {
            tracing::info!(target: SHUTDOWN_TARGET, signal, "shutdown signal received");
            true
        }))
    }

    fn release(&self) {
        self.handle.close();
    }
}

impl std::fmt::Debug for SystemShutdownSignal {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SystemShutdownSignal")
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Starts the hub with a bridge from OS signals to Close.
    ///
    /// # Errors
    ///
    /// See [`Hub::start_with_shutdown`].
    pub fn start_with_signal(&self) -> Result<(), HubError> {
        let signal = SystemShutdownSignal::install()?;
        self.start_with_shutdown(Arc::new(signal))
    }

    /// Starts the hub and closes it when `signal` fires.
    ///
    /// Close runs on a helper thread; if it has not finished within the
    /// shutdown grace period the expiry action runs (by default the process
    /// exits with status 1). Once Start returns the hub is closed, and the
    /// listeners are told the process is about to exit.
    ///
    /// # Errors
    ///
    /// Returns the Start failure if any, otherwise the Close failure.
    pub fn start_with_shutdown(&self, signal: Arc<dyn ShutdownSignal>) -> Result<(), HubError> {
        let mut bridge = None;
        let started = self.start_then(|| {
            bridge = Some(spawn_bridge(self.clone(), Arc::clone(&signal)));
        });
        signal.release();

        let bridged = match bridge {
            Some(Ok(handle)) => handle
                .join()
                .unwrap_or(Err(HubError::Shutdown(ShutdownError::BridgePanicked))),
            Some(Err(error)) => Err(error),
            None => Ok(()),
        };
        let closed = self.close();

        let result = started.and(bridged).and(closed);
        self.notify_exit(result.as_ref().err());
        result
    }
}

fn spawn_bridge(
    hub: Hub,
    signal: Arc<dyn ShutdownSignal>,
) -> Result<thread::JoinHandle<Result<(), HubError>>, HubError> {
    thread::Builder::new()
        .name("shutdown-bridge".to_owned())
        .spawn(move || {
            if !signal.wait()? {
                return Ok(());
            }
            close_within_grace(&hub)
        })
        .map_err(|source| ShutdownError::Bridge { source }.into())
}

fn close_within_grace(hub: &Hub) -> Result<(), HubError> {
    let grace = hub.shutdown_timeout();
    let (sender, receiver) = mpsc::channel();
    let closer = hub.clone();
    thread::Builder::new()
        .name("shutdown-close".to_owned())
        .spawn(move || {
            if sender.send(closer.close()).is_err() {
                tracing::debug!(target: SHUTDOWN_TARGET, "close finished after the grace period");
            }
        })
        .map_err(|source| ShutdownError::Bridge { source })?;

    match receiver.recv_timeout(grace) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::error!(
                target: SHUTDOWN_TARGET,
                timeout_ms = grace.as_millis(),
                "providers did not close within the grace period"
            );
            (hub.shared.expiry)();
            Ok(())
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(HubError::Shutdown(ShutdownError::BridgePanicked))
        }
    }
}
