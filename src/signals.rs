//! Signal routing and the control event bus.
//!
//! Asynchronous triggers never touch supervisor state directly. Reload,
//! recovery and shutdown signals become [`ControlEvent`]s on a bounded
//! channel consumed by the single dispatcher loop in [`crate::init`].
//! `SIGCHLD` is the exception: it is handled here by reaping, because a
//! dispatcher busy waiting for processes to exit must still learn that
//! they did.

use crate::definition::Runlevel;
use crate::error::{Error, Result};
use crate::process::ProcessSupervisor;
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capacity of the control event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Requests handled by the dispatcher loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Re-read the service table
    Reload,
    /// Enter recovery mode
    Recovery,
    /// Switch to a runlevel
    ChangeRunlevel(Runlevel),
    /// Stop everything and power off
    Shutdown,
    /// The emergency shell returned
    ShellExited,
}

/// Create the bounded event channel.
pub fn event_channel() -> (mpsc::Sender<ControlEvent>, mpsc::Receiver<ControlEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Event a signal maps to, if any. `SIGCHLD` is handled by reaping.
pub fn route(sig: Signal) -> Option<ControlEvent> {
    match sig {
        Signal::SIGHUP => Some(ControlEvent::Reload),
        Signal::SIGUSR1 => Some(ControlEvent::Recovery),
        Signal::SIGTERM | Signal::SIGINT => Some(ControlEvent::Shutdown),
        _ => None,
    }
}

/// Listens for OS signals and turns them into events.
pub struct SignalRouter {
    supervisor: ProcessSupervisor,
    events: mpsc::Sender<ControlEvent>,
}

impl SignalRouter {
    pub fn new(supervisor: ProcessSupervisor, events: mpsc::Sender<ControlEvent>) -> Self {
        Self { supervisor, events }
    }

    /// Run until the event channel closes.
    pub async fn run(self) -> Result<()> {
        let mut sigchld = signal(SignalKind::child())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        info!("Signal router ready");

        // Children that exited before the handler was installed
        self.supervisor.reap().await;

        loop {
            let sig = tokio::select! {
                _ = sigchld.recv() => {
                    let reaped = self.supervisor.reap().await;
                    debug!(count = reaped, "Handled SIGCHLD");
                    continue;
                }
                _ = sighup.recv() => Signal::SIGHUP,
                _ = sigusr1.recv() => Signal::SIGUSR1,
                _ = sigterm.recv() => Signal::SIGTERM,
                _ = sigint.recv() => Signal::SIGINT,
            };

            if let Some(event) = route(sig) {
                info!(signal = ?sig, event = ?event, "Received signal");
                self.events
                    .send(event)
                    .await
                    .map_err(|_| Error::EventChannelClosed)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_mapping() {
        assert_eq!(route(Signal::SIGHUP), Some(ControlEvent::Reload));
        assert_eq!(route(Signal::SIGUSR1), Some(ControlEvent::Recovery));
        assert_eq!(route(Signal::SIGTERM), Some(ControlEvent::Shutdown));
        assert_eq!(route(Signal::SIGINT), Some(ControlEvent::Shutdown));
        assert_eq!(route(Signal::SIGCHLD), None);
        assert_eq!(route(Signal::SIGUSR2), None);
    }
}
