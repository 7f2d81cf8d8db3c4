//! Runlevel controller.
//!
//! A thin state machine over the supervisor. Given a target runlevel it
//! works out which definitions should be live and asks the supervisor to
//! stop and start the difference, running the level's rc scripts in
//! between. Transitions are serialized: the state lock is held for the
//! whole transition.

use crate::definition::{Action, Runlevel};
use crate::host::Host;
use crate::loaders::{ServiceTable, TableLoader};
use crate::process::{ProcessSupervisor, StartOutcome};
use nix::sys::signal::Signal;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Whether the kernel command line asks for recovery.
pub fn recovery_requested(cmdline: &str, marker: &str) -> bool {
    !marker.is_empty() && cmdline.contains(marker)
}

#[derive(Debug, Default)]
struct ControllerState {
    current: Option<Runlevel>,
    recovery: bool,
}

/// Drives transitions between runlevels.
pub struct RunlevelController {
    supervisor: ProcessSupervisor,
    host: Arc<dyn Host>,
    loader: Arc<dyn TableLoader>,
    table_path: PathBuf,
    table: RwLock<ServiceTable>,
    state: Mutex<ControllerState>,
    default_runlevel: Runlevel,
    recovery_runlevel: Runlevel,
}

impl RunlevelController {
    pub fn new(
        supervisor: ProcessSupervisor,
        host: Arc<dyn Host>,
        loader: Arc<dyn TableLoader>,
        table_path: impl Into<PathBuf>,
        default_runlevel: Runlevel,
        recovery_runlevel: Runlevel,
    ) -> Self {
        Self {
            supervisor,
            host,
            loader,
            table_path: table_path.into(),
            table: RwLock::new(ServiceTable::default()),
            state: Mutex::new(ControllerState::default()),
            default_runlevel,
            recovery_runlevel,
        }
    }

    /// Replace the loaded table.
    pub async fn set_table(&self, table: ServiceTable) {
        *self.table.write().await = table;
    }

    /// Load the service table at boot. A missing table yields an empty one.
    pub async fn load_table(&self) -> usize {
        match self.loader.load(&self.table_path) {
            Ok(table) => {
                let count = table.len();
                info!(path = %self.table_path.display(), definitions = count, loader = self.loader.name(), "Loaded service table");
                self.set_table(table).await;
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to load service table, starting with none");
                self.set_table(ServiceTable::default()).await;
                0
            }
        }
    }

    /// Re-read the service table, keeping the old one if that fails.
    ///
    /// Running processes are reconciled on the next transition.
    pub async fn reload(&self) {
        info!(path = %self.table_path.display(), "Reloading service table");
        match self.loader.load(&self.table_path) {
            Ok(table) => {
                info!(definitions = table.len(), "Service table reloaded");
                self.set_table(table).await;
            }
            Err(e) => warn!(error = %e, "Reload failed, keeping previous table"),
        }
    }

    /// Runlevel the table's `initdefault` names, or the configured default.
    pub async fn default_runlevel(&self) -> Runlevel {
        self.table
            .read()
            .await
            .default_runlevel
            .clone()
            .unwrap_or_else(|| self.default_runlevel.clone())
    }

    /// Current runlevel; `None` before boot and in recovery entered by signal.
    pub async fn current(&self) -> Option<Runlevel> {
        self.state.lock().await.current.clone()
    }

    pub async fn is_recovery(&self) -> bool {
        self.state.lock().await.recovery
    }

    /// Enter the initial state. Returns true if that state is recovery.
    pub async fn boot(&self, cmdline: &str, marker: &str) -> bool {
        if recovery_requested(cmdline, marker) {
            info!(marker = marker, "Recovery requested on kernel command line");
            let mut state = self.state.lock().await;
            state.recovery = true;
            self.supervisor.set_recovery(true);
            let level = self.recovery_runlevel.clone();
            self.transition(&mut state, level).await;
            true
        } else {
            let level = self.default_runlevel().await;
            self.change_runlevel(level).await;
            false
        }
    }

    /// Stop what `level` does not want, run its rc scripts, start what it
    /// wants.
    pub async fn change_runlevel(&self, level: Runlevel) {
        let mut state = self.state.lock().await;
        self.transition(&mut state, level).await;
    }

    async fn transition(&self, state: &mut ControllerState, level: Runlevel) {
        let rerun_completed = state.current.as_ref() != Some(&level);
        info!(
            from = %state.current.as_ref().map_or("none", Runlevel::as_str),
            to = %level,
            "Changing runlevel"
        );

        let wanted = self.table.read().await.wanted(&level);
        let ids: HashSet<String> = wanted.iter().map(|def| def.id.clone()).collect();

        let stopped = self.supervisor.retain(&ids).await;
        if !stopped.is_empty() {
            info!(stopped = ?stopped, "Stopped processes not in runlevel");
        }

        self.host
            .run_runlevel_scripts(&level, &self.supervisor)
            .await;

        for def in &wanted {
            match self.supervisor.ensure_started(def, rerun_completed).await {
                Ok(StartOutcome::Started(pid)) if def.action == Action::Wait => {
                    info!(id = %def.id, pid = pid, "Waiting for process to finish");
                    self.supervisor.wait_exit(&def.id).await;
                }
                Ok(outcome) => debug!(id = %def.id, outcome = ?outcome, "Reconciled"),
                // Spawn failures are logged by the supervisor
                Err(e) => debug!(id = %def.id, error = %e, "Start failed"),
            }
        }

        state.current = Some(level);
    }

    /// Suspend respawn and stop everything.
    pub async fn enter_recovery(&self) {
        let mut state = self.state.lock().await;
        info!("Entering recovery mode");
        state.recovery = true;
        self.supervisor.set_recovery(true);
        self.supervisor.stop_all(Signal::SIGTERM).await;
        // Force the next transition to start everything again
        state.current = None;
    }

    /// Resume respawn and go to the default runlevel.
    pub async fn leave_recovery(&self) {
        let level = self.default_runlevel().await;
        let mut state = self.state.lock().await;
        info!(runlevel = %level, "Leaving recovery mode");
        state.recovery = false;
        self.supervisor.set_recovery(false);
        state.current = None;
        self.transition(&mut state, level).await;
    }

    /// Go to runlevel 0, stop everything left and power off.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        info!("Shutting down");
        self.transition(&mut state, Runlevel::halt()).await;
        self.supervisor.stop_all(Signal::SIGTERM).await;

        if let Err(e) = self.host.power_off().await {
            error!(error = %e, "Power off failed");
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}
