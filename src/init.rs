//! Init process: wires the components together and runs the dispatcher.

use crate::config::SupervisorConfig;
use crate::control::ControlServer;
use crate::error::{Error, Result};
use crate::host::{Host, LinuxHost};
use crate::isolation::IsolationProvisioner;
use crate::loaders::InittabLoader;
use crate::process::{OsSpawner, ProcessSupervisor};
use crate::runlevel::RunlevelController;
use crate::signals::{event_channel, ControlEvent, SignalRouter};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// The init system.
pub struct Init {
    config: SupervisorConfig,
    controller: Arc<RunlevelController>,
    host: Arc<dyn Host>,
    events_tx: mpsc::Sender<ControlEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ControlEvent>>>,
}

impl Init {
    /// Create the init system for the real host.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        // Check if we're PID 1
        let pid = std::process::id();
        if config.require_pid1 && pid != 1 {
            return Err(Error::NotPid1(pid));
        }

        let spawner = Arc::new(OsSpawner::new(config.shell.clone()));
        let provisioner = IsolationProvisioner::new(config.isolation.clone());
        let supervisor =
            ProcessSupervisor::new(spawner, provisioner).with_grace(config.stop_grace());
        let host = Arc::new(LinuxHost::new(&config));

        Ok(Self::from_parts(config, supervisor, host))
    }

    /// Assemble from an existing supervisor and host.
    pub fn from_parts(
        config: SupervisorConfig,
        supervisor: ProcessSupervisor,
        host: Arc<dyn Host>,
    ) -> Self {
        let controller = Arc::new(RunlevelController::new(
            supervisor,
            Arc::clone(&host),
            Arc::new(InittabLoader),
            config.inittab.clone(),
            config.default_runlevel.clone(),
            config.recovery_runlevel.clone(),
        ));
        let (events_tx, events_rx) = event_channel();

        Self {
            config,
            controller,
            host,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn controller(&self) -> Arc<RunlevelController> {
        Arc::clone(&self.controller)
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        self.controller.supervisor()
    }

    /// Sender for posting events to the dispatcher.
    pub fn events(&self) -> mpsc::Sender<ControlEvent> {
        self.events_tx.clone()
    }

    /// Boot and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!("tabinit starting");

        if self.config.mount_filesystems {
            self.host.mount_virtual_filesystems();
        }
        if self.config.require_pid1 {
            self.host.acquire_terminal();
        }

        self.controller.load_table().await;

        let router = SignalRouter::new(self.supervisor().clone(), self.events());
        tokio::spawn(async move {
            if let Err(e) = router.run().await {
                error!(error = %e, "Signal router stopped");
            }
        });

        let server = ControlServer::new(&self.config.control_fifo, self.events());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Control channel stopped");
            }
        });

        self.boot().await;
        self.event_loop().await
    }

    /// Enter the initial runlevel, or recovery if the command line asks.
    pub async fn boot(&self) {
        let cmdline = self.host.kernel_cmdline();
        if self
            .controller
            .boot(&cmdline, &self.config.recovery_marker)
            .await
        {
            self.spawn_shell();
        }
    }

    /// Consume events until shutdown completes.
    pub async fn event_loop(&self) -> Result<()> {
        let mut events = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(Error::EventChannelClosed)?;

        info!("Init system ready, entering event loop");

        while let Some(event) = events.recv().await {
            if self.handle_event(event).await {
                break;
            }
        }

        Ok(())
    }

    /// Apply one event. Returns true once the system has shut down.
    pub async fn handle_event(&self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Reload => self.controller.reload().await,
            ControlEvent::Recovery => {
                if self.controller.is_recovery().await {
                    warn!("Already in recovery mode");
                } else {
                    self.controller.enter_recovery().await;
                    self.spawn_shell();
                }
            }
            ControlEvent::ChangeRunlevel(level) => {
                if self.controller.is_recovery().await {
                    warn!(runlevel = %level, "Ignoring runlevel change in recovery mode");
                } else {
                    self.controller.change_runlevel(level).await;
                }
            }
            ControlEvent::Shutdown => {
                self.controller.shutdown().await;
                return true;
            }
            ControlEvent::ShellExited => self.controller.leave_recovery().await,
        }
        false
    }

    /// Run the emergency shell, posting [`ControlEvent::ShellExited`] when it
    /// returns.
    fn spawn_shell(&self) {
        let host = Arc::clone(&self.host);
        let supervisor = self.supervisor().clone();
        let events = self.events();

        tokio::spawn(async move {
            match host.run_shell(&supervisor).await {
                Ok(status) => info!(code = ?status.code, signal = ?status.signal, "Emergency shell exited"),
                Err(e) => error!(error = %e, "Emergency shell failed"),
            }
            if events.send(ControlEvent::ShellExited).await.is_err() {
                warn!("Dispatcher gone, shell exit not delivered");
            }
        });
    }
}
