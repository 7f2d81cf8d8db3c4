//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabinit::error::{Error, Result};
use tabinit::isolation::IsolationPlan;
use tabinit::{
    ExitStatus, Host, IsolationProvisioner, IsolationSettings, ProcessDefinition,
    ProcessSupervisor, Runlevel, Spawner,
};
use tokio::sync::mpsc;

/// Grace interval used by test supervisors.
pub const TEST_GRACE: Duration = Duration::from_millis(50);

/// Spawner that records launches and signals instead of touching the OS.
///
/// When built with [`FakeSpawner::dying`], every termination or kill signal
/// makes the target "exit": its status is forwarded on a channel so a task
/// can feed it back to the supervisor, as the reaper would.
pub struct FakeSpawner {
    next_pid: AtomicU32,
    spawned: Mutex<Vec<(String, u32)>>,
    signals: Mutex<Vec<(u32, Signal)>>,
    failing: Mutex<HashSet<String>>,
    exits: Option<mpsc::UnboundedSender<ExitStatus>>,
}

impl FakeSpawner {
    /// Processes ignore signals.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Processes die on the first signal.
    pub fn dying() -> (Arc<Self>, mpsc::UnboundedReceiver<ExitStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::build(Some(tx))), rx)
    }

    fn build(exits: Option<mpsc::UnboundedSender<ExitStatus>>) -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            spawned: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            exits,
        }
    }

    /// Make every spawn of `id` fail.
    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    /// Identifiers in launch order.
    pub fn spawned(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn spawn_count(&self, id: &str) -> usize {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .filter(|(spawned, _)| spawned == id)
            .count()
    }

    /// Most recent pid handed out for `id`.
    pub fn pid_of(&self, id: &str) -> Option<u32> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(spawned, _)| spawned == id)
            .map(|(_, pid)| *pid)
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().unwrap().clone()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, def: &ProcessDefinition, _plan: &IsolationPlan) -> Result<u32> {
        if self.failing.lock().unwrap().contains(&def.id) {
            return Err(Error::SpawnFailed {
                id: def.id.clone(),
                reason: "No such file or directory".to_string(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawned.lock().unwrap().push((def.id.clone(), pid));
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        self.signals.lock().unwrap().push((pid, signal));
        if let Some(exits) = &self.exits {
            let _ = exits.send(ExitStatus::signaled(pid, signal as i32));
        }
        Ok(())
    }
}

/// Supervisor over `spawner` with isolation disabled and a short grace.
pub fn supervisor(spawner: Arc<FakeSpawner>) -> ProcessSupervisor {
    ProcessSupervisor::new(
        spawner,
        IsolationProvisioner::new(IsolationSettings::disabled()),
    )
    .with_grace(TEST_GRACE)
}

/// Deliver forwarded exits to `supervisor` until the spawner is dropped.
pub fn forward_exits(
    supervisor: ProcessSupervisor,
    mut exits: mpsc::UnboundedReceiver<ExitStatus>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(status) = exits.recv().await {
            supervisor.handle_reaped(status).await;
        }
    })
}

/// Simulate the process behind `id` exiting on its own.
pub async fn exit(supervisor: &ProcessSupervisor, spawner: &FakeSpawner, id: &str, code: i32) {
    let pid = spawner.pid_of(id).expect("process was never spawned");
    supervisor.handle_reaped(ExitStatus::exited(pid, code)).await;
}

/// Host that records calls.
pub struct FakeHost {
    supervisor: ProcessSupervisor,
    cmdline: String,
    /// Running set observed when power off was requested
    pub running_at_power_off: Mutex<Option<Vec<String>>>,
    pub shells: AtomicU32,
    /// rc script runs and power off in call order, each with the running set
    /// at that moment
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeHost {
    pub fn new(supervisor: ProcessSupervisor, cmdline: &str) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            cmdline: cmdline.to_string(),
            running_at_power_off: Mutex::new(None),
            shells: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn powered_off(&self) -> Option<Vec<String>> {
        self.running_at_power_off.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Just the call names, e.g. `["rc2", "rc0", "power-off"]`.
    pub fn call_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|(name, _)| name).collect()
    }
}

#[async_trait]
impl Host for FakeHost {
    fn mount_virtual_filesystems(&self) {}

    fn acquire_terminal(&self) {}

    fn kernel_cmdline(&self) -> String {
        self.cmdline.clone()
    }

    async fn run_shell(&self, _supervisor: &ProcessSupervisor) -> Result<ExitStatus> {
        self.shells.fetch_add(1, Ordering::SeqCst);
        Ok(ExitStatus::exited(1, 0))
    }

    async fn run_runlevel_scripts(&self, level: &Runlevel, supervisor: &ProcessSupervisor) {
        let running = supervisor.running().await;
        self.calls
            .lock()
            .unwrap()
            .push((format!("rc{}", level), running));
    }

    async fn power_off(&self) -> Result<()> {
        let running = self.supervisor.running().await;
        self.calls
            .lock()
            .unwrap()
            .push(("power-off".to_string(), running.clone()));
        *self.running_at_power_off.lock().unwrap() = Some(running);
        Ok(())
    }
}
