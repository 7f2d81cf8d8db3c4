//! Process supervision.
//!
//! [`ProcessSupervisor`] owns the process table: one [`RuntimeProcess`] per
//! definition identifier, behind a single lock. Every mutation (start, exit,
//! stop, enumeration) goes through supervisor methods that hold that lock for
//! the whole read-then-mutate sequence.
//!
//! Exit notifications arrive in aggregate: on `SIGCHLD` the signal router
//! calls [`ProcessSupervisor::reap`], which drains `waitpid(-1)` and maps
//! each pid back to its identifier.

use crate::definition::ProcessDefinition;
use crate::error::{Error, Result};
use crate::isolation::{IsolationPlan, IsolationProvisioner};
use crate::policy::{ImmediateRespawn, Respawn, RespawnPolicy};
use chrono::{DateTime, Utc};
use nix::sched::CloneFlags;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// How long to wait for processes to disappear after the kill signal.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Exit status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process ID
    pub pid: u32,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(pid: u32, code: i32) -> Self {
        Self {
            pid,
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(pid: u32, signal: i32) -> Self {
        Self {
            pid,
            code: None,
            signal: Some(signal),
        }
    }

    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Last known state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Spawned and not yet reaped
    Running,
    /// Signaled by a stop request; will not be respawned
    Stopping,
    /// Exited, respawn scheduled after a delay
    PendingRestart,
    /// Exited and not restarted
    Exited,
    /// Could not be spawned
    Failed,
}

impl ProcessStatus {
    /// Whether an instance is current for this identifier.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ProcessStatus::Running | ProcessStatus::Stopping | ProcessStatus::PendingRestart
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Stopping => write!(f, "stopping"),
            ProcessStatus::PendingRestart => write!(f, "pending-restart"),
            ProcessStatus::Exited => write!(f, "exited"),
            ProcessStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The most recent instance of a definition.
#[derive(Debug, Clone)]
pub struct RuntimeProcess {
    /// Definition identifier
    pub id: String,
    /// Definition as it was when launched
    pub definition: ProcessDefinition,
    /// OS process ID while running
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    /// Cgroups the process was attached to
    pub cgroups: Vec<PathBuf>,
    /// Namespace flags requested at launch
    pub namespaces: CloneFlags,
    /// Bumped on every launch, stale notifications carry an old value
    pub generation: u64,
    /// Respawns performed since the last explicit start
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitStatus>,
    /// Spawn error, if the last launch failed
    pub failure: Option<String>,
}

/// Launches and signals OS processes on behalf of the supervisor.
pub trait Spawner: Send + Sync {
    /// Start `def` with the given isolation and return its pid.
    fn spawn(&self, def: &ProcessDefinition, plan: &IsolationPlan) -> Result<u32>;

    /// Deliver `signal` to the process (group) `pid`.
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

/// Spawner that runs commands through a shell.
#[derive(Debug, Clone)]
pub struct OsSpawner {
    shell: PathBuf,
}

impl OsSpawner {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for OsSpawner {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

impl Spawner for OsSpawner {
    fn spawn(&self, def: &ProcessDefinition, plan: &IsolationPlan) -> Result<u32> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&def.command);
        cmd.env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let namespaces = plan.namespaces;
        if !namespaces.is_empty() {
            debug!(id = %def.id, flags = ?namespaces, "Requesting namespaces");
        }

        // Runs in the child between fork and exec. A refused unshare leaves
        // the process in the parent's namespaces.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(io_error)?;
                if namespaces.is_empty() {
                    return Ok(());
                }
                if nix::sched::unshare(namespaces).is_ok()
                    && namespaces.contains(CloneFlags::CLONE_NEWPID)
                {
                    enter_pid_namespace()?;
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            id: def.id.clone(),
            reason: e.to_string(),
        })?;

        // The child handle is dropped here; the reaper collects the status.
        Ok(child.id())
    }

    fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        let raw = i32::try_from(pid).map_err(|_| Error::UnknownProcess(pid.to_string()))?;

        // Each process leads its own session, so signal the whole group first
        match signal::kill(Pid::from_raw(-raw), sig) {
            Ok(()) => Ok(()),
            Err(nix::Error::ESRCH) => Ok(signal::kill(Pid::from_raw(raw), sig)?),
            Err(e) => Err(e.into()),
        }
    }
}

fn io_error(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Fork once more so the command runs as PID 1 of the namespace created by
/// `unshare(CLONE_NEWPID)`, which only applies to children of the caller.
///
/// Only call between fork and exec. The returning child goes on to exec.
/// The other side keeps the tracked pid in the parent namespace: it ignores
/// termination signals, waits for the command and exits with its status.
/// Stopping such a process therefore takes the kill signal unless the
/// command handles the termination signal itself.
unsafe fn enter_pid_namespace() -> std::io::Result<()> {
    match nix::unistd::fork().map_err(io_error)? {
        ForkResult::Child => Ok(()),
        ForkResult::Parent { child } => {
            for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
                let _ = signal::signal(sig, SigHandler::SigIgn);
            }
            // Release the exec status pipe so the spawning side returns
            close_inherited_fds();

            let code = loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => break code,
                    Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
                    Ok(_) | Err(nix::Error::EINTR) => continue,
                    Err(_) => break 1,
                }
            };
            libc::_exit(code)
        }
    }
}

fn close_inherited_fds() {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max > 0 { max.min(65536) as i32 } else { 1024 };
    for fd in 3..max {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Result of [`ProcessSupervisor::ensure_started`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new instance was launched
    Started(u32),
    /// An instance is already current
    Live,
    /// A completed `once`/`wait` run was not repeated
    Completed,
}

#[derive(Default)]
struct ProcessTable {
    entries: HashMap<String, RuntimeProcess>,
    by_pid: HashMap<u32, String>,
    foreground: HashMap<u32, oneshot::Sender<ExitStatus>>,
    next_generation: u64,
}

/// Process supervisor that owns the process table.
#[derive(Clone)]
pub struct ProcessSupervisor {
    table: Arc<Mutex<ProcessTable>>,
    spawner: Arc<dyn Spawner>,
    provisioner: Arc<IsolationProvisioner>,
    policy: Arc<dyn RespawnPolicy>,
    recovery: Arc<AtomicBool>,
    /// Bumped whenever an entry leaves a live state
    exits: Arc<watch::Sender<u64>>,
    grace: Duration,
}

impl ProcessSupervisor {
    /// Create a supervisor with immediate respawn and a 2 second grace.
    pub fn new(spawner: Arc<dyn Spawner>, provisioner: IsolationProvisioner) -> Self {
        let (exits, _) = watch::channel(0);
        Self {
            table: Arc::new(Mutex::new(ProcessTable::default())),
            spawner,
            provisioner: Arc::new(provisioner),
            policy: Arc::new(ImmediateRespawn),
            recovery: Arc::new(AtomicBool::new(false)),
            exits: Arc::new(exits),
            grace: Duration::from_secs(2),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn RespawnPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Interval between the termination and the kill signal.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Suspend or resume automatic respawn.
    pub fn set_recovery(&self, enabled: bool) {
        self.recovery.store(enabled, Ordering::SeqCst);
    }

    pub fn is_recovery(&self) -> bool {
        self.recovery.load(Ordering::SeqCst)
    }

    /// Start a definition.
    ///
    /// Fails with [`Error::AlreadyLive`] when an instance is still current.
    /// Spawn failures are logged, recorded as `failed` and returned.
    pub async fn start(&self, def: &ProcessDefinition) -> Result<u32> {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.entries.get(&def.id) {
            if entry.status.is_live() {
                return Err(Error::AlreadyLive(def.id.clone()));
            }
        }
        self.launch(&mut table, def.clone(), 0)
    }

    /// Start `def` unless an instance is current.
    ///
    /// When `rerun_completed` is false, a definition whose last run already
    /// exited or failed is left alone.
    pub async fn ensure_started(
        &self,
        def: &ProcessDefinition,
        rerun_completed: bool,
    ) -> Result<StartOutcome> {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.entries.get(&def.id) {
            if entry.status.is_live() {
                return Ok(StartOutcome::Live);
            }
            if !rerun_completed {
                return Ok(StartOutcome::Completed);
            }
        }
        self.launch(&mut table, def.clone(), 0)
            .map(StartOutcome::Started)
    }

    /// Handle an exit notification for the current instance of `id`.
    pub async fn on_exit(&self, id: &str, status: ExitStatus) {
        let mut table = self.table.lock().await;
        self.handle_exit(&mut table, id, status);
    }

    /// Route a reaped pid to its owner.
    pub async fn handle_reaped(&self, status: ExitStatus) {
        let mut table = self.table.lock().await;

        if let Some(waiter) = table.foreground.remove(&status.pid) {
            let _ = waiter.send(status);
            return;
        }

        let id = match table.by_pid.get(&status.pid) {
            Some(id) => id.clone(),
            None => {
                debug!(pid = status.pid, code = ?status.code, signal = ?status.signal, "Reaped orphan process");
                return;
            }
        };
        self.handle_exit(&mut table, &id, status);
    }

    /// Reap every exited child and dispatch the statuses.
    pub async fn reap(&self) -> usize {
        let statuses = reap_children();
        let count = statuses.len();
        for status in statuses {
            self.handle_reaped(status).await;
        }
        count
    }

    /// Stop one identifier: termination signal, grace, then kill.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let target = {
            let mut table = self.table.lock().await;
            if !table.entries.contains_key(id) {
                return Err(Error::UnknownProcess(id.to_string()));
            }
            let target = self.mark_stopping(&mut table, id);
            if let Some(pid) = target {
                self.send(id, pid, Signal::SIGTERM);
            }
            target
        };

        if let Some(pid) = target {
            self.escalate(vec![(id.to_string(), pid)]).await;
        }
        Ok(())
    }

    /// Stop several identifiers together, sharing one grace interval.
    ///
    /// Unknown or inactive identifiers are skipped. Returns the identifiers
    /// that were signaled.
    pub async fn stop_many(&self, ids: &[String]) -> Vec<String> {
        let targets = {
            let mut table = self.table.lock().await;
            self.terminate(&mut table, ids.iter().cloned(), Signal::SIGTERM)
        };

        let stopped = targets.iter().map(|(id, _)| id.clone()).collect();
        if !targets.is_empty() {
            self.escalate(targets).await;
        }
        stopped
    }

    /// Stop every live entry whose identifier is not in `wanted`.
    ///
    /// Marking and signaling happen under one lock acquisition, so an exit
    /// racing with this call can never respawn an identifier being removed.
    /// Returns the identifiers that were stopped.
    pub async fn retain(&self, wanted: &HashSet<String>) -> Vec<String> {
        let targets = {
            let mut table = self.table.lock().await;
            let ids: Vec<String> = table
                .entries
                .iter()
                .filter(|(id, entry)| entry.status.is_live() && !wanted.contains(*id))
                .map(|(id, _)| id.clone())
                .collect();
            self.terminate(&mut table, ids, Signal::SIGTERM)
        };

        let stopped = targets.iter().map(|(id, _)| id.clone()).collect();
        if !targets.is_empty() {
            self.escalate(targets).await;
        }
        stopped
    }

    /// Signal every tracked process, wait the grace interval, then kill.
    pub async fn stop_all(&self, sig: Signal) {
        let targets = {
            let mut table = self.table.lock().await;
            let ids: Vec<String> = table.entries.keys().cloned().collect();
            self.terminate(&mut table, ids, sig)
        };

        info!(count = targets.len(), signal = ?sig, "Stopping all processes");
        if !targets.is_empty() {
            self.escalate(targets).await;
        }
    }

    /// Wait until `id` has no live instance.
    pub async fn wait_exit(&self, id: &str) {
        self.wait_for(|table| {
            table
                .entries
                .get(id)
                .map_or(true, |entry| !entry.status.is_live())
        })
        .await;
    }

    /// Run `spawn` under the table lock and register the pid it returns for
    /// a one-off exit notification.
    ///
    /// Used for processes that are not table entries, such as the emergency
    /// shell, so the aggregate reaper does not discard their status.
    pub async fn spawn_foreground<F>(&self, spawn: F) -> Result<oneshot::Receiver<ExitStatus>>
    where
        F: FnOnce() -> Result<u32>,
    {
        let mut table = self.table.lock().await;
        let pid = spawn()?;
        let (tx, rx) = oneshot::channel();
        table.foreground.insert(pid, tx);
        Ok(rx)
    }

    /// Identifiers currently running, sorted.
    pub async fn running(&self) -> Vec<String> {
        let table = self.table.lock().await;
        let mut ids: Vec<String> = table
            .entries
            .values()
            .filter(|entry| entry.status == ProcessStatus::Running)
            .map(|entry| entry.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn get(&self, id: &str) -> Option<RuntimeProcess> {
        self.table.lock().await.entries.get(id).cloned()
    }

    /// Copy of every table entry.
    pub async fn snapshot(&self) -> Vec<RuntimeProcess> {
        let table = self.table.lock().await;
        let mut entries: Vec<RuntimeProcess> = table.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    fn launch(&self, table: &mut ProcessTable, def: ProcessDefinition, restarts: u32) -> Result<u32> {
        let plan = self.provisioner.plan(&def);
        table.next_generation += 1;
        let generation = table.next_generation;
        let id = def.id.clone();

        match self.spawner.spawn(&def, &plan) {
            Ok(pid) => {
                let cgroups = self.provisioner.attach(&id, pid, &plan.cgroups);
                info!(id = %id, pid = pid, restarts = restarts, "Started process");

                table.by_pid.insert(pid, id.clone());
                table.entries.insert(
                    id.clone(),
                    RuntimeProcess {
                        id,
                        definition: def,
                        pid: Some(pid),
                        status: ProcessStatus::Running,
                        cgroups,
                        namespaces: plan.namespaces,
                        generation,
                        restarts,
                        started_at: Some(Utc::now()),
                        last_exit: None,
                        failure: None,
                    },
                );
                Ok(pid)
            }
            Err(e) => {
                error!(id = %id, error = %e, "Failed to start process");
                table.entries.insert(
                    id.clone(),
                    RuntimeProcess {
                        id,
                        definition: def,
                        pid: None,
                        status: ProcessStatus::Failed,
                        cgroups: Vec::new(),
                        namespaces: plan.namespaces,
                        generation,
                        restarts,
                        started_at: None,
                        last_exit: None,
                        failure: Some(e.to_string()),
                    },
                );
                self.notify_exit();
                Err(e)
            }
        }
    }

    fn handle_exit(&self, table: &mut ProcessTable, id: &str, status: ExitStatus) {
        let (def, restarts, generation) = {
            let Some(entry) = table.entries.get_mut(id) else {
                debug!(id = %id, "Exit for unknown identifier");
                return;
            };

            let stopping = match entry.status {
                ProcessStatus::Running => false,
                ProcessStatus::Stopping => true,
                _ => {
                    debug!(id = %id, status = %entry.status, "Ignoring exit for inactive process");
                    return;
                }
            };

            if let Some(pid) = entry.pid.take() {
                table.by_pid.remove(&pid);
            }
            entry.status = ProcessStatus::Exited;
            entry.last_exit = Some(status);

            info!(
                id = %id,
                pid = status.pid,
                code = ?status.code,
                signal = ?status.signal,
                "Process exited"
            );

            if stopping {
                self.notify_exit();
                return;
            }
            (entry.definition.clone(), entry.restarts, entry.generation)
        };

        if self.is_recovery() {
            debug!(id = %id, "Recovery mode, not respawning");
            self.notify_exit();
            return;
        }

        match self.policy.decide(&def, restarts) {
            Respawn::Never => {}
            Respawn::Now => {
                // A spawn failure is logged and recorded by launch
                let _ = self.launch(table, def, restarts.saturating_add(1));
            }
            Respawn::After(delay) => {
                if let Some(entry) = table.entries.get_mut(id) {
                    entry.status = ProcessStatus::PendingRestart;
                }
                info!(id = %id, delay_ms = delay.as_millis() as u64, "Scheduling respawn");

                let supervisor = self.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    supervisor.resume_pending(&id, generation).await;
                });
            }
        }
        self.notify_exit();
    }

    async fn resume_pending(&self, id: &str, generation: u64) {
        let mut table = self.table.lock().await;
        let (def, restarts) = match table.entries.get(id) {
            Some(entry)
                if entry.status == ProcessStatus::PendingRestart
                    && entry.generation == generation =>
            {
                (entry.definition.clone(), entry.restarts)
            }
            _ => return,
        };

        if self.is_recovery() {
            if let Some(entry) = table.entries.get_mut(id) {
                entry.status = ProcessStatus::Exited;
            }
            self.notify_exit();
            return;
        }

        let _ = self.launch(&mut table, def, restarts.saturating_add(1));
    }

    /// Mark each identifier as stopping and send it `sig`.
    fn terminate<I>(&self, table: &mut ProcessTable, ids: I, sig: Signal) -> Vec<(String, u32)>
    where
        I: IntoIterator<Item = String>,
    {
        let mut targets = Vec::new();
        for id in ids {
            if let Some(pid) = self.mark_stopping(table, &id) {
                self.send(&id, pid, sig);
                targets.push((id, pid));
            }
        }
        targets
    }

    /// Mark `id` as stopping and return the pid to signal.
    ///
    /// A pending restart is cancelled instead.
    fn mark_stopping(&self, table: &mut ProcessTable, id: &str) -> Option<u32> {
        let entry = table.entries.get_mut(id)?;
        match entry.status {
            ProcessStatus::Running => {
                entry.status = ProcessStatus::Stopping;
                entry.pid
            }
            ProcessStatus::PendingRestart => {
                debug!(id = %id, "Cancelled pending restart");
                entry.status = ProcessStatus::Exited;
                self.notify_exit();
                None
            }
            _ => None,
        }
    }

    fn send(&self, id: &str, pid: u32, sig: Signal) {
        match self.spawner.signal(pid, sig) {
            Ok(()) => debug!(id = %id, pid = pid, signal = ?sig, "Sent signal"),
            Err(e) => warn!(id = %id, pid = pid, signal = ?sig, error = %e, "Failed to signal process"),
        }
    }

    /// Wait the grace interval for `targets` to exit, then kill leftovers.
    async fn escalate(&self, targets: Vec<(String, u32)>) {
        let still_stopping = |table: &ProcessTable| -> Vec<(String, u32)> {
            targets
                .iter()
                .filter(|(id, pid)| {
                    table.entries.get(id).map_or(false, |entry| {
                        entry.status == ProcessStatus::Stopping && entry.pid == Some(*pid)
                    })
                })
                .cloned()
                .collect()
        };

        if self
            .wait_for_timeout(|table| still_stopping(table).is_empty(), self.grace)
            .await
        {
            return;
        }

        let leftovers = still_stopping(&*self.table.lock().await);
        for (id, pid) in &leftovers {
            warn!(id = %id, pid = pid, "Process didn't exit in time, sending SIGKILL");
            self.send(id, *pid, Signal::SIGKILL);
        }

        if !self
            .wait_for_timeout(|table| still_stopping(table).is_empty(), KILL_WAIT)
            .await
        {
            warn!(count = leftovers.len(), "Processes still present after SIGKILL");
        }
    }

    async fn wait_for<P>(&self, pred: P)
    where
        P: Fn(&ProcessTable) -> bool,
    {
        let mut rx = self.exits.subscribe();
        loop {
            if pred(&*self.table.lock().await) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn wait_for_timeout<P>(&self, pred: P, timeout: Duration) -> bool
    where
        P: Fn(&ProcessTable) -> bool,
    {
        tokio::time::timeout(timeout, self.wait_for(pred))
            .await
            .is_ok()
    }

    fn notify_exit(&self) {
        self.exits.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Reap any exited children without blocking (PID 1 duty).
pub fn reap_children() -> Vec<ExitStatus> {
    let mut statuses = Vec::new();

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                let pid = pid.as_raw() as u32;
                debug!(pid = pid, code = code, "Reaped process");
                statuses.push(ExitStatus::exited(pid, code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                let pid = pid.as_raw() as u32;
                debug!(pid = pid, signal = ?sig, "Reaped signaled process");
                statuses.push(ExitStatus::signaled(pid, sig as i32));
            }
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(_) => continue,
            Err(e) => {
                error!(error = %e, "Error reaping children");
                break;
            }
        }
    }

    statuses
}
