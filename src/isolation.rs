//! Namespace and cgroup placement for supervised processes.
//!
//! Isolation is best effort. A cgroup directory that cannot be created is
//! left out of the plan, an attach that fails is logged, and a namespace
//! request the kernel refuses is dropped in the child. None of these stop a
//! process from starting.

use crate::config::IsolationSettings;
use crate::definition::{IsolationProfile, ProcessDefinition};
use nix::sched::CloneFlags;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What a new process should be given at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationPlan {
    /// Flags passed to `unshare(2)` between fork and exec
    pub namespaces: CloneFlags,
    /// Cgroup directories joined after the pid is known
    pub cgroups: Vec<PathBuf>,
}

impl IsolationPlan {
    /// A plan that requests nothing.
    pub fn none() -> Self {
        Self {
            namespaces: CloneFlags::empty(),
            cgroups: Vec::new(),
        }
    }
}

/// Computes isolation plans from the process-wide settings.
#[derive(Debug, Clone)]
pub struct IsolationProvisioner {
    settings: IsolationSettings,
}

impl IsolationProvisioner {
    pub fn new(settings: IsolationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &IsolationSettings {
        &self.settings
    }

    /// Namespace flags for a definition.
    pub fn namespace_flags(&self, def: &ProcessDefinition) -> CloneFlags {
        if !self.settings.enabled {
            return CloneFlags::empty();
        }

        let mut flags = CloneFlags::empty();
        if self.settings.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.settings.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if def.profile == IsolationProfile::Full {
            flags |= CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWIPC;
        }
        flags
    }

    /// Cgroup directories for a new process, created if absent.
    pub fn cgroup_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(self.settings.subsystems.len());

        for subsystem in &self.settings.subsystems {
            let path = self
                .settings
                .cgroup_root
                .join(subsystem)
                .join(&self.settings.scope);

            if !path.is_dir() {
                if let Err(e) = std::fs::create_dir_all(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to create cgroup");
                    continue;
                }
                debug!(path = %path.display(), "Created cgroup");
            }
            paths.push(path);
        }

        paths
    }

    /// Full plan for a definition.
    pub fn plan(&self, def: &ProcessDefinition) -> IsolationPlan {
        IsolationPlan {
            namespaces: self.namespace_flags(def),
            cgroups: self.cgroup_paths(),
        }
    }

    /// Join `pid` to every cgroup in `paths`.
    ///
    /// Returns the paths that accepted the pid.
    pub fn attach(&self, id: &str, pid: u32, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut attached = Vec::with_capacity(paths.len());
        for path in paths {
            match attach_pid(path, pid) {
                Ok(()) => attached.push(path.clone()),
                Err(e) => {
                    warn!(id = %id, pid = pid, path = %path.display(), error = %e, "Failed to attach to cgroup");
                }
            }
        }
        attached
    }
}

/// Write a pid into a cgroup, v1 `tasks` first, then v2 `cgroup.procs`.
fn attach_pid(cgroup: &Path, pid: u32) -> std::io::Result<()> {
    let tasks = cgroup.join("tasks");
    match std::fs::write(&tasks, pid.to_string()) {
        Ok(()) => Ok(()),
        Err(_) => std::fs::write(cgroup.join("cgroup.procs"), pid.to_string()),
    }
}
