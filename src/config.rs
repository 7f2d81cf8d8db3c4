//! Process-wide supervisor configuration.
//!
//! Every field has a default so an absent or partial `/etc/tabinit.toml`
//! still yields a usable configuration.

use crate::definition::Runlevel;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tabinit.toml";

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Service table path
    pub inittab: PathBuf,
    /// Control channel named pipe
    pub control_fifo: PathBuf,
    /// Append-only log file
    pub syslog: PathBuf,
    /// Kernel boot parameters
    pub kernel_cmdline: PathBuf,
    /// Substring of the kernel command line that forces recovery
    pub recovery_marker: String,
    /// Runlevel entered at boot when the table names none
    pub default_runlevel: Runlevel,
    /// Runlevel entered in recovery mode
    pub recovery_runlevel: Runlevel,
    /// Command interpreter and emergency shell
    pub shell: PathBuf,
    /// Holds the `rc<N>.d` script directories
    pub rc_dir: PathBuf,
    /// Grace between the termination and the kill signal
    pub stop_grace_ms: u64,
    /// Refuse to run unless we are PID 1
    pub require_pid1: bool,
    /// Mount /proc, /sys and /dev at boot
    pub mount_filesystems: bool,
    /// Namespace and cgroup settings
    pub isolation: IsolationSettings,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            inittab: PathBuf::from("/etc/inittab"),
            control_fifo: PathBuf::from("/run/initctl"),
            syslog: PathBuf::from("/var/log/syslog"),
            kernel_cmdline: PathBuf::from("/proc/cmdline"),
            recovery_marker: "recovery".to_string(),
            default_runlevel: Runlevel::numbered(2),
            recovery_runlevel: Runlevel::numbered(1),
            shell: PathBuf::from("/bin/sh"),
            rc_dir: PathBuf::from("/etc/rc.d"),
            stop_grace_ms: 2000,
            require_pid1: true,
            mount_filesystems: true,
            isolation: IsolationSettings::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path`, or fall back to defaults when the default file is absent.
    ///
    /// An explicitly requested file that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Namespace and cgroup placement applied to every started process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationSettings {
    /// Master switch for namespaces
    pub enabled: bool,
    /// Request a private PID namespace
    pub pid: bool,
    /// Request a private mount namespace for every process
    pub mount: bool,
    /// Cgroup hierarchy root
    pub cgroup_root: PathBuf,
    /// Subsystems each process joins
    pub subsystems: Vec<String>,
    /// Directory created under each subsystem
    pub scope: String,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pid: true,
            mount: true,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            subsystems: vec![
                "cpu".to_string(),
                "memory".to_string(),
                "devices".to_string(),
            ],
            scope: "init.scope".to_string(),
        }
    }
}

impl IsolationSettings {
    /// No namespaces and no cgroups.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            subsystems: Vec::new(),
            ..Self::default()
        }
    }
}
