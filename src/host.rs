//! Host collaborators: the pieces of PID 1 duty that live outside the
//! supervisor.

use crate::config::SupervisorConfig;
use crate::definition::Runlevel;
use crate::error::{Error, Result};
use crate::process::{ExitStatus, ProcessSupervisor};
use async_trait::async_trait;
use nix::mount::{mount, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Operations the supervisor consumes from the host system.
#[async_trait]
pub trait Host: Send + Sync {
    /// Mount /proc, /sys and /dev. Failures are logged, not returned.
    fn mount_virtual_filesystems(&self);

    /// Become session leader and take the console as controlling terminal.
    fn acquire_terminal(&self);

    /// Kernel boot parameters.
    fn kernel_cmdline(&self) -> String;

    /// Run an interactive shell and wait for it to exit.
    async fn run_shell(&self, supervisor: &ProcessSupervisor) -> Result<ExitStatus>;

    /// Run the rc scripts of `level` one after another. Failures are logged.
    async fn run_runlevel_scripts(&self, level: &Runlevel, supervisor: &ProcessSupervisor);

    /// Ask the kernel to power off.
    async fn power_off(&self) -> Result<()>;
}

/// The real Linux host.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    shell: PathBuf,
    cmdline: PathBuf,
    rc_dir: PathBuf,
    /// Only PID 1 may actually power off the machine
    allow_power_off: bool,
}

impl LinuxHost {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            cmdline: config.kernel_cmdline.clone(),
            rc_dir: config.rc_dir.clone(),
            allow_power_off: config.require_pid1,
        }
    }

    /// Run one rc script in its own session and wait for it.
    async fn run_script(
        &self,
        script: &Path,
        action: &'static str,
        supervisor: &ProcessSupervisor,
    ) -> Result<ExitStatus> {
        let shell = self.shell.clone();
        let path = script.to_path_buf();
        let exited = supervisor
            .spawn_foreground(move || {
                let mut cmd = Command::new(&shell);
                cmd.arg(&path).arg(action).stdin(Stdio::null());
                unsafe {
                    cmd.pre_exec(|| {
                        nix::unistd::setsid()
                            .map(|_| ())
                            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
                    });
                }
                cmd.spawn()
                    .map(|child| child.id())
                    .map_err(|e| Error::SpawnFailed {
                        id: path.display().to_string(),
                        reason: e.to_string(),
                    })
            })
            .await?;

        exited
            .await
            .map_err(|_| Error::Collaborator(format!("{} status lost", script.display())))
    }

    /// Mount a filesystem.
    fn mount_fs(&self, source: &str, target: &str, fstype: &str, flags: MsFlags) -> Result<()> {
        let target_path = Path::new(target);
        if !target_path.exists() {
            std::fs::create_dir_all(target_path)?;
        }

        mount(Some(source), target, Some(fstype), flags, None::<&str>)?;

        info!(
            source = source,
            target = target,
            fstype = fstype,
            "Mounted filesystem"
        );
        Ok(())
    }
}

#[async_trait]
impl Host for LinuxHost {
    fn mount_virtual_filesystems(&self) {
        info!("Mounting virtual filesystems");

        for (source, target, fstype) in [
            ("proc", "/proc", "proc"),
            ("sysfs", "/sys", "sysfs"),
            ("udev", "/dev", "devtmpfs"),
        ] {
            if let Err(e) = self.mount_fs(source, target, fstype, MsFlags::empty()) {
                warn!(target = target, error = %e, "Failed to mount filesystem");
            }
        }
    }

    fn acquire_terminal(&self) {
        if let Err(e) = nix::unistd::setsid() {
            warn!(error = %e, "setsid failed");
        }

        let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 1) };
        if rc == -1 {
            warn!(
                error = %std::io::Error::last_os_error(),
                "Failed to acquire controlling terminal"
            );
        }
    }

    fn kernel_cmdline(&self) -> String {
        match std::fs::read_to_string(&self.cmdline) {
            Ok(cmdline) => cmdline,
            Err(e) => {
                warn!(path = %self.cmdline.display(), error = %e, "Failed to read kernel command line");
                String::new()
            }
        }
    }

    async fn run_shell(&self, supervisor: &ProcessSupervisor) -> Result<ExitStatus> {
        info!(shell = %self.shell.display(), "Starting emergency shell");

        let shell = self.shell.clone();
        let exited = supervisor
            .spawn_foreground(move || {
                Command::new(&shell)
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .spawn()
                    .map(|child| child.id())
                    .map_err(|e| Error::SpawnFailed {
                        id: shell.display().to_string(),
                        reason: e.to_string(),
                    })
            })
            .await?;

        exited
            .await
            .map_err(|_| Error::Collaborator("emergency shell status lost".to_string()))
    }

    async fn run_runlevel_scripts(&self, level: &Runlevel, supervisor: &ProcessSupervisor) {
        let dir = self.rc_dir.join(format!("rc{}.d", level));
        let scripts = match runlevel_scripts(&dir) {
            Ok(scripts) => scripts,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "No rc scripts");
                return;
            }
        };

        info!(runlevel = %level, scripts = scripts.len(), "Running rc scripts");
        for (script, action) in scripts {
            match self.run_script(&script, action, supervisor).await {
                Ok(status) if status.code == Some(0) => {
                    debug!(script = %script.display(), action = action, "rc script finished");
                }
                Ok(status) => {
                    warn!(script = %script.display(), action = action, code = ?status.code, signal = ?status.signal, "rc script failed");
                }
                Err(e) => {
                    warn!(script = %script.display(), action = action, error = %e, "Failed to run rc script");
                }
            }
        }
    }

    async fn power_off(&self) -> Result<()> {
        if !self.allow_power_off {
            info!("Not PID 1, skipping power off");
            return Ok(());
        }

        // Sync filesystems
        unsafe {
            libc::sync();
        }

        reboot(RebootMode::RB_POWER_OFF)?;
        Ok(())
    }
}

/// The scripts of one `rc<N>.d` directory in name order, with the action
/// each is called with: `S*` scripts `start`, `K*` scripts `stop`. Other
/// entries are skipped.
pub fn runlevel_scripts(dir: &Path) -> std::io::Result<Vec<(PathBuf, &'static str)>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    Ok(names
        .into_iter()
        .filter_map(|name| {
            let action = if name.starts_with('S') {
                "start"
            } else if name.starts_with('K') {
                "stop"
            } else {
                return None;
            };
            Some((dir.join(name), action))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runlevel_scripts_order_and_actions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["S20web", "K10net", "README", "S01log", "k99lower"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }

        let scripts = runlevel_scripts(dir.path()).unwrap();
        let named: Vec<(String, &str)> = scripts
            .iter()
            .map(|(path, action)| {
                (path.file_name().unwrap().to_string_lossy().into_owned(), *action)
            })
            .collect();
        assert_eq!(
            named,
            vec![
                ("K10net".to_string(), "stop"),
                ("S01log".to_string(), "start"),
                ("S20web".to_string(), "start"),
            ]
        );
    }

    #[test]
    fn test_missing_rc_dir_is_error() {
        assert!(runlevel_scripts(Path::new("/nonexistent/rc2.d")).is_err());
    }
}
