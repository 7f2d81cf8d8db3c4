//! Tabinit - a table-driven PID 1 process supervisor.
//!
//! This crate reads an inittab-style service table and keeps the processes
//! it names running at the current runlevel. It is designed to run as PID 1
//! and handles:
//!
//! - Runlevel transitions (stop what is unwanted, start what is missing)
//! - Immediate respawn of `respawn` entries, suspended in recovery mode
//! - Namespace and cgroup placement for every started process
//! - Signal handling (SIGCHLD, SIGHUP, SIGUSR1, SIGTERM, SIGINT)
//! - A named-pipe control channel for `telinit` and `shutdown` requests
//!
//! # Architecture
//!
//! - **Init**: boot sequence and the single event dispatcher
//! - **RunlevelController**: the runlevel state machine
//! - **ProcessSupervisor**: owns the process table, spawns, reaps and stops
//! - **SignalRouter** and **ControlServer**: turn signals and control frames
//!   into [`ControlEvent`]s
//!
//! # Example
//!
//! ```no_run
//! use tabinit::{Init, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SupervisorConfig::default();
//!     let init = Init::new(config)?;
//!     init.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod definition;
pub mod error;
pub mod host;
pub mod init;
pub mod isolation;
pub mod loaders;
pub mod logging;
pub mod policy;
pub mod process;
pub mod runlevel;
pub mod signals;

// Re-export main types
pub use config::{IsolationSettings, SupervisorConfig};
pub use control::{ControlClient, ControlRequest, ControlServer};
pub use definition::{Action, IsolationProfile, ProcessDefinition, Runlevel};
pub use error::{Error, Result};
pub use host::{Host, LinuxHost};
pub use init::Init;
pub use isolation::IsolationProvisioner;
pub use loaders::{InittabLoader, ServiceTable, TableLoader};
pub use policy::{BackoffRespawn, ImmediateRespawn, RespawnPolicy};
pub use process::{ExitStatus, OsSpawner, ProcessStatus, ProcessSupervisor, RuntimeProcess, Spawner};
pub use runlevel::RunlevelController;
pub use signals::{ControlEvent, SignalRouter};
