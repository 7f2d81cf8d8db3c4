//! Service table loaders.
//!
//! A loader turns a service table on disk into an ordered list of
//! [`ProcessDefinition`]s. The only format shipped today is the classic
//! colon-delimited inittab (`ID:RUNLEVELS:ACTION:COMMAND`).

pub mod inittab;

use crate::definition::{ProcessDefinition, Runlevel};
use crate::error::{Error, Result};
use std::path::Path;

/// The result of one parse pass over a service table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTable {
    /// Definitions in table order
    pub definitions: Vec<ProcessDefinition>,
    /// Runlevel named by an `initdefault` line, if any
    pub default_runlevel: Option<Runlevel>,
}

impl ServiceTable {
    pub fn get(&self, id: &str) -> Option<&ProcessDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    /// Definitions that should be running in `level`, in table order.
    pub fn wanted(&self, level: &Runlevel) -> Vec<ProcessDefinition> {
        self.definitions
            .iter()
            .filter(|d| d.applies_to(level))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Trait for service table loaders.
pub trait TableLoader: Send + Sync {
    /// Parse table contents. Malformed lines are skipped, never fatal.
    fn parse(&self, content: &str) -> ServiceTable;

    /// Get a description of the loader for logging purposes.
    fn name(&self) -> &'static str;

    /// Load a table from the given path.
    fn load(&self, path: &Path) -> Result<ServiceTable> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::TableRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(self.parse(&content))
    }
}

pub use inittab::InittabLoader;
