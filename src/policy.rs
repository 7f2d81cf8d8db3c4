//! Respawn policies.
//!
//! The supervisor asks a [`RespawnPolicy`] what to do after a `respawn`
//! process exits. [`ImmediateRespawn`] restarts at once with no limit, which
//! keeps essential services alive but will spin on a command that exits
//! immediately. [`BackoffRespawn`] is the rate-limited alternative.

use crate::definition::{Action, ProcessDefinition};
use std::time::Duration;

/// Decision returned by a respawn policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Respawn {
    /// Start again right away
    Now,
    /// Start again after a delay
    After(Duration),
    /// Leave the process exited
    Never,
}

/// Decides whether and when an exited process is started again.
pub trait RespawnPolicy: Send + Sync {
    /// `restarts` counts the respawns already performed for this entry.
    fn decide(&self, def: &ProcessDefinition, restarts: u32) -> Respawn;
}

/// Unthrottled immediate respawn for `respawn` definitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateRespawn;

impl RespawnPolicy for ImmediateRespawn {
    fn decide(&self, def: &ProcessDefinition, _restarts: u32) -> Respawn {
        match def.action {
            Action::Respawn => Respawn::Now,
            _ => Respawn::Never,
        }
    }
}

/// Exponential backoff: `base * 2^restarts`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffRespawn {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffRespawn {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl RespawnPolicy for BackoffRespawn {
    fn decide(&self, def: &ProcessDefinition, restarts: u32) -> Respawn {
        if def.action != Action::Respawn {
            return Respawn::Never;
        }
        if restarts == 0 {
            return Respawn::Now;
        }
        let factor = 1u32.checked_shl(restarts.min(31)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        Respawn::After(delay)
    }
}
