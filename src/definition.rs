//! Process definitions and runlevel labels.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What the supervisor does with a process when it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Run once when the runlevel is entered
    Once,
    /// Restart whenever the process exits
    Respawn,
    /// Run once and block the transition until it exits
    Wait,
    /// Never run
    Off,
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "once" => Ok(Action::Once),
            "respawn" => Ok(Action::Respawn),
            "wait" => Ok(Action::Wait),
            "off" => Ok(Action::Off),
            other => Err(Error::ConfigError(format!("unknown action: {}", other))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Once => write!(f, "once"),
            Action::Respawn => write!(f, "respawn"),
            Action::Wait => write!(f, "wait"),
            Action::Off => write!(f, "off"),
        }
    }
}

/// Namespace profile requested by a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationProfile {
    /// Private PID namespace (plus whatever the process-wide settings add)
    #[default]
    Standard,
    /// Private PID, mount, UTS and IPC namespaces
    Full,
}

impl FromStr for IsolationProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "pid" | "standard" => Ok(IsolationProfile::Standard),
            "full" => Ok(IsolationProfile::Full),
            other => Err(Error::ConfigError(format!(
                "unknown isolation profile: {}",
                other
            ))),
        }
    }
}

/// A runlevel label such as `2`, `10` or `S`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Runlevel(String);

impl Runlevel {
    /// Validate a label: ASCII digits, or `S` for single user.
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let valid = label == "S"
            || label == "s"
            || (!label.is_empty() && label.bytes().all(|b| b.is_ascii_digit()));
        if !valid {
            return Err(Error::InvalidRunlevel(label));
        }
        Ok(Self(label.to_ascii_uppercase()))
    }

    /// Build a label from a control channel payload.
    ///
    /// The payload is rendered in decimal, so `3` becomes `"3"` and `10`
    /// becomes `"10"`. Negative payloads are rejected.
    pub fn from_payload(value: i32) -> Result<Self> {
        u32::try_from(value)
            .map(Self::numbered)
            .map_err(|_| Error::InvalidRunlevel(value.to_string()))
    }

    /// A numeric runlevel.
    pub fn numbered(level: u32) -> Self {
        Self(level.to_string())
    }

    /// The halt runlevel used by shutdown.
    pub fn halt() -> Self {
        Self::numbered(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Runlevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Runlevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Runlevel::new(s)
    }
}

impl TryFrom<String> for Runlevel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Runlevel::new(value)
    }
}

impl From<Runlevel> for String {
    fn from(level: Runlevel) -> Self {
        level.0
    }
}

/// The runlevels a definition applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunlevelSet {
    /// Empty runlevels field
    All,
    /// Explicit labels
    Only(Vec<String>),
}

impl RunlevelSet {
    /// Parse the runlevels field of a table line.
    ///
    /// `"23"` means levels 2 and 3. A comma switches to list form so
    /// multi-digit labels can be written: `"2,10"`.
    pub fn parse(field: &str) -> Self {
        let field = field.trim();
        if field.is_empty() {
            return RunlevelSet::All;
        }

        let labels = if field.contains(',') {
            field
                .split(',')
                .map(|l| l.trim().to_ascii_uppercase())
                .filter(|l| !l.is_empty())
                .collect()
        } else {
            field
                .chars()
                .map(|c| c.to_ascii_uppercase().to_string())
                .collect()
        };
        RunlevelSet::Only(labels)
    }

    pub fn contains(&self, level: &Runlevel) -> bool {
        match self {
            RunlevelSet::All => true,
            RunlevelSet::Only(labels) => labels.iter().any(|l| l == level.as_str()),
        }
    }

    /// First label, used by `initdefault` lines.
    pub fn first(&self) -> Option<&str> {
        match self {
            RunlevelSet::All => None,
            RunlevelSet::Only(labels) => labels.first().map(String::as_str),
        }
    }
}

impl fmt::Display for RunlevelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunlevelSet::All => write!(f, "all"),
            RunlevelSet::Only(labels) => write!(f, "{}", labels.join(",")),
        }
    }
}

/// A static service description loaded from the service table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessDefinition {
    /// Unique identifier
    pub id: String,
    /// Runlevels this definition applies to
    pub runlevels: RunlevelSet,
    /// Lifecycle action
    pub action: Action,
    /// Requested namespace profile
    pub profile: IsolationProfile,
    /// Command line, run through the shell
    pub command: String,
}

impl ProcessDefinition {
    /// Create a definition with the standard isolation profile.
    pub fn new(
        id: impl Into<String>,
        runlevels: &str,
        action: Action,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            runlevels: RunlevelSet::parse(runlevels),
            action,
            profile: IsolationProfile::Standard,
            command: command.into(),
        }
    }

    pub fn with_profile(mut self, profile: IsolationProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Whether this definition should be running in `level`.
    pub fn applies_to(&self, level: &Runlevel) -> bool {
        self.action != Action::Off && self.runlevels.contains(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runlevel_labels() {
        assert_eq!(Runlevel::new("3").unwrap().as_str(), "3");
        assert_eq!(Runlevel::new("s").unwrap().as_str(), "S");
        assert_eq!(Runlevel::new("12").unwrap().as_str(), "12");
        assert!(Runlevel::new("").is_err());
        assert!(Runlevel::new("2a").is_err());
    }

    #[test]
    fn test_runlevel_from_payload_keeps_all_digits() {
        assert_eq!(Runlevel::from_payload(3).unwrap().as_str(), "3");
        assert_eq!(Runlevel::from_payload(10).unwrap().as_str(), "10");
        assert!(Runlevel::from_payload(-1).is_err());
    }

    #[test]
    fn test_runlevel_set_membership() {
        let set = RunlevelSet::parse("23");
        assert!(set.contains(&Runlevel::new("2").unwrap()));
        assert!(set.contains(&Runlevel::new("3").unwrap()));
        assert!(!set.contains(&Runlevel::new("5").unwrap()));
        assert!(!set.contains(&Runlevel::new("23").unwrap()));

        let list = RunlevelSet::parse("2,10");
        assert!(list.contains(&Runlevel::new("10").unwrap()));
        assert!(!list.contains(&Runlevel::new("1").unwrap()));

        assert!(RunlevelSet::parse("").contains(&Runlevel::new("4").unwrap()));
    }

    #[test]
    fn test_off_never_applies() {
        let def = ProcessDefinition::new("x", "2", Action::Off, "true");
        assert!(!def.applies_to(&Runlevel::new("2").unwrap()));
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("respawn".parse::<Action>().unwrap(), Action::Respawn);
        assert!("sometimes".parse::<Action>().is_err());
    }
}
