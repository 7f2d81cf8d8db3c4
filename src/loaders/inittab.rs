//! Inittab loader.
//!
//! Line format is `ID:RUNLEVELS:ACTION[,PROFILE]:COMMAND`. The command is
//! the remainder of the line and may contain colons. Comments (`#`), blank
//! lines, lines with fewer than four fields, unknown actions and duplicate
//! identifiers are skipped.

use super::{ServiceTable, TableLoader};
use crate::definition::{Action, IsolationProfile, ProcessDefinition, Runlevel, RunlevelSet};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Loader for colon-delimited inittab files.
#[derive(Debug, Default, Clone, Copy)]
pub struct InittabLoader;

impl InittabLoader {
    pub fn new() -> Self {
        Self
    }
}

impl TableLoader for InittabLoader {
    fn parse(&self, content: &str) -> ServiceTable {
        let mut table = ServiceTable::default();
        let mut seen = HashSet::new();

        for (index, line) in content.lines().enumerate() {
            let lineno = index + 1;
            match parse_line(line) {
                Line::Skip => {}
                Line::Malformed(reason) => {
                    warn!(line = lineno, reason = %reason, "Skipping service table entry");
                }
                Line::InitDefault(level) => {
                    debug!(line = lineno, runlevel = %level, "Default runlevel from table");
                    table.default_runlevel = Some(level);
                }
                Line::Definition(def) => {
                    if !seen.insert(def.id.clone()) {
                        warn!(line = lineno, id = %def.id, "Duplicate identifier, keeping the first");
                        continue;
                    }
                    table.definitions.push(def);
                }
            }
        }

        table
    }

    fn name(&self) -> &'static str {
        "inittab"
    }
}

enum Line {
    Skip,
    Malformed(String),
    InitDefault(Runlevel),
    Definition(ProcessDefinition),
}

fn parse_line(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Skip;
    }

    let fields: Vec<&str> = line.splitn(4, ':').collect();
    if fields.len() < 4 {
        // Tolerated silently: short lines are not worth a warning
        return Line::Skip;
    }

    let id = fields[0].trim();
    if id.is_empty() {
        return Line::Malformed("empty identifier".to_string());
    }

    let runlevels = RunlevelSet::parse(fields[1]);
    let (action, profile) = match fields[2].trim().split_once(',') {
        Some((action, profile)) => (action.trim(), profile.trim()),
        None => (fields[2].trim(), ""),
    };

    if action == "initdefault" {
        return match runlevels.first().map(Runlevel::new) {
            Some(Ok(level)) => Line::InitDefault(level),
            Some(Err(e)) => Line::Malformed(e.to_string()),
            None => Line::Malformed("initdefault without a runlevel".to_string()),
        };
    }

    let action: Action = match action.parse() {
        Ok(action) => action,
        Err(e) => return Line::Malformed(e.to_string()),
    };
    let profile: IsolationProfile = match profile.parse() {
        Ok(profile) => profile,
        Err(e) => return Line::Malformed(e.to_string()),
    };

    Line::Definition(ProcessDefinition {
        id: id.to_string(),
        runlevels,
        action,
        profile,
        command: fields[3].trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_table() {
        let content = "\
# comment line
a:23:respawn:/sbin/getty tty1

b:3:once:echo hello
";
        let table = InittabLoader.parse(content);
        assert_eq!(table.len(), 2);
        assert_eq!(table.definitions[0].id, "a");
        assert_eq!(table.definitions[0].action, Action::Respawn);
        assert_eq!(table.definitions[0].command, "/sbin/getty tty1");
        assert_eq!(table.definitions[1].id, "b");
        assert_eq!(table.definitions[1].action, Action::Once);
    }

    #[test]
    fn test_short_lines_are_skipped() {
        let table = InittabLoader.parse("a:2:respawn\nonly-one-field\nb:2:wait:true\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.definitions[0].id, "b");
    }

    #[test]
    fn test_command_keeps_colons() {
        let table = InittabLoader.parse("x:2:once:echo a:b:c\n");
        assert_eq!(table.definitions[0].command, "echo a:b:c");
    }

    #[test]
    fn test_unknown_action_is_skipped() {
        let table = InittabLoader.parse("x:2:sometimes:true\ny:2:off:true\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.definitions[0].action, Action::Off);
    }

    #[test]
    fn test_profile_suffix() {
        let table = InittabLoader.parse("x:2:respawn,full:sleep 10\ny:2:respawn,bogus:true\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.definitions[0].profile, IsolationProfile::Full);
    }

    #[test]
    fn test_initdefault_sets_default_runlevel() {
        let table = InittabLoader.parse("id:3:initdefault:\nx:3:once:true\n");
        assert_eq!(table.default_runlevel, Some(Runlevel::new("3").unwrap()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_duplicate_identifier_keeps_first() {
        let table = InittabLoader.parse("x:2:once:first\nx:3:once:second\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.definitions[0].command, "first");
    }

    #[test]
    fn test_load_missing_file() {
        let err = InittabLoader
            .load(std::path::Path::new("/nonexistent/inittab"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/inittab"));
    }
}
