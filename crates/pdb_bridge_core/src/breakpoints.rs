//! Local shadow of the debugger's breakpoint table.
//!
//! Records survive restarts of the debugger process and are replayed against
//! the new process. They are only removed when the debugger confirms a clear.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::classifier::{
    indicates_deletion, indicates_no_such_breakpoint, is_error_response, listing_confirms,
    parse_breakpoint_number,
};
use crate::{DebugError, Result};

const LIST_COMMAND: &str = "b";

/// One command/response exchange with the live debugger.
pub trait DebuggerChannel {
    fn exchange(&mut self, command: &str) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointKey {
    /// Canonical path of the file.
    pub file: PathBuf,
    pub line: u32,
}

impl std::fmt::Display for BreakpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRecord {
    /// The exact `b file:line` command that created the breakpoint.
    pub command: String,
    /// Number pdb assigned in its confirmation, when one was parsed.
    pub number: Option<String>,
}

#[derive(Debug, Default)]
pub struct BreakpointStore {
    records: BTreeMap<BreakpointKey, BreakpointRecord>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BreakpointKey) -> Option<&BreakpointRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = (&BreakpointKey, &BreakpointRecord)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `file:line` strings for every tracked breakpoint.
    pub fn tracked(&self) -> Vec<String> {
        self.records.keys().map(ToString::to_string).collect()
    }

    pub async fn set<C: DebuggerChannel>(
        &mut self,
        channel: &mut C,
        project_root: &Path,
        file: &str,
        line: u32,
    ) -> Result<String> {
        let (key, relative) = resolve_key(project_root, file, line)?;
        let location = format!("{}:{line}", relative.display());
        let mut notes = Vec::new();

        if self.records.contains_key(&key) {
            let listing = channel.exchange(LIST_COMMAND).await?;
            if listing_confirms(&listing, &relative, &key.file, line) {
                return Ok(format!("Breakpoint already exists at {location}"));
            }
            warn!("Breakpoint {key} is tracked but missing from pdb's listing; setting it again");
            notes.push(format!(
                "Warning: {location} was tracked locally but pdb did not list it; re-issued."
            ));
        }

        let command = format!("b {location}");
        let response = channel.exchange(&command).await?;

        match parse_breakpoint_number(&response) {
            Some(number) => {
                self.records.insert(
                    key,
                    BreakpointRecord {
                        command,
                        number: Some(number),
                    },
                );
            }
            None if is_error_response(&response) => {
                if self.records.remove(&key).is_some() {
                    warn!("Dropping stale breakpoint {key}: pdb rejected it");
                }
            }
            None => {
                warn!("pdb accepted {command:?} without a breakpoint number");
                notes.push("Warning: pdb reply had no breakpoint number.".to_string());
                self.records.insert(
                    key,
                    BreakpointRecord {
                        command,
                        number: None,
                    },
                );
            }
        }

        Ok(with_notes(format!("Breakpoint result:\n{response}"), &notes))
    }

    pub async fn clear<C: DebuggerChannel>(
        &mut self,
        channel: &mut C,
        project_root: &Path,
        file: &str,
        line: u32,
    ) -> Result<String> {
        let (key, relative) = resolve_key(project_root, file, line)?;
        let location = format!("{}:{line}", relative.display());

        // Clearing by number survives renumbering and ambiguous lines.
        let command = match self.records.get(&key).and_then(|r| r.number.as_deref()) {
            Some(number) => format!("cl {number}"),
            None => format!("cl {location}"),
        };
        let response = channel.exchange(&command).await?;
        let result = format!("Clear breakpoint result:\n{response}");

        if indicates_deletion(&response) || indicates_no_such_breakpoint(&response) {
            self.records.remove(&key);
            return Ok(result);
        }

        if self.records.contains_key(&key) {
            warn!("pdb did not confirm clearing {key}; keeping it tracked");
            return Ok(with_notes(
                result,
                &[format!(
                    "Warning: pdb did not confirm removal; {location} is still tracked and may be out of sync."
                )],
            ));
        }
        Ok(result)
    }

    /// The debugger's own listing next to the local shadow; they may disagree.
    pub async fn list<C: DebuggerChannel>(&self, channel: &mut C) -> Result<String> {
        let live = channel.exchange(LIST_COMMAND).await?;
        let tracked = self.tracked();
        let tracked = if tracked.is_empty() {
            "(none)".to_string()
        } else {
            tracked.join("\n")
        };
        Ok(format!(
            "Current breakpoints:\n{live}\n\nTracked breakpoints:\n{tracked}"
        ))
    }

    /// Re-issues every breakpoint recorded for `file` against a fresh process
    /// and refreshes the numbers it assigns. Returns one summary line each.
    pub async fn replay_all<C: DebuggerChannel>(
        &mut self,
        channel: &mut C,
        file: &Path,
    ) -> Result<Vec<String>> {
        let keys: Vec<BreakpointKey> = self
            .records
            .keys()
            .filter(|key| key.file == file)
            .cloned()
            .collect();

        let mut summary = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(record) = self.records.get_mut(&key) else {
                continue;
            };
            let response = channel.exchange(&record.command).await?;
            record.number = parse_breakpoint_number(&response);
            match &record.number {
                Some(number) => summary.push(format!("Restored breakpoint {number} at {key}")),
                None => {
                    warn!("Replaying {key} got no confirmation: {response}");
                    summary.push(format!("Could not confirm breakpoint at {key}: {response}"));
                }
            }
        }
        Ok(summary)
    }
}

/// Resolves `file` against the project root first, then as given.
fn resolve_key(project_root: &Path, file: &str, line: u32) -> Result<(BreakpointKey, PathBuf)> {
    let given = PathBuf::from(file);
    let found = [project_root.join(&given), given.clone()]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| DebugError::FileNotFound(given))?;
    let file = found.canonicalize()?;
    let relative = file
        .strip_prefix(project_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| file.clone());
    Ok((BreakpointKey { file, line }, relative))
}

fn with_notes(text: String, notes: &[String]) -> String {
    if notes.is_empty() {
        text
    } else {
        format!("{text}\n\n{}", notes.join("\n"))
    }
}
