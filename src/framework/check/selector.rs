//! Task selector resolution.
//!
//! A selector is either an explicit list of names/patterns, a named package
//! from the manifest, or the default "everything except the `filter`
//! package". Patterns are regexes anchored at the start of the task name,
//! matching the original CLI's semantics. Resolution failures are typed and
//! fatal for the run; they surface before anything is scheduled.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

/// Reserved package name whose entries are subtracted from the default
/// "all" selection.
pub const FILTER_PACKAGE: &str = "filter";

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("no tasks matched selector entries {0:?}")]
    NoMatch(Vec<String>),

    #[error("unknown package '{0}'")]
    UnknownPackage(String),

    #[error("package '{0}' resolved to zero tasks")]
    EmptyPackage(String),

    #[error("the 'filter' package excludes every available task")]
    AllTasksFiltered,

    #[error("invalid task pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("failed to load package manifest {path}: {reason}")]
    ManifestLoad { path: String, reason: String },
}

/// What the operator asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSelector {
    /// Everything registered, minus the `filter` package.
    All,
    /// Explicit names or patterns, e.g. `"cluster.version;node.*"`.
    Tasks(Vec<String>),
    /// A named group of patterns from the manifest.
    Package(String),
}

impl TaskSelector {
    /// Parse the CLI's `--tasks` value: entries separated by `;`, whitespace
    /// ignored.
    pub fn from_task_list(raw: &str) -> Self {
        let entries: Vec<String> = raw
            .split(';')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        TaskSelector::Tasks(entries)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PackageSpec {
    #[serde(default)]
    tasks: Vec<String>,
}

/// Named groups of task patterns, loaded from a YAML manifest shaped like
/// `critical: { tasks: ["cluster.*", "db.active_sessions"] }`.
#[derive(Debug, Clone, Default)]
pub struct PackageManifest {
    packages: HashMap<String, Vec<String>>,
}

impl PackageManifest {
    pub fn load(path: &Path) -> Result<Self, SelectorError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|e| SelectorError::ManifestLoad {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        let parsed: HashMap<String, PackageSpec> =
            serde_yaml::from_str(&raw).map_err(|e| SelectorError::ManifestLoad {
                path: display,
                reason: e.to_string(),
            })?;
        Ok(Self {
            packages: parsed
                .into_iter()
                .map(|(name, spec)| (name, spec.tasks))
                .collect(),
        })
    }

    #[cfg(test)]
    pub fn from_entries(entries: &[(&str, &[&str])]) -> Self {
        Self {
            packages: entries
                .iter()
                .map(|(name, tasks)| {
                    (
                        name.to_string(),
                        tasks.iter().map(|t| t.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    fn get(&self, name: &str) -> Option<&[String]> {
        self.packages.get(name).map(Vec::as_slice)
    }
}

/// Resolve a selector against the discovered task names. The result is in
/// name order and never empty.
pub fn resolve(
    selector: &TaskSelector,
    available: &[String],
    manifest: &PackageManifest,
) -> Result<Vec<String>, SelectorError> {
    match selector {
        TaskSelector::Tasks(entries) => {
            // Explicit entries are strict: every one must match something.
            let mut matched = BTreeSet::new();
            for entry in entries {
                let hits = match_entry(entry, available)?;
                if hits.is_empty() {
                    return Err(SelectorError::NoMatch(vec![entry.clone()]));
                }
                matched.extend(hits);
            }
            if matched.is_empty() {
                return Err(SelectorError::NoMatch(entries.clone()));
            }
            Ok(matched.into_iter().collect())
        }
        TaskSelector::Package(name) => {
            let patterns = manifest
                .get(name)
                .ok_or_else(|| SelectorError::UnknownPackage(name.clone()))?;
            let patterns: Vec<String> = patterns.to_vec();
            let matched = match_entries(&patterns, available)?;
            if matched.is_empty() {
                return Err(SelectorError::EmptyPackage(name.clone()));
            }
            Ok(matched.into_iter().collect())
        }
        TaskSelector::All => {
            let filtered: BTreeSet<String> = match manifest.get(FILTER_PACKAGE) {
                Some(patterns) => match_entries(patterns, available)?,
                None => BTreeSet::new(),
            };
            let selected: Vec<String> = available
                .iter()
                .filter(|name| !filtered.contains(*name))
                .cloned()
                .collect();
            if selected.is_empty() && !available.is_empty() {
                return Err(SelectorError::AllTasksFiltered);
            }
            Ok(selected)
        }
    }
}

/// Union of exact matches and start-anchored pattern matches for each entry.
/// Entries that match nothing are silently dropped; the caller decides
/// whether that is an error.
fn match_entries(
    entries: &[String],
    available: &[String],
) -> Result<BTreeSet<String>, SelectorError> {
    let mut matched = BTreeSet::new();
    for entry in entries {
        matched.extend(match_entry(entry, available)?);
    }
    Ok(matched)
}

fn match_entry(entry: &str, available: &[String]) -> Result<BTreeSet<String>, SelectorError> {
    let mut matched = BTreeSet::new();
    if available.iter().any(|name| name == entry) {
        matched.insert(entry.to_string());
    }
    let pattern =
        Regex::new(&format!("^(?:{entry})")).map_err(|source| SelectorError::InvalidPattern {
            pattern: entry.to_string(),
            source,
        })?;
    for name in available {
        if pattern.is_match(name) {
            matched.insert(name.clone());
        }
    }
    Ok(matched)
}
