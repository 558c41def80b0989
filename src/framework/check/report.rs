//! Report accumulation for a check run.
//!
//! Each executed task produces exactly one `TaskReport`; the `CheckReport`
//! collects them concurrently from worker completions and is finalized once,
//! after every worker has joined, into an ordered `CheckSummary`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl TaskStatus {
    fn severity(self) -> u8 {
        match self {
            TaskStatus::Pass => 0,
            TaskStatus::Skip => 1,
            TaskStatus::Warn => 2,
            TaskStatus::Fail => 3,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pass => "pass",
            TaskStatus::Warn => "warn",
            TaskStatus::Fail => "fail",
            TaskStatus::Skip => "skip",
        };
        write!(f, "{s}")
    }
}

/// The single outcome record for one task execution. Status only ever
/// escalates: a task that recorded a failure stays failed no matter what is
/// appended afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_name: String,
    pub status: TaskStatus,
    pub messages: Vec<String>,
}

impl TaskReport {
    pub fn new(task_name: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            status: TaskStatus::Pass,
            messages: Vec::new(),
        }
    }

    fn escalate(&mut self, status: TaskStatus) {
        if status.severity() > self.status.severity() {
            self.status = status;
        }
    }

    /// Informational message; does not change the status.
    pub fn add_info(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
        self.escalate(TaskStatus::Warn);
    }

    pub fn add_fail(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
        self.escalate(TaskStatus::Fail);
    }

    /// Used by the scheduler for tasks skipped before execution; skip is a
    /// terminal status for such reports.
    pub fn mark_skipped(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
        self.status = TaskStatus::Skip;
    }
}

/// Thread-safe accumulator; `add_task_report` may be called from any worker
/// completion path concurrently.
pub struct CheckReport {
    target: String,
    created_at: DateTime<Utc>,
    entries: Mutex<Vec<TaskReport>>,
}

impl CheckReport {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            created_at: Utc::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add_task_report(&self, report: TaskReport) {
        self.entries
            .lock()
            .expect("check report lock poisoned")
            .push(report);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("check report lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the accumulator into the final summary. Taking `self` by value
    /// makes "export exactly once, after the join" a compile-time property.
    pub fn finalize(self) -> CheckSummary {
        let mut entries = self.entries.into_inner().expect("check report lock poisoned");
        // Completion order is nondeterministic; order the final report by
        // task name so runs are reproducible.
        entries.sort_by(|a, b| a.task_name.cmp(&b.task_name));

        let mut counts = StatusCounts::default();
        for entry in &entries {
            match entry.status {
                TaskStatus::Pass => counts.pass += 1,
                TaskStatus::Warn => counts.warn += 1,
                TaskStatus::Fail => counts.fail += 1,
                TaskStatus::Skip => counts.skip += 1,
            }
        }

        CheckSummary {
            target: self.target,
            created_at: self.created_at,
            counts,
            entries,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
    pub skip: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pass + self.warn + self.fail + self.skip
    }
}

/// Final, ordered result of a check run.
#[derive(Debug, Clone, Serialize)]
pub struct CheckSummary {
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub counts: StatusCounts,
    pub entries: Vec<TaskReport>,
}

impl CheckSummary {
    /// Structured, format-independent view grouped by outcome, in the shape
    /// consumed by exporters: `{"fail": {task: [msgs]}, "warn": ..., "skip":
    /// ..., "all": ...}` plus the counts.
    pub fn to_map(&self) -> serde_json::Value {
        let mut fail = BTreeMap::new();
        let mut warn = BTreeMap::new();
        let mut skip = BTreeMap::new();
        let mut all = BTreeMap::new();

        for entry in &self.entries {
            all.insert(entry.task_name.clone(), entry.messages.clone());
            match entry.status {
                TaskStatus::Fail => {
                    fail.insert(entry.task_name.clone(), entry.messages.clone());
                }
                TaskStatus::Warn => {
                    warn.insert(entry.task_name.clone(), entry.messages.clone());
                }
                TaskStatus::Skip => {
                    skip.insert(entry.task_name.clone(), entry.messages.clone());
                }
                TaskStatus::Pass => {}
            }
        }

        serde_json::json!({
            "target": self.target,
            "counts": self.counts,
            "fail": fail,
            "warn": warn,
            "skip": skip,
            "all": all,
        })
    }
}
