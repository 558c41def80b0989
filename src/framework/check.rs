//! Concurrent diagnostic check framework.
//!
//! A check run resolves a task selector against the registry, executes the
//! resolved set on a bounded worker pool with per-task isolation, and
//! aggregates exactly one report entry per task. Individual task failures
//! become report rows; only setup problems (empty registry, unresolvable
//! selector, undeterminable cluster version) abort a run.

pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod selector;
pub mod task;
pub mod tasks;
