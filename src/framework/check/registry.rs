//! Explicit task registration.
//!
//! Tasks are registered once at startup with `register(target, factory)`;
//! there is no module scanning and no ambient global list. The registry is
//! constructed by the CLI and injected into the orchestrator.

use std::collections::BTreeMap;

use super::task::{DiagnosticTask, TaskFactory, TaskInfo};

struct RegisteredTask {
    target: String,
    info: TaskInfo,
    factory: TaskFactory,
}

#[derive(Default)]
pub struct TaskRegistry {
    // BTreeMap keeps discovery order stable by task name.
    entries: BTreeMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with every builtin diagnostic task.
    pub fn with_builtin_tasks() -> Self {
        let mut registry = Self::new();
        super::tasks::register_builtin(&mut registry);
        registry
    }

    /// Register a task factory under the name its metadata declares.
    /// Re-registering a name replaces the previous entry.
    pub fn register(&mut self, target: &str, factory: TaskFactory) {
        let info = factory().info();
        self.entries.insert(
            info.name.to_string(),
            RegisteredTask {
                target: target.to_string(),
                info,
                factory,
            },
        );
    }

    /// Names of every task registered for `target`, in name order.
    pub fn task_names(&self, target: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.target == target)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Metadata for every task registered for `target`.
    pub fn list(&self, target: &str) -> Vec<TaskInfo> {
        self.entries
            .values()
            .filter(|entry| entry.target == target)
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Fresh task instance; one per invocation, never shared.
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn DiagnosticTask>> {
        self.entries.get(name).map(|entry| (entry.factory)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_not_empty() {
        let registry = TaskRegistry::with_builtin_tasks();
        let names = registry.task_names("cluster");
        assert!(!names.is_empty());
        assert!(names.contains(&"cluster.version".to_string()));
        // Name order is stable.
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn instantiate_returns_fresh_instances() {
        let registry = TaskRegistry::with_builtin_tasks();
        let a = registry.instantiate("cluster.version");
        let b = registry.instantiate("cluster.version");
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(registry.instantiate("cluster.nonexistent").is_none());
    }

    #[test]
    fn unknown_target_discovers_nothing() {
        let registry = TaskRegistry::with_builtin_tasks();
        assert!(registry.task_names("proxy").is_empty());
    }
}
