use super::task::Task;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Maps task names stored on jobs to the code that runs them.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, task: Arc<dyn Task>) -> &mut Self {
        let name = name.into();
        info!("Registering task: {}", name);
        self.tasks.insert(name, task);
        self
    }

    pub fn with(mut self, name: impl Into<String>, task: Arc<dyn Task>) -> Self {
        self.register(name, task);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}
