use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{Result, TaskError};
use crate::runtime::task::{Task, TaskDefinition};

/// Compiled-in task definitions the runner can execute, keyed by task name.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: BTreeMap<String, Arc<TaskDefinition>>,
}

impl TaskCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A, R>(&mut self, task: &Task<A, R>) -> &mut Self
    where
        A: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
    {
        self.register_definition(Arc::clone(task.definition()))
    }

    /// A later registration under the same name replaces the earlier one.
    pub fn register_definition(&mut self, definition: Arc<TaskDefinition>) -> &mut Self {
        if let Some(previous) = self.tasks.insert(definition.name.clone(), definition) {
            warn!(task = %previous.name, "task registered twice; keeping the latest");
        }
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<TaskDefinition>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))
    }

    /// Looks a definition up by the name of the function implementing it,
    /// falling back to the task name.
    pub fn find_function(&self, function_name: &str) -> Result<Arc<TaskDefinition>> {
        self.tasks
            .values()
            .find(|definition| definition.function_name == function_name)
            .cloned()
            .map_or_else(|| self.get(function_name), Ok)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::TaskBuilder;

    #[test]
    fn functions_resolve_by_function_name_or_task_name() {
        let tick = TaskBuilder::new("tick")
            .function_name("countdown")
            .build(|n: u32| Ok(n))
            .unwrap();
        let add = TaskBuilder::new("add").build(|(a, b): (i64, i64)| Ok(a + b)).unwrap();
        let mut catalog = TaskCatalog::new();
        catalog.register(&tick).register(&add);

        assert_eq!(catalog.find_function("countdown").unwrap().name, "tick");
        assert_eq!(catalog.find_function("add").unwrap().name, "add");
        assert_eq!(catalog.get("nope").unwrap_err().kind(), "UnknownTask");
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["add", "tick"]);
    }
}
