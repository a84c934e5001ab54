use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// Where one task's code lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Source artifact, relative to the manifest file.
    pub source: PathBuf,
    /// Callable inside the artifact; defaults to the task name.
    #[serde(default)]
    pub function: Option<String>,
}

/// Deployment manifest: a flat `tasks` map from task name to its entry.
///
/// ```yaml
/// tasks:
///   add:
///     source: tasks/math.rs
///   countdown:
///     source: tasks/timers.rs
///     function: countdown_from
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub tasks: BTreeMap<String, ManifestEntry>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TaskError::Manifest(format!("failed to read manifest {}: {e}", path.display()))
        })?;
        let mut manifest = Self::parse(&content).map_err(|e| match e {
            TaskError::Manifest(message) => {
                TaskError::Manifest(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        manifest.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(manifest)
    }

    /// Parses YAML (and therefore JSON) manifest text.
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| TaskError::Manifest(format!("invalid manifest: {e}")))
    }

    pub fn locate(&self, task_name: &str) -> Result<&ManifestEntry> {
        self.tasks.get(task_name).ok_or_else(|| {
            TaskError::Manifest(format!("task {task_name:?} is not listed in the manifest"))
        })
    }

    /// The callable name the entry points at.
    pub fn function_name<'a>(&'a self, task_name: &'a str) -> Result<&'a str> {
        let entry = self.locate(task_name)?;
        Ok(entry.function.as_deref().unwrap_or(task_name))
    }

    pub fn source_path(&self, entry: &ManifestEntry) -> PathBuf {
        if entry.source.is_absolute() {
            entry.source.clone()
        } else {
            self.base_dir.join(&entry.source)
        }
    }
}
