use std::path::PathBuf;

use crate::error::{Result, TaskError};

pub const API_URL_VAR: &str = "NUMEROUS_API_URL";
pub const ACCESS_TOKEN_VAR: &str = "NUMEROUS_API_ACCESS_TOKEN";
pub const ORGANIZATION_ID_VAR: &str = "NUMEROUS_ORGANIZATION_ID";
pub const TASK_INSTANCE_ID_VAR: &str = "NUMEROUS_TASK_INSTANCE_ID";
pub const TASK_FUNCTION_NAME_VAR: &str = "NUMEROUS_TASK_FUNCTION_NAME";
pub const MANIFEST_PATH_VAR: &str = "NUMEROUS_MANIFEST_PATH";
pub const MOCK_REMOTE_LOGGING_VAR: &str = "NUMEROUS_MOCK_REMOTE_LOGGING";
pub const LOCAL_WORKERS_VAR: &str = "NUMEROUS_LOCAL_WORKERS";

/// Process-level configuration read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Presence selects the remote backend.
    pub api_url: Option<String>,
    pub access_token: Option<String>,
    pub organization_id: Option<String>,
    /// Runner side: the instance this process executes.
    pub task_instance_id: Option<String>,
    /// Runner side: the task to locate in the manifest.
    pub task_function_name: Option<String>,
    pub manifest_path: Option<PathBuf>,
    pub mock_remote_logging: bool,
    pub local_workers: Option<usize>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let local_workers = match get(LOCAL_WORKERS_VAR) {
            Some(raw) => {
                let workers: usize = raw.parse().map_err(|_| {
                    TaskError::InvalidConfig(format!("{LOCAL_WORKERS_VAR} must be a number, got {raw:?}"))
                })?;
                if workers == 0 {
                    return Err(TaskError::InvalidConfig(format!(
                        "{LOCAL_WORKERS_VAR} must be at least 1"
                    )));
                }
                Some(workers)
            }
            None => None,
        };

        Ok(Self {
            api_url: get(API_URL_VAR).map(|url| url.trim_end_matches('/').to_string()),
            access_token: get(ACCESS_TOKEN_VAR),
            organization_id: get(ORGANIZATION_ID_VAR),
            task_instance_id: get(TASK_INSTANCE_ID_VAR),
            task_function_name: get(TASK_FUNCTION_NAME_VAR),
            manifest_path: get(MANIFEST_PATH_VAR).map(PathBuf::from),
            mock_remote_logging: get(MOCK_REMOTE_LOGGING_VAR).is_some_and(|v| parse_flag(&v)),
            local_workers,
        })
    }

    pub fn uses_remote_backend(&self) -> bool {
        self.api_url.is_some()
    }

    pub fn worker_count(&self) -> usize {
        self.local_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
