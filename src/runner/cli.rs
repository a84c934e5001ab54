use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::config::{
    Config, MANIFEST_PATH_VAR, TASK_FUNCTION_NAME_VAR, TASK_INSTANCE_ID_VAR,
};
use crate::runner::{RunOutcome, RunRequest, Runner, TaskCatalog};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs one task instance for the control plane", long_about = None)]
pub struct RunnerCli {
    /// Task to run, as listed in the manifest
    #[arg(env = TASK_FUNCTION_NAME_VAR)]
    pub function_name: String,

    /// Argument overrides as key=value; values are parsed as JSON when they
    /// can be
    #[arg(value_name = "KEY=VALUE")]
    pub args: Vec<String>,

    /// Instance to execute
    #[arg(long, env = TASK_INSTANCE_ID_VAR)]
    pub instance_id: Option<String>,

    /// Path to the task manifest
    #[arg(long, env = MANIFEST_PATH_VAR)]
    pub manifest: Option<PathBuf>,
}

impl RunnerCli {
    pub fn overrides(&self) -> anyhow::Result<Map<String, Value>> {
        parse_overrides(&self.args)
    }
}

pub fn parse_overrides(args: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut overrides = Map::new();
    for arg in args {
        let Some((key, raw)) = arg.split_once('=') else {
            bail!("argument {arg:?} is not of the form key=value");
        };
        if key.is_empty() {
            bail!("argument {arg:?} has an empty key");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        overrides.insert(key.to_string(), value);
    }
    Ok(overrides)
}

/// Parses the command line, runs the requested task and returns the process
/// exit code.
pub async fn run_main(catalog: TaskCatalog) -> anyhow::Result<i32> {
    let cli = RunnerCli::parse();
    let mut config = Config::from_env().context("failed to read configuration")?;
    if cli.manifest.is_some() {
        config.manifest_path = cli.manifest.clone();
    }
    let runner = Runner::from_config(&config, catalog).context("failed to set up runner")?;
    let request = RunRequest {
        function_name: cli.function_name.clone(),
        instance_id: cli.instance_id.clone(),
        overrides: cli.overrides()?,
    };

    let outcome = runner
        .run(request)
        .await
        .with_context(|| format!("failed to run task {}", cli.function_name))?;
    match &outcome {
        RunOutcome::Completed(value) => info!(task = %cli.function_name, result = %value, "task completed"),
        RunOutcome::Failed(payload) => error!(
            task = %cli.function_name,
            kind = %payload.kind,
            message = %payload.message,
            "task failed"
        ),
        RunOutcome::Cancelled => info!(task = %cli.function_name, "task cancelled"),
    }
    Ok(outcome.exit_code())
}
