use std::thread;
use std::time::Duration;

use numerous_tasks::runner::TaskCatalog;
use numerous_tasks::runner::cli::run_main;
use numerous_tasks::{TaskBuilder, TaskFailure};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct AddArgs {
    a: i64,
    #[serde(default = "default_b")]
    b: i64,
}

fn default_b() -> i64 {
    3
}

#[derive(Debug, Serialize, Deserialize)]
struct CountdownArgs {
    from: u32,
    #[serde(default)]
    step_ms: u64,
}

fn catalog() -> anyhow::Result<TaskCatalog> {
    let add = TaskBuilder::new("add")
        .doc("Adds two integers.")
        .param::<i64>("a")
        .param_with_default::<i64>("b", 3)
        .build(|args: AddArgs| Ok::<_, TaskFailure>(args.a + args.b))?;

    let countdown = TaskBuilder::new("countdown")
        .doc("Counts down, reporting progress, until zero or a stop request.")
        .param::<u32>("from")
        .param_with_default::<u64>("step_ms", 0)
        .build_with_control(|control, args: CountdownArgs| {
            for remaining in (0..args.from).rev() {
                control.check_cancelled()?;
                let done = f64::from(args.from - remaining) / f64::from(args.from.max(1));
                control.update_progress(done * 100.0, Some(&format!("{remaining} left")));
                thread::sleep(Duration::from_millis(args.step_ms));
            }
            control.info("countdown finished");
            Ok::<_, TaskFailure>(args.from)
        })?;

    let mut catalog = TaskCatalog::new();
    catalog.register(&add).register(&countdown);
    Ok(catalog)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let code = run_main(catalog()?).await?;
    std::process::exit(code);
}
