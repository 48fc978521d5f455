//! Smoke-test harness for `hpo-core`/`hpo-scheduler`: a small `clap`-driven
//! binary exercising the parallel search runner in-process, and the local
//! scheduler out-of-process, against toy objectives.
//!
//! This is not a product CLI (constructing a fully-configured runner for a
//! real workload is out of this crate's scope) — it is the one illustrative
//! binary that proves the two subsystems actually run end-to-end.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use hpo_core::algorithm::{BayesAlgorithm, GridAlgorithm, RandomAlgorithm};
use hpo_core::{ConfigValue, EvalError, Expr, ParallelSearchRunner};
use hpo_scheduler::{ExecutionMode, Scheduler, SchedulerConfig, SchedulerInput};

#[derive(Parser, Debug)]
#[command(author, version, about = "hpo-core / hpo-scheduler smoke-test harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an in-process search over a toy quadratic objective.
    Search {
        #[arg(long, value_enum, default_value_t = AlgoArg::Random)]
        algorithm: AlgoArg,
        #[arg(long, default_value_t = 200)]
        max_steps: u64,
        #[arg(long, default_value_t = 4)]
        max_workers: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Drive the local scheduler through one round of trials against a
    /// Python template that writes its result back to `result.json`.
    Schedule {
        /// Python interpreter to invoke (must be on PATH).
        #[arg(long, default_value = "python3")]
        interpreter: String,
        /// Number of trials to submit.
        #[arg(long, default_value_t = 2)]
        tasks: usize,
        /// Directory to materialize per-trial config/result/log files in.
        #[arg(long)]
        out_dir: Option<std::path::PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AlgoArg {
    Grid,
    Random,
    Bayes,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Search { algorithm, max_steps, max_workers, seed } => {
            run_search(algorithm, max_steps, max_workers, seed)
        }
        Command::Schedule { interpreter, tasks, out_dir } => run_schedule(interpreter, tasks, out_dir),
    }
}

/// Minimizes `f(x, y) = (x - 3)^2 + (y + 2)^2` over `x, y in [-10, 10]`,
/// whose minimum of `0` sits at `(3, -2)`.
fn run_search(algorithm: AlgoArg, max_steps: u64, max_workers: usize, seed: Option<u64>) -> Result<()> {
    let space = hpo_core::SpaceTemplate::Map(vec![
        ("x".to_string(), hpo_core::SpaceTemplate::Leaf(hpo_core::value::uniform(-10.0, 10.0)?)),
        ("y".to_string(), hpo_core::SpaceTemplate::Leaf(hpo_core::value::uniform(-10.0, 10.0)?)),
    ]);

    let eval = |cfg: &ConfigValue| -> Result<(ConfigValue, ConfigValue), EvalError> {
        let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
        let y = cfg.get("y").and_then(ConfigValue::as_f64).unwrap_or(0.0);
        let loss = (x - 3.0).powi(2) + (y + 2.0).powi(2);
        Ok((ConfigValue::Float(loss), ConfigValue::Null))
    };

    let best = match algorithm {
        AlgoArg::Grid => {
            let runner = ParallelSearchRunner::new(GridAlgorithm::new())
                .spaces(space)
                .eval(eval)
                .max_steps(max_steps)
                .max_workers(max_workers)
                .minimize(Expr::ret(), "loss")
                .rank(5);
            runner.run().context("grid search failed")?
        }
        AlgoArg::Random => {
            let mut algo = RandomAlgorithm::new();
            if let Some(s) = seed {
                algo = algo.seed(s);
            }
            let runner = ParallelSearchRunner::new(algo)
                .spaces(space)
                .eval(eval)
                .max_steps(max_steps)
                .max_workers(max_workers)
                .minimize(Expr::ret(), "loss")
                .rank(5);
            runner.run().context("random search failed")?
        }
        AlgoArg::Bayes => {
            let mut algo = BayesAlgorithm::new();
            if let Some(s) = seed {
                algo = algo.seed(s);
            }
            let runner = ParallelSearchRunner::new(algo)
                .spaces(space)
                .eval(eval)
                .max_steps(max_steps)
                .max_workers(max_workers)
                .minimize(Expr::ret(), "loss")
                .rank(5);
            runner.run().context("bayes search failed")?
        }
    };

    match best {
        Some((config, ret, _metrics)) => {
            println!("best config: {}", config.to_json());
            println!("best loss:   {}", ret.to_json());
        }
        None => println!("no successful trial"),
    }
    Ok(())
}

const DEMO_TEMPLATE: &str = "\
import json
import sys

main_config = {\"lr\": 0.1, \"depth\": 1}

if __name__ == \"__main__\":
    loss = (main_config[\"lr\"] - 0.01) ** 2 + main_config[\"depth\"]
    with open(\"result.json\", \"w\") as f:
        json.dump({\"loss\": loss}, f)
";

fn run_schedule(interpreter: String, tasks: usize, out_dir: Option<std::path::PathBuf>) -> Result<()> {
    let workdir = match out_dir {
        Some(d) => {
            std::fs::create_dir_all(&d)?;
            tempfile::TempDir::new_in(&d)?
        }
        None => tempfile::tempdir()?,
    };
    let template_path = workdir.path().join("template.py");
    std::fs::write(&template_path, DEMO_TEMPLATE)?;

    let cfg = SchedulerConfig::new(
        "hpo-cli-demo",
        "smoke",
        ExecutionMode::Local { interpreter, template_path, out_dir: workdir.path().to_path_buf() },
    );
    let (input, output, handle) = Scheduler::spawn(cfg);

    for i in 0..tasks {
        let params = hpo_core::expr::map_of(vec![("lr", ConfigValue::Float(0.01 + i as f64 * 0.001))]);
        input.send(SchedulerInput::NewTask(params))?;
    }
    input.send(SchedulerInput::Stop)?;

    loop {
        match output.recv_timeout(Duration::from_secs(10)) {
            Ok(report) => {
                let (defined, waiting, running, finished, success, abnormal) = report.counts();
                log::info!(
                    "tick: defined={defined} waiting={waiting} running={running} finished={finished} success={success} abnormal={abnormal}"
                );
                if defined == 0 && waiting == 0 && running == 0 {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => anyhow::bail!("scheduler loop failed: {e}"),
        Err(_) => anyhow::bail!("scheduler thread panicked"),
    }
    println!("scheduler demo complete; artifacts under {}", workdir.keep().display());
    Ok(())
}
