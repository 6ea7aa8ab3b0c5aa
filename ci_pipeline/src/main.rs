mod local_worker;
mod metrics;
mod pipeline;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use ci_step::{Build, CoreConfig, LockRegistry, MemoryStore, ResultCode, Worker};
use clap::{Parser, Subcommand};
use eyre::WrapErr;

use crate::local_worker::LocalWorker;
use crate::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "ci-pipeline", about = "Run a CI pipeline on this host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every step of a pipeline file
    Run {
        /// Pipeline definition (JSON)
        #[arg(long)]
        file: PathBuf,
        /// Directory the worker resolves step paths against
        #[arg(long, env = "CI_WORKER_ROOT", default_value = ".")]
        root: PathBuf,
        /// Build property, `name=value`; repeatable
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
        /// Serve Prometheus metrics on this address
        #[arg(long, env = "CI_METRICS_ADDR")]
        metrics: Option<SocketAddr>,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse a pipeline file and list its steps
    Validate {
        #[arg(long)]
        file: PathBuf,
    },
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got '{s}'")),
    }
}

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    init_tracing();
    let Cli { command } = Cli::parse();

    match command {
        Command::Validate { file } => {
            let pipeline = Pipeline::load(&file).await?;
            pipeline.build_steps(&LockRegistry::new())?;
            for step in &pipeline.steps {
                println!("{}", step.name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            file,
            root,
            properties,
            metrics,
            json,
        } => {
            if let Some(listen) = metrics {
                metrics::init_metrics(listen);
            }
            let pipeline = Pipeline::load(&file).await?;
            let registry = LockRegistry::new();
            let steps = pipeline.build_steps(&registry)?;

            let root = local_worker::worker_root(&root).wrap_err("cannot resolve worker root")?;
            let worker = Worker::new(Arc::new(LocalWorker::new(root)));
            let store = Arc::new(MemoryStore::new());
            let build = Build::new(1, worker, store.clone(), CoreConfig::from_env());
            for (name, value) in properties {
                build.set_property(&name, value, "command line");
            }
            for step in steps {
                build.add_step(step)?;
            }

            let stopper = build.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, stopping build");
                    stopper.stop("interrupted by user").await;
                }
            });

            let outcome = build.run().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                for (name, step) in &outcome.steps {
                    let summary = step.summary.step.as_deref().unwrap_or("");
                    println!("{name:<24} {:<10} {summary}", step.result.as_str());
                }
                for summary in &outcome.summaries {
                    println!("  {summary}");
                }
                println!("build: {}", outcome.result);
            }

            Ok(match outcome.result {
                ResultCode::Success | ResultCode::Warnings | ResultCode::Skipped => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            })
        }
    }
}
