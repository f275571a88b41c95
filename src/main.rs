//! PipeFlow CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Run a job
//! pipeflow run --workflow pipeline.yaml --apps apps.yaml --job job.yaml
//!
//! # Keep a JSON record of job and step status
//! pipeflow run -w pipeline.yaml -a apps.yaml -j job.yaml --state-file state.json
//!
//! # Check a workflow and print step numbering
//! pipeflow validate --workflow pipeline.yaml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::info;

use pipeflow::config::EngineConfig;
use pipeflow::execution::{ContextRegistry, Engine};
use pipeflow::logging::setup_logging;
use pipeflow::store::LocalStore;
use pipeflow::workflow::model::Status;
use pipeflow::workflow::{load_apps, load_job, load_workflow, WorkflowDef};
use pipeflow::{APP_NAME, VERSION};

#[derive(Parser, Debug)]
#[command(name = "pipeflow", version, about = "Workflow execution engine for scientific pipelines")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Append log records to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job of a workflow
    Run {
        #[arg(short, long)]
        workflow: PathBuf,

        #[arg(short, long)]
        apps: PathBuf,

        #[arg(short, long)]
        job: PathBuf,

        /// Engine configuration (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write job and step status to this JSON file after every change
        #[arg(long)]
        state_file: Option<PathBuf>,
    },

    /// Validate a workflow and print its step numbering
    Validate {
        #[arg(short, long)]
        workflow: PathBuf,
    },
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!();
}

fn print_numbering(workflow: &WorkflowDef) {
    let mut steps: Vec<_> = workflow.steps.values().collect();
    steps.sort_by(|a, b| (a.number, &a.letter, &a.name).cmp(&(b.number, &b.letter, &b.name)));

    println!("Workflow '{}': {} step(s)", workflow.name.bold(), steps.len());
    for step in steps {
        let depends: Vec<&str> = step.dependencies().collect();
        let depends = if depends.is_empty() {
            String::new()
        } else {
            format!(" <- {}", depends.join(", "))
        };
        println!("  {:>4}  {} ({}){}", step.label(), step.name, step.app, depends.dimmed());
    }
}

fn colored_status(status: Status) -> String {
    let text = status.to_string();
    match status {
        Status::Finished => text.green().to_string(),
        Status::Error => text.red().to_string(),
        _ => text.yellow().to_string(),
    }
}

fn run_job(
    workflow: PathBuf,
    apps: PathBuf,
    job: PathBuf,
    config: EngineConfig,
    state_file: Option<PathBuf>,
) -> Result<Status, Box<dyn std::error::Error>> {
    let mut workflow = load_workflow(&workflow)?;
    let apps = load_apps(&apps)?;
    let mut job = load_job(&job)?;

    if job.workflow_id.is_empty() {
        job.workflow_id = workflow.workflow_id.clone();
    } else {
        workflow.workflow_id = job.workflow_id.clone();
    }
    let job_id = job.job_id.clone();

    let mut store = LocalStore::new();
    if let Some(path) = state_file {
        info!("Writing job state to {}", path.display());
        store = store.with_state_file(path);
    }
    let store = Arc::new(store);
    store.add_workflow(workflow, apps);
    store.add_job(job)?;

    let registry = Arc::new(ContextRegistry::with_local(&config));
    let mut engine = Engine::new(job_id, store, registry, config);

    let result = engine.initialize().and_then(|_| engine.run());

    println!("{}", engine.timeline().gantt_chart());
    for step in engine.step_statuses() {
        println!("{} {}", step.name.bold(), serde_json::to_string(&step.map)?);
    }

    let status = engine.status_struct();
    println!();
    println!("Job {} ({}): {}", status.name, status.id, colored_status(status.status));

    result?;
    Ok(status.status)
}

fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run {
            workflow,
            apps,
            job,
            config,
            state_file,
        } => {
            let config = match config {
                Some(path) => EngineConfig::load(path)?,
                None => EngineConfig::default(),
            };
            let level = cli.log_level.unwrap_or_else(|| config.log_level.clone());
            let log_file = cli.log_file.or_else(|| config.log_file.clone());
            setup_logging(&level, log_file.as_deref())?;

            print_banner();
            let status = run_job(workflow, apps, job, config, state_file)?;
            Ok(status == Status::Finished)
        }
        Command::Validate { workflow } => {
            let level = cli.log_level.unwrap_or_else(|| "warn".to_string());
            setup_logging(&level, cli.log_file.as_deref())?;

            let workflow = load_workflow(&workflow)?;
            print_numbering(&workflow);
            println!("{}", "Workflow is valid".green());
            Ok(true)
        }
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
