//! Conductor CLI: run, resume, inspect and dry-run orchestrations.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use conductor::decompose::{AmbiguousScopeError, EmptySelectorError};
use conductor::exit_codes;
use conductor::implement::{CycleError, DeadlockError};
use conductor::io::checkpoint::{SchemaVersionError, SpecHashError};
use conductor::io::config::{Config, load_config};
use conductor::io::lock::LockHeldError;
use conductor::io::store::CliTaskStore;
use conductor::logging;
use conductor::run::{
    InterruptedError, IterationCapError, MissingAcceptanceError, Orchestrator, StartOptions,
    discover_repo_root, install_interrupt_handler,
};
use conductor::status::{SelectorRequiredError, dry_run, render_dry_run, render_status, status};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Unattended spec-to-merge orchestration over a git-native issue tracker"
)]
struct Cli {
    /// Emit machine-readable JSON (status, dry-run, error envelopes).
    #[arg(long, global = true)]
    json: bool,

    /// Path to conductor.toml (defaults to ./conductor.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run from a specification.
    Run {
        /// Specification file to freeze and implement.
        #[arg(long)]
        spec: PathBuf,
        /// Base branch the run builds on.
        #[arg(long, default_value = "main")]
        base: String,
        /// Publish a dedicated integration branch instead of pushing to base.
        #[arg(long)]
        integration_branch: bool,
        /// Adopt pre-existing tasks carrying this label instead of spawning
        /// a decomposition agent.
        #[arg(long)]
        adopt: Option<String>,
    },
    /// Resume the most recent run, or a named one.
    Resume {
        run_id: Option<String>,
    },
    /// Report the state of one run or all runs. Read-only.
    Status {
        run_id: Option<String>,
    },
    /// Compute and print the schedule without spawning any agent. Read-only.
    DryRun {
        #[arg(long)]
        spec: PathBuf,
        #[arg(long, default_value = "main")]
        base: String,
        #[arg(long)]
        integration_branch: bool,
        #[arg(long)]
        adopt: Option<String>,
    },
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    let config = match load_cli_config(&cli) {
        Ok(config) => config,
        Err(err) => return fail(&err, cli.json, exit_codes::CONFIG),
    };

    match &cli.command {
        Command::Run {
            spec,
            base,
            integration_branch,
            adopt,
        } => {
            if let Err(err) = install_interrupt_handler() {
                return fail(&err, cli.json, exit_codes::CONFIG);
            }
            let orchestrator = (|| -> Result<Orchestrator> {
                let repo_root = discover_repo_root(&std::env::current_dir()?)?;
                Orchestrator::start(
                    config,
                    StartOptions {
                        spec_path: spec.clone(),
                        base_branch: base.clone(),
                        integration_branch: *integration_branch,
                        adopt: adopt.clone(),
                        repo_root,
                    },
                )
            })();
            match orchestrator {
                Ok(orchestrator) => drive(orchestrator, cli.json),
                Err(err) => fail(&err, cli.json, exit_codes::CONFIG),
            }
        }
        Command::Resume { run_id } => {
            if let Err(err) = install_interrupt_handler() {
                return fail(&err, cli.json, exit_codes::CONFIG);
            }
            let orchestrator = (|| -> Result<Orchestrator> {
                let repo_root = discover_repo_root(&std::env::current_dir()?)?;
                Orchestrator::resume(config, run_id.clone(), repo_root, None)
            })();
            match orchestrator {
                Ok(orchestrator) => drive(orchestrator, cli.json),
                Err(err) => fail(&err, cli.json, exit_codes::CONFIG),
            }
        }
        Command::Status { run_id } => {
            match status(&config.state_root(), run_id.as_deref()) {
                Ok(statuses) => {
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&statuses)
                                .unwrap_or_else(|_| "[]".to_string())
                        );
                    } else if statuses.is_empty() {
                        println!("no runs found");
                    } else {
                        println!("{}", render_status(&statuses));
                    }
                    ExitCode::from(exit_codes::OK as u8)
                }
                Err(err) => fail(&err, cli.json, exit_codes::CONFIG),
            }
        }
        Command::DryRun {
            spec,
            base,
            integration_branch,
            adopt,
        } => {
            let report = (|| {
                let repo_root = discover_repo_root(&std::env::current_dir()?)?;
                let store = CliTaskStore::new(config.tracker_command.clone(), repo_root);
                dry_run(
                    &config,
                    &store,
                    spec,
                    base,
                    *integration_branch,
                    adopt.as_deref(),
                )
            })();
            match report {
                Ok(report) => {
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&report)
                                .unwrap_or_else(|_| "{}".to_string())
                        );
                    } else {
                        println!("{}", render_dry_run(&report));
                    }
                    ExitCode::from(exit_codes::OK as u8)
                }
                Err(err) => fail(&err, cli.json, exit_codes::CONFIG),
            }
        }
    }
}

fn load_cli_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("conductor.toml"));
    load_config(&path)
}

fn drive(mut orchestrator: Orchestrator, json: bool) -> ExitCode {
    use conductor::core::types::RunPhase;

    let outcome = orchestrator.drive();
    let released = orchestrator.finish();
    match (outcome, released) {
        (Ok(RunPhase::Completed), Ok(())) => ExitCode::from(exit_codes::OK as u8),
        (Ok(_), Ok(())) => ExitCode::from(exit_codes::RUNTIME as u8),
        (Ok(_), Err(err)) => fail(&err, json, exit_codes::RUNTIME),
        // The run error is the interesting one; a failed lock release at
        // this point only means the next acquirer does a liveness check.
        (Err(err), _) => fail(&err, json, exit_codes::RUNTIME),
    }
}

/// Stable (exit code, error code) classification for typed failures.
fn classify(err: &anyhow::Error) -> (i32, &'static str) {
    if err.downcast_ref::<LockHeldError>().is_some() {
        return (exit_codes::PRECONDITION, "run_locked");
    }
    if err.downcast_ref::<AmbiguousScopeError>().is_some() {
        return (exit_codes::PRECONDITION, "ambiguous_scope");
    }
    if err.downcast_ref::<EmptySelectorError>().is_some() {
        return (exit_codes::PRECONDITION, "empty_selector");
    }
    if err.downcast_ref::<SelectorRequiredError>().is_some() {
        return (exit_codes::PRECONDITION, "selector_required");
    }
    if err.downcast_ref::<MissingAcceptanceError>().is_some() {
        return (exit_codes::PRECONDITION, "missing_acceptance");
    }
    if err.downcast_ref::<SchemaVersionError>().is_some()
        || err.downcast_ref::<SpecHashError>().is_some()
    {
        return (exit_codes::RUNTIME, "integrity");
    }
    if err.downcast_ref::<CycleError>().is_some() {
        return (exit_codes::RUNTIME, "dependency_cycle");
    }
    if err.downcast_ref::<DeadlockError>().is_some() {
        return (exit_codes::RUNTIME, "deadlock");
    }
    if err.downcast_ref::<InterruptedError>().is_some() {
        return (exit_codes::RUNTIME, "interrupted");
    }
    if err.downcast_ref::<IterationCapError>().is_some() {
        return (exit_codes::PARTIAL, "iteration_cap");
    }
    (0, "")
}

/// Report an error in the selected format and map it to an exit code.
///
/// Typed failures carry their category; anything else falls back to the
/// stage default (`CONFIG` before orchestration starts, `RUNTIME` after).
fn fail(err: &anyhow::Error, json: bool, default_code: i32) -> ExitCode {
    let (code, error_code) = match classify(err) {
        (0, _) => (
            default_code,
            if default_code == exit_codes::CONFIG {
                "config"
            } else {
                "runtime"
            },
        ),
        classified => classified,
    };
    if json {
        let envelope = serde_json::json!({
            "error": {
                "code": error_code,
                "message": format!("{err:#}"),
            }
        });
        eprintln!("{envelope}");
    } else {
        eprintln!("error: {err:#}");
    }
    ExitCode::from(code as u8)
}
