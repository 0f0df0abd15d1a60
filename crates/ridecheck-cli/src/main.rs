use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use ridecheck_core::DuplicatePolicy;
use ridecheck_runner as runner;
use ridecheck_runner::{FixtureStatus, ScenarioOutcome};

#[derive(Parser)]
#[command(
    name = "ridecheck",
    version,
    about = "Correctness harness for the dispatch and matching concurrency exercises"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every fixture in a directory against the dispatch executable.
    Sweep {
        /// Path to the dispatch executable under test.
        program: PathBuf,
        /// Directory of fixture files, run in name order.
        fixtures: PathBuf,
        /// Trials per fixture; all must pass.
        #[arg(long, default_value_t = 10)]
        reps: u32,
        /// Wall-clock bound per trial, in seconds.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
        /// Treat duplicate logical times in a fixture as a hard error.
        #[arg(long)]
        strict: bool,
        /// Where failing output is persisted for postmortem inspection.
        #[arg(long, default_value = "debug")]
        debug_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print synthetic fixture lines to stdout.
    Gen {
        #[arg(default_value_t = 50)]
        count: usize,
        /// Seed for reproducible output.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Drive the matching simulator through the fixed scenario matrix.
    Scenarios {
        /// Scenario number or inclusive range `min-max`; all when omitted.
        selection: Option<String>,
        /// Unlock the slow stress scenarios for the run-everything default.
        #[arg(short = 'e', long)]
        extra: bool,
        #[arg(long, default_value = "./ubler_test")]
        program: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run the Monte-Carlo estimator demos, streaming their output.
    Demos {
        #[arg(default_value = "./uber-pi")]
        program: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Sweep {
            program,
            fixtures,
            reps,
            timeout_secs,
            strict,
            debug_dir,
            json,
        } => {
            let invocation = runner::Invocation::new(program);
            let options = runner::SweepOptions {
                repetitions: reps,
                timeout: Duration::from_secs(timeout_secs),
                debug_dir,
                duplicates: if strict {
                    DuplicatePolicy::Reject
                } else {
                    DuplicatePolicy::LastWins
                },
            };
            let reports = runner::sweep_fixtures(&invocation, &fixtures, &options, |report| {
                if !json {
                    println!("{}\t{}", report.fixture, paint_status(&report.status));
                }
            })?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sweep",
                    "generated_at": Utc::now().to_rfc3339(),
                    "fixtures": reports,
                })));
            }
        }
        Commands::Gen { count, seed } => {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            print!("{}", runner::generate_fixture(count, &mut rng));
        }
        Commands::Scenarios {
            selection,
            extra,
            program,
            json,
        } => {
            let selection = runner::parse_selection(selection.as_deref())?;
            let chosen = runner::select_scenarios(&runner::scenario_matrix(), selection, extra);
            let (reports, summary) = runner::run_scenarios(&program, &chosen, |report| {
                if !json {
                    print_scenario(report);
                }
            })?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "scenarios",
                    "generated_at": Utc::now().to_rfc3339(),
                    "scenarios": reports,
                    "summary": summary,
                })));
            }
            println!("{BOLD}Summary:{RESET}");
            println!(
                "{} tests {GREEN}succeeded, {RESET}{} tests {RED}failed. {RESET}{} tests total.",
                summary.succeeded, summary.failed, summary.total
            );
        }
        Commands::Demos { program } => {
            println!("Running tests....");
            println!(
                "The more concurrency you are able to achieve, the larger the fraction\n of time drivers are driving, which makes everyone happy!\n"
            );
            for demo in runner::demo_matrix() {
                println!("\n{}:", demo.description);
                if runner::run_demo(&program, &demo)? {
                    println!(
                        "Process timed out after {} seconds",
                        runner::DEMO_TIMEOUT.as_secs()
                    );
                }
            }
        }
    }
    Ok(None)
}

const GREEN: &str = "\x1b[92m";
const RED: &str = "\x1b[91m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Stateless status formatting, applied only at the printing boundary.
fn paint_status(status: &FixtureStatus) -> String {
    match status {
        FixtureStatus::Passed => format!("{GREEN}passed{RESET}"),
        FixtureStatus::Failed { artifact } => {
            format!("{RED}failed{RESET} Output saved in {}", artifact.display())
        }
        FixtureStatus::TimedOut { artifact } => {
            format!("{RED}timed out{RESET} Output saved in {}", artifact.display())
        }
        FixtureStatus::Malformed { message } => format!("{RED}malformed{RESET} {message}"),
    }
}

fn print_scenario(report: &runner::ScenarioReport) {
    println!(
        "{BOLD}Test {}:\nCommand: {}\nDescription: {}{RESET}",
        report.number, report.command, report.description
    );
    match &report.outcome {
        ScenarioOutcome::Passed => println!("{GREEN}Test passed!{RESET}\n"),
        ScenarioOutcome::Failed { iteration, output } => {
            println!("Test {RED}failed{RESET} on iteration {iteration} with error message:");
            println!("{RED}{output}{RESET}");
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Sweep { json, .. } | Commands::Scenarios { json, .. } => *json,
        _ => false,
    }
}
