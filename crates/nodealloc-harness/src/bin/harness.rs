//! CLI entrypoint for the nodealloc stress harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use nodealloc_harness::{HarnessError, Scenario, run};

/// Stress tooling for nodealloc.
#[derive(Debug, Parser)]
#[command(name = "nodealloc-harness")]
#[command(about = "Stress scenarios and JSON reporting for nodealloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a scenario and emit its report as JSON.
    Run {
        /// Scenario to run (churn, growth, or mixed).
        #[arg(long, default_value = "mixed")]
        scenario: String,
        /// Number of operations to perform.
        #[arg(long, default_value_t = 100_000)]
        ops: u64,
        /// Workload seed.
        #[arg(long, default_value_t = 0x5EED)]
        seed: u64,
        /// Output path for the JSON report (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the config-time allocator selection.
    Selection,
}

fn main() -> Result<(), HarnessError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            scenario,
            ops,
            seed,
            output,
        } => {
            let scenario = Scenario::from_str_loose(&scenario)?;
            let report = run(scenario, ops, seed);
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).map_err(|source| HarnessError::Write {
                        path,
                        source,
                    })?;
                }
                None => println!("{json}"),
            }
        }
        Command::Selection => {
            let kind = nodealloc_core::AllocatorKind::configured();
            println!(
                "{} => {:?} (stateless: {})",
                nodealloc_core::ALLOCATOR_ENV,
                kind,
                kind.stateless()
            );
        }
    }
    Ok(())
}
