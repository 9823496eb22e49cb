//! linkchain - run chain plans from the command line
//!
//! ## Commands
//!
//! - `run`: build a chain from a JSON plan, run it and report the outcome
//! - `validate`: check a plan without running it

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use linkchain_core::{Chain, ChainEvent, ChainPlan, RunOutcome};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::task::LocalSet;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "linkchain")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run chains of asynchronous tasks", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and a JSON summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chain plan
    Run {
        /// Path to the plan file (JSON)
        plan: PathBuf,

        /// Run links one after another, overriding the plan
        #[arg(long)]
        ordered: bool,
    },

    /// Validate a chain plan without running it
    Validate {
        /// Path to the plan file (JSON)
        plan: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    linkchain_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run { plan, ordered } => {
            LocalSet::new()
                .run_until(cmd_run(&plan, ordered, cli.json))
                .await
        }
        Commands::Validate { plan } => cmd_validate(&plan, cli.json),
    }
}

fn load_plan(path: &Path) -> Result<ChainPlan> {
    ChainPlan::load(path).with_context(|| format!("Failed to load plan {:?}", path))
}

fn cmd_validate(path: &Path, json: bool) -> Result<()> {
    let plan = load_plan(path)?;
    let digest = plan.digest()?;

    if json {
        let summary = json!({
            "plan": plan.name,
            "digest": digest,
            "links": plan.links.len(),
            "enabled": plan.enabled_links().count(),
            "in_order": plan.in_order,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Plan '{}' is valid", plan.name);
        println!("Digest:  {}", digest);
        println!(
            "Links:   {} ({} enabled)",
            plan.links.len(),
            plan.enabled_links().count()
        );
    }
    Ok(())
}

async fn cmd_run(path: &Path, ordered: bool, json: bool) -> Result<()> {
    let mut plan = load_plan(path)?;
    if ordered {
        plan.in_order = true;
    }
    info!(plan = %plan.name, digest = %plan.digest()?, "loaded plan");

    let chain = plan.build()?;
    if !json {
        chain.subscribe(print_progress);
    }

    let started = Instant::now();
    let outcome = chain.run().await?;
    let elapsed_ms = started.elapsed().as_millis();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary(&plan, &chain, &outcome, elapsed_ms))?
        );
    }

    match outcome {
        RunOutcome::Completed => {
            if !json {
                println!("Chain '{}' completed in {} ms", plan.name, elapsed_ms);
            }
            Ok(())
        }
        RunOutcome::Failed(report) => bail!("Chain '{}' failed: {}", plan.name, report),
    }
}

fn print_progress(event: &ChainEvent) {
    match event {
        ChainEvent::Started { links, in_order, .. } => {
            let mode = if *in_order { "ordered" } else { "unordered" };
            println!("Starting {} links ({})", links, mode);
        }
        ChainEvent::LinkStarted { name, .. } => println!("  > {}", name),
        ChainEvent::LinkCompleted { name, .. } => println!("  ✓ {}", name),
        ChainEvent::LinkFailed { name, reason, .. } => println!("  ✗ {}: {}", name, reason),
        ChainEvent::LinkCancelled { name, .. } => println!("  - {} (cancelled)", name),
        ChainEvent::Completed { .. } | ChainEvent::Failed { .. } => {}
    }
}

fn summary(
    plan: &ChainPlan,
    chain: &Chain,
    outcome: &RunOutcome,
    elapsed_ms: u128,
) -> serde_json::Value {
    let failures: Vec<serde_json::Value> = match outcome {
        RunOutcome::Completed => Vec::new(),
        RunOutcome::Failed(report) => report
            .iter()
            .map(|failure| json!({ "link": failure.link_name(), "reason": failure.reason() }))
            .collect(),
    };
    json!({
        "plan": plan.name,
        "chain_id": chain.id().to_string(),
        "in_order": plan.in_order,
        "completed": outcome.is_completed(),
        "elapsed_ms": elapsed_ms,
        "failures": failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkchain_core::LinkPlan;

    fn write_plan(dir: &Path, plan: &ChainPlan) -> PathBuf {
        let path = dir.join("plan.json");
        std::fs::write(&path, serde_json::to_vec(plan).unwrap()).unwrap();
        path
    }

    fn plan(links: Vec<LinkPlan>) -> ChainPlan {
        ChainPlan {
            name: "cli".to_string(),
            in_order: false,
            links,
        }
    }

    #[test]
    fn test_parse_run_with_flags() {
        let cli = Cli::try_parse_from(["linkchain", "-v", "--json", "run", "plan.json", "--ordered"])
            .unwrap();
        assert!(cli.verbose);
        assert!(cli.json);
        match cli.command {
            Commands::Run { plan, ordered } => {
                assert_eq!(plan, PathBuf::from("plan.json"));
                assert!(ordered);
            }
            Commands::Validate { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_validate_requires_plan() {
        assert!(Cli::try_parse_from(["linkchain", "validate"]).is_err());
        let cli = Cli::try_parse_from(["linkchain", "validate", "p.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Validate { .. }));
    }

    #[test]
    fn test_validate_rejects_duplicate_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            &plan(vec![LinkPlan::new("a", 0), LinkPlan::new("a", 0)]),
        );
        let err = cmd_validate(&path, false).unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate link name: a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_for_passing_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            &plan(vec![LinkPlan::new("a", 10), LinkPlan::new("b", 20)]),
        );
        LocalSet::new()
            .run_until(cmd_run(&path, false, true))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_failed_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            &plan(vec![
                LinkPlan::new("a", 10),
                LinkPlan::new("store", 5).failing("disk-error"),
            ]),
        );
        let err = LocalSet::new()
            .run_until(cmd_run(&path, true, false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("store: disk-error"));
    }
}
