use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use repoboard_adapters::{GithubClient, NotionClient, RecordStore, RepoMetadata};
use repoboard_sync::{
    run_reconcile, run_sync, verify_connections, ReconcileMode, ReconcileReport, RunConfig,
};

#[derive(Debug, Parser)]
#[command(name = "repoboard")]
#[command(about = "Sync a catalog of GitHub projects into a Notion board")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full catalog sync against the board
    Sync,
    /// Read category labels back from the board; preview unless --apply
    Reconcile {
        /// Write the resulting category changes into the catalog file
        #[arg(long)]
        apply: bool,
    },
    /// Perform a minimal read against both external services
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RunConfig::from_env()?;

    let github: Arc<dyn RepoMetadata> = Arc::new(GithubClient::new(config.github_token.clone())?);
    let records: Arc<dyn RecordStore> =
        Arc::new(NotionClient::new(&config.notion_token, &config.database_id)?);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync(&config, github, records).await?;
            if summary.migrated {
                println!("catalog migrated from legacy JSON: {}", summary.catalog_path.display());
            }
            if let Some(reconcile) = &summary.reconcile {
                print_reconcile(reconcile, true);
            }
            let report = &summary.report;
            println!(
                "sync complete: created={} updated={} skipped={} failed={}",
                report.created, report.updated, report.skipped, report.failed
            );
            for failure in &report.failures {
                println!("  failed {}: {}", failure.project_id, failure.cause);
            }
        }
        Commands::Reconcile { apply } => {
            let mode = if apply {
                ReconcileMode::Apply
            } else {
                ReconcileMode::Preview
            };
            let report = run_reconcile(&config, records, mode).await?;
            print_reconcile(&report, apply);
            if !apply {
                println!("preview only; re-run with --apply to write the catalog");
            }
        }
        Commands::Test => {
            verify_connections(github.as_ref(), records.as_ref()).await?;
            println!("both services reachable");
        }
    }

    Ok(())
}

fn print_reconcile(report: &ReconcileReport, applied: bool) {
    let verb = if applied { "moved" } else { "would move" };
    for change in &report.changes {
        println!(
            "  {} {}: {} -> {}",
            verb,
            change.project_id,
            if change.old_category_id.is_empty() {
                "(uncategorized)"
            } else {
                &change.old_category_id
            },
            change.new_category_id
        );
    }
    for unmapped in &report.unmapped {
        println!(
            "  unmapped label {:?} on record {}",
            unmapped.label, unmapped.remote_id
        );
    }
    println!(
        "reconcile: {} change(s), {} unmapped",
        report.changes.len(),
        report.unmapped.len()
    );
}
