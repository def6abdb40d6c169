//! The served binary: resumes persisted transactions and reports state.

#![allow(clippy::missing_docs_in_private_items, clippy::print_stdout)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use served::inventory::Inventory;
use served::machine::ActionResult;
use served::orchestrator::Orchestrator;
use served::transaction::Transaction;

#[derive(Parser)]
#[command(name = "served", version, about = "Transaction engine for the chef store")]
struct Cli {
    /// Directory holding persisted transaction state.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Inventory file.
    #[arg(long)]
    inventory: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let base = dirs::data_local_dir()
        .context("no data directory for this platform")?
        .join("chef");

    let state_dir = cli.state_dir.unwrap_or_else(|| base.join("transactions"));
    let inventory_path = cli.inventory.unwrap_or_else(|| base.join("inventory.json"));

    // Resumed machines get inert actions; real work is wired in by the
    // store front end driving this engine.
    let orchestrator = Orchestrator::open(
        &state_dir,
        Box::new(|_, _| Box::new(|_: &mut Transaction| ActionResult::Continue)),
    )
    .with_context(|| format!("opening {}", state_dir.display()))?;

    for id in orchestrator.ids() {
        if let Some(txn) = orchestrator.get(id) {
            info!(
                id,
                kind = %txn.kind,
                state = ?txn.state,
                name = %txn.name,
                "transaction"
            );
        }
    }

    let inventory = Inventory::load(&inventory_path)
        .with_context(|| format!("loading {}", inventory_path.display()))?;
    info!(
        packs = inventory.packs.len(),
        proofs = inventory.proofs.len(),
        "inventory loaded"
    );

    Ok(())
}
