use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Subcommand;
use pillbox_core::{Config, ConsumptionLedger, ReconciliationSweep};
use tokio_util::sync::CancellationToken;

#[derive(Subcommand)]
pub enum SweepAction {
    /// Run one reconciliation pass now
    Tick {
        /// Override the sweep instant, RFC 3339
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Run the periodic sweep until interrupted
    Run,
}

pub fn run(action: SweepAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::shared_db()?;
    let ledger = ConsumptionLedger::new(Arc::clone(&db));
    let config = Config::load_or_default();
    let sweep = ReconciliationSweep::new(db, ledger, super::notifier(&config));

    match action {
        SweepAction::Tick { at } => {
            let events = sweep.tick(at.unwrap_or_else(Utc::now))?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        SweepAction::Run => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async {
                let cancel = CancellationToken::new();
                let worker = tokio::spawn(sweep.run(cancel.clone()));
                tokio::signal::ctrl_c().await?;
                cancel.cancel();
                worker.await?;
                Ok::<_, Box<dyn std::error::Error>>(())
            })?;
            println!("sweep stopped");
        }
    }
    Ok(())
}
