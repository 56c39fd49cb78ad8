use std::sync::Arc;

use chrono::Utc;
use clap::Subcommand;
use pillbox_core::alarm::{escalation_timer_id, reminder_timer_id};
use pillbox_core::{AlarmPlanner, Config, ConsumptionLedger, LogTimerService};

#[derive(Subcommand)]
pub enum AlarmAction {
    /// Register today's timers for every active schedule
    Plan,
    /// Print the timer ids derived from a schedule id
    Ids { id: String },
    /// Deliver a fired OS timer to the engine
    Fire {
        /// Timer id as delivered by the OS
        timer_id: i64,
    },
}

pub fn run(action: AlarmAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::shared_db()?;
    let planner = AlarmPlanner::new(Arc::clone(&db), LogTimerService);

    match action {
        AlarmAction::Plan => {
            let planned = planner.plan_all(Utc::now())?;
            println!("{planned} schedule(s) planned for today");
        }
        AlarmAction::Ids { id } => {
            let ids = serde_json::json!({
                "reminder": reminder_timer_id(&id),
                "escalation": escalation_timer_id(&id),
            });
            println!("{}", serde_json::to_string_pretty(&ids)?);
        }
        AlarmAction::Fire { timer_id } => {
            let ledger = ConsumptionLedger::new(Arc::clone(&db));
            let config = Config::load_or_default();
            let notifier = super::notifier(&config);
            match planner.handle_fired(timer_id, Utc::now(), &ledger, notifier.as_ref())? {
                Some(event) => println!("{}", serde_json::to_string_pretty(&event)?),
                None => println!("no action"),
            }
        }
    }
    Ok(())
}
