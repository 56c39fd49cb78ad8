use chrono::{Datelike, Duration, NaiveDate, Utc};
use clap::Subcommand;
use pillbox_core::{Compartment, ConsumptionLedger, DetectionMethod, Event, LedgerOutcome};

#[derive(Subcommand)]
pub enum DoseAction {
    /// Confirm a dose was taken (manual confirmation)
    Take {
        /// Compartment number (1 or 2)
        compartment: u8,
        /// Dose date, YYYY-MM-DD (default today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List consumption records
    List {
        /// Range start, YYYY-MM-DD (default 6 days ago)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Range end, YYYY-MM-DD (default today)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Restrict to one compartment
        #[arg(long)]
        compartment: Option<u8>,
    },
}

pub fn run(action: DoseAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::shared_db()?;

    match action {
        DoseAction::Take { compartment, date } => {
            let compartment = Compartment::try_from(compartment)?;
            let now = Utc::now();
            let date = date.unwrap_or_else(|| now.date_naive());

            // The record carries the scheduled time it settles; prefer the
            // schedule actually due on that date.
            let schedules = super::lock(&db).list_active_schedules()?;
            let schedule = schedules
                .iter()
                .find(|s| s.compartment == compartment && s.is_due_on(date.weekday()))
                .or_else(|| schedules.iter().find(|s| s.compartment == compartment));
            let Some(schedule) = schedule else {
                return Err(format!("no active schedule for compartment {compartment}").into());
            };

            let ledger = ConsumptionLedger::new(db);
            let outcome = ledger.mark_taken(
                compartment,
                date,
                schedule.time,
                now,
                DetectionMethod::Manual,
            )?;
            match outcome {
                LedgerOutcome::AlreadyTaken => {
                    println!("dose for compartment {compartment} on {date} was already taken")
                }
                _ => {
                    let event = Event::DoseTaken {
                        compartment,
                        date,
                        method: DetectionMethod::Manual,
                        at: now,
                    };
                    println!("{}", serde_json::to_string_pretty(&event)?);
                }
            }
        }
        DoseAction::List {
            from,
            to,
            compartment,
        } => {
            let today = Utc::now().date_naive();
            let to = to.unwrap_or(today);
            let from = from.unwrap_or(to - Duration::days(6));
            let compartment = compartment.map(Compartment::try_from).transpose()?;

            let ledger = ConsumptionLedger::new(db);
            let records = ledger.records_between(from, to, compartment)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}
