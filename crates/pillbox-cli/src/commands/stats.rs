use chrono::{Duration, Utc};
use clap::Subcommand;
use pillbox_core::{Compartment, StatisticsEngine};

#[derive(Subcommand)]
pub enum StatsAction {
    /// Adherence report over a trailing window
    Show {
        /// Days to cover, ending today
        #[arg(long, default_value_t = 7)]
        days: u32,
        /// Restrict to one compartment
        #[arg(long)]
        compartment: Option<u8>,
    },
}

pub fn run(action: StatsAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::shared_db()?;
    let stats = StatisticsEngine::new(db);

    match action {
        StatsAction::Show { days, compartment } => {
            let compartment = compartment.map(Compartment::try_from).transpose()?;
            let today = Utc::now().date_naive();
            let from = today - Duration::days(i64::from(days.max(1)) - 1);
            let report = stats.report(from, today, compartment, today)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
