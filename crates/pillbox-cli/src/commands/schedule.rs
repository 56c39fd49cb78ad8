use std::sync::Arc;

use chrono::Utc;
use clap::Subcommand;
use pillbox_core::{AlarmPlanner, Compartment, LogTimerService, MedicationSchedule};

#[derive(Subcommand)]
pub enum ScheduleAction {
    /// Create a schedule
    Add {
        /// Compartment number (1 or 2)
        compartment: u8,
        /// Medication name
        name: String,
        /// Comma-separated weekdays, e.g. mon,wed,fri
        #[arg(long)]
        days: String,
        /// Dose time, HH:MM
        #[arg(long)]
        time: String,
        /// Pills per dose
        #[arg(long, default_value_t = 1)]
        pills: u32,
    },
    /// List schedules
    List {
        /// Include deactivated schedules
        #[arg(long)]
        all: bool,
    },
    /// Update an existing schedule
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        days: Option<String>,
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        pills: Option<u32>,
    },
    /// Deactivate a schedule, keeping its dose history
    Deactivate { id: String },
    /// Delete a schedule
    Delete { id: String },
}

pub fn run(action: ScheduleAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::shared_db()?;
    let planner = AlarmPlanner::new(Arc::clone(&db), LogTimerService);

    match action {
        ScheduleAction::Add {
            compartment,
            name,
            days,
            time,
            pills,
        } => {
            let schedule = MedicationSchedule::new(
                Compartment::try_from(compartment)?,
                name,
                super::parse_days(&days)?,
                super::parse_time(&time)?,
                pills,
            );
            schedule.validate()?;
            super::lock(&db).create_schedule(&schedule)?;
            if let Some(planned) = planner.plan_for_today(&schedule, Utc::now()) {
                log::info!("alarms planned: reminder at {}", planned.reminder_at);
            }
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }
        ScheduleAction::List { all } => {
            let schedules = if all {
                super::lock(&db).list_schedules()?
            } else {
                super::lock(&db).list_active_schedules()?
            };
            println!("{}", serde_json::to_string_pretty(&schedules)?);
        }
        ScheduleAction::Update {
            id,
            name,
            days,
            time,
            pills,
        } => {
            let Some(mut schedule) = super::lock(&db).get_schedule(&id)? else {
                return Err(format!("no schedule {id}").into());
            };
            if let Some(name) = name {
                schedule.medication_name = name;
            }
            if let Some(days) = days {
                schedule.days_of_week = super::parse_days(&days)?;
            }
            if let Some(time) = time {
                schedule.time = super::parse_time(&time)?;
            }
            if let Some(pills) = pills {
                schedule.pill_count = pills;
            }
            schedule.validate()?;
            super::lock(&db).update_schedule(&schedule)?;
            // The old timers carry the old time; replace the pair.
            planner.cancel(&schedule.id);
            if let Some(planned) = planner.plan_for_today(&schedule, Utc::now()) {
                log::info!("alarms replanned: reminder at {}", planned.reminder_at);
            }
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }
        ScheduleAction::Deactivate { id } => {
            if !super::lock(&db).set_schedule_active(&id, false)? {
                return Err(format!("no schedule {id}").into());
            }
            planner.cancel(&id);
            println!("schedule {id} deactivated");
        }
        ScheduleAction::Delete { id } => {
            if !super::lock(&db).delete_schedule(&id)? {
                return Err(format!("no schedule {id}").into());
            }
            planner.cancel(&id);
            println!("schedule {id} deleted");
        }
    }
    Ok(())
}
