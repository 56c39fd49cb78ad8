//! CLI subcommand implementations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveTime, Weekday};
use pillbox_core::schedule::parse_weekday;
use pillbox_core::{Config, Database, LogNotifier, MedicationSchedule, Notifier, ValidationError};

pub mod alarm;
pub mod dose;
pub mod reset;
pub mod schedule;
pub mod sensor;
pub mod stats;
pub mod sweep;

/// Open the database behind the shared handle the core components take.
pub(crate) fn shared_db() -> Result<Arc<Mutex<Database>>, Box<dyn std::error::Error>> {
    Ok(Arc::new(Mutex::new(Database::open()?)))
}

pub(crate) fn lock(db: &Arc<Mutex<Database>>) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parse a comma-separated weekday list like `mon,wed,fri`.
pub(crate) fn parse_days(value: &str) -> Result<HashSet<Weekday>, Box<dyn std::error::Error>> {
    let mut days = HashSet::new();
    for part in value.split(',') {
        let part = part.trim();
        let day = parse_weekday(part)
            .ok_or_else(|| format!("unknown weekday '{part}' (use mon..sun)"))?;
        days.insert(day);
    }
    Ok(days)
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub(crate) fn parse_time(value: &str) -> Result<NaiveTime, Box<dyn std::error::Error>> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| ValidationError::InvalidTime(value.to_string()).into())
}

/// Notifier used when notifications are disabled in the config. Records
/// still transition; only the user-facing surfacing is suppressed.
struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn show_reminder(&self, _schedule: &MedicationSchedule) {}
    fn show_missed_dose(&self, _schedule: &MedicationSchedule) {}
}

pub(crate) fn notifier(config: &Config) -> Arc<dyn Notifier> {
    if config.notifications.enabled {
        Arc::new(LogNotifier)
    } else {
        Arc::new(SilentNotifier)
    }
}
