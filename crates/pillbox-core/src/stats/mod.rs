//! Adherence statistics.
//!
//! Derived entirely from stored schedules and consumption records; no
//! statistic is persisted. Pending doses are computed, not stored: the
//! absence of a record for a scheduled dose is what "pending" means.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

use crate::error::Result;
use crate::ledger::RecordStatus;
use crate::schedule::Compartment;
use crate::storage::Database;

/// Share of resolved doses that were taken, as a percentage.
///
/// Pending doses are excluded: compliance judges outcomes, not the
/// not-yet-due. Zero resolved doses means 0.0, not a division error.
pub fn compliance_pct(taken: u32, missed: u32) -> f64 {
    let resolved = taken + missed;
    if resolved == 0 {
        return 0.0;
    }
    f64::from(taken) / f64::from(resolved) * 100.0
}

/// Adherence summary over a date range.
#[derive(Debug, Clone, Serialize)]
pub struct AdherenceReport {
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compartment: Option<Compartment>,
    pub taken: u32,
    pub missed: u32,
    pub pending: u32,
    pub total_scheduled: u32,
    pub compliance_pct: f64,
    pub current_streak: u32,
}

/// Read-only reporting over the schedule and record tables.
pub struct StatisticsEngine {
    db: Arc<Mutex<Database>>,
}

impl StatisticsEngine {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Doses the active schedules call for in `[from, to]`, optionally
    /// restricted to one compartment.
    fn expected_doses(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        compartment: Option<Compartment>,
    ) -> Result<u32> {
        let schedules = self.lock().list_active_schedules()?;
        let mut expected = 0;
        let mut date = from;
        while date <= to {
            for schedule in &schedules {
                if compartment.is_some_and(|c| c != schedule.compartment) {
                    continue;
                }
                if schedule.is_due_on(date.weekday()) {
                    expected += 1;
                }
            }
            date += Duration::days(1);
        }
        Ok(expected)
    }

    /// Consecutive days ending at `today` with at least one dose taken.
    ///
    /// The walk starts at today, so the streak reads 0 until today's
    /// dose is confirmed. A day counts when any compartment recorded a
    /// TAKEN dose on it.
    pub fn current_streak(&self, today: NaiveDate) -> Result<u32> {
        let taken: BTreeSet<NaiveDate> = self.lock().taken_dates(today)?.into_iter().collect();

        let mut day = today;
        let mut streak = 0;
        while taken.contains(&day) {
            streak += 1;
            day -= Duration::days(1);
        }
        Ok(streak)
    }

    /// Full adherence report for `[from, to]`.
    ///
    /// Records for schedules that were since deleted or deactivated can
    /// outnumber the expected doses; pending saturates at zero and the
    /// total is rebuilt from the three buckets so they always sum.
    pub fn report(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        compartment: Option<Compartment>,
        today: NaiveDate,
    ) -> Result<AdherenceReport> {
        let records = self.lock().list_records(from, to, compartment)?;
        let mut taken = 0u32;
        let mut missed = 0u32;
        for record in &records {
            match record.status {
                RecordStatus::Taken => taken += 1,
                RecordStatus::Missed => missed += 1,
                RecordStatus::Pending => {}
            }
        }

        let expected = self.expected_doses(from, to, compartment)?;
        let pending = expected.saturating_sub(taken + missed);

        Ok(AdherenceReport {
            from,
            to,
            compartment,
            taken,
            missed,
            pending,
            total_scheduled: taken + missed + pending,
            compliance_pct: compliance_pct(taken, missed),
            current_streak: self.current_streak(today)?,
        })
    }
}
