//! Consumption ledger -- the state machine over dose outcomes.
//!
//! The ledger is the single writer of [`ConsumptionRecord`] state. Four
//! independent producers funnel into it: fired OS alarms, the periodic
//! reconciliation sweep, sensor-confirmed removals and manual user
//! confirmation. None of them are ordered relative to each other, so the
//! ledger enforces correctness with monotonic guards applied atomically:
//!
//! - TAKEN is terminal for the day. Nothing downgrades it.
//! - MISSED may still be upgraded to TAKEN by a late sensor or manual
//!   confirmation.
//! - Absence of a record is equivalent to PENDING.
//!
//! Every write runs in one `BEGIN IMMEDIATE` transaction that reads the
//! current status and applies the guard against it, so concurrent writers
//! serialize per (compartment, date) key through the store.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::notify::Notifier;
use crate::schedule::{Compartment, MedicationSchedule};
use crate::sensor::{BoxState, SensorEvent};
use crate::storage::Database;

/// Status of one dose outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Pending,
    Taken,
    Missed,
}

/// How a consumption was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectionMethod {
    Sensor,
    Manual,
}

/// One dose outcome for a (compartment, date) key.
///
/// Invariants: `status == Taken` implies both `consumed_time` and
/// `detection_method` are set; `Pending`/`Missed` imply `consumed_time`
/// is absent. At most one record exists per (compartment, date) --
/// enforced by the store's unique index and the ledger's transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub id: String,
    pub compartment: Compartment,
    pub date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub consumed_time: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    pub detection_method: Option<DetectionMethod>,
}

impl ConsumptionRecord {
    /// A freshly confirmed consumption.
    pub fn new_taken(
        compartment: Compartment,
        date: NaiveDate,
        scheduled_time: NaiveTime,
        consumed_time: DateTime<Utc>,
        method: DetectionMethod,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            compartment,
            date,
            scheduled_time,
            consumed_time: Some(consumed_time),
            status: RecordStatus::Taken,
            detection_method: Some(method),
        }
    }

    /// A dose that went unconfirmed past the escalation window.
    pub fn new_missed(
        compartment: Compartment,
        date: NaiveDate,
        scheduled_time: NaiveTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            compartment,
            date,
            scheduled_time,
            consumed_time: None,
            status: RecordStatus::Missed,
            detection_method: None,
        }
    }

    /// Check the status/field coupling invariants.
    pub fn invariants_hold(&self) -> bool {
        match self.status {
            RecordStatus::Taken => {
                self.consumed_time.is_some() && self.detection_method.is_some()
            }
            RecordStatus::Pending | RecordStatus::Missed => self.consumed_time.is_none(),
        }
    }
}

/// Tagged result of a ledger write. Expected no-ops are outcomes here,
/// never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    /// No record existed; one was created.
    Created,
    /// An existing record changed status.
    Transitioned,
    /// The record is already TAKEN; the terminal state wins.
    AlreadyTaken,
    /// Nothing to do (e.g. MISSED marked missed again).
    Unchanged,
}

impl LedgerOutcome {
    /// Whether this write changed persisted state.
    pub fn changed(self) -> bool {
        matches!(self, LedgerOutcome::Created | LedgerOutcome::Transitioned)
    }
}

/// The single writer of consumption state.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct ConsumptionLedger {
    db: Arc<Mutex<Database>>,
}

impl ConsumptionLedger {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        // A poisoned lock means a writer panicked mid-transaction; the
        // transaction itself rolled back, so the state is still sound.
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `op` inside one immediate transaction.
    fn in_transaction<T>(
        db: &Database,
        op: impl FnOnce(&Database) -> Result<T, rusqlite::Error>,
    ) -> Result<T, rusqlite::Error> {
        db.conn().execute_batch("BEGIN IMMEDIATE TRANSACTION;")?;
        match op(db) {
            Ok(value) => {
                db.conn().execute_batch("COMMIT;")?;
                Ok(value)
            }
            Err(err) => {
                let _ = db.conn().execute_batch("ROLLBACK;");
                Err(err)
            }
        }
    }

    /// Confirm a consumption for (compartment, date).
    ///
    /// Creates a TAKEN record when none exists, upgrades PENDING or
    /// MISSED, and leaves an existing TAKEN record untouched -- the first
    /// positive writer wins.
    pub fn mark_taken(
        &self,
        compartment: Compartment,
        date: NaiveDate,
        scheduled_time: NaiveTime,
        consumed_time: DateTime<Utc>,
        method: DetectionMethod,
    ) -> Result<LedgerOutcome> {
        let db = self.lock();
        let outcome = Self::in_transaction(&db, |db| {
            match db.get_record(compartment, date)? {
                None => {
                    let record = ConsumptionRecord::new_taken(
                        compartment,
                        date,
                        scheduled_time,
                        consumed_time,
                        method,
                    );
                    db.insert_record(&record)?;
                    Ok(LedgerOutcome::Created)
                }
                Some(existing) if existing.status == RecordStatus::Taken => {
                    Ok(LedgerOutcome::AlreadyTaken)
                }
                Some(mut existing) => {
                    existing.status = RecordStatus::Taken;
                    existing.consumed_time = Some(consumed_time);
                    existing.detection_method = Some(method);
                    db.update_record(&existing)?;
                    Ok(LedgerOutcome::Transitioned)
                }
            }
        })?;
        Ok(outcome)
    }

    /// Record a missed dose unless the dose was already confirmed.
    ///
    /// A confirmed consumption is never downgraded: TAKEN yields
    /// [`LedgerOutcome::AlreadyTaken`] and the record stays untouched.
    pub fn mark_missed_if_not_taken(
        &self,
        compartment: Compartment,
        date: NaiveDate,
        scheduled_time: NaiveTime,
    ) -> Result<LedgerOutcome> {
        let db = self.lock();
        let outcome = Self::in_transaction(&db, |db| {
            match db.get_record(compartment, date)? {
                None => {
                    let record =
                        ConsumptionRecord::new_missed(compartment, date, scheduled_time);
                    db.insert_record(&record)?;
                    Ok(LedgerOutcome::Created)
                }
                Some(existing) => match existing.status {
                    RecordStatus::Taken => Ok(LedgerOutcome::AlreadyTaken),
                    RecordStatus::Missed => Ok(LedgerOutcome::Unchanged),
                    RecordStatus::Pending => {
                        let mut updated = existing;
                        updated.status = RecordStatus::Missed;
                        updated.consumed_time = None;
                        updated.detection_method = None;
                        db.update_record(&updated)?;
                        Ok(LedgerOutcome::Transitioned)
                    }
                },
            }
        })?;
        Ok(outcome)
    }

    /// Surface a dose reminder, at most once per schedule per day.
    ///
    /// Never mutates record state; the dedup marker lives in the kv
    /// store so that the alarm path and the sweep path share it. Returns
    /// whether a notification was actually dispatched.
    pub fn show_reminder(
        &self,
        notifier: &dyn Notifier,
        schedule: &MedicationSchedule,
        date: NaiveDate,
    ) -> Result<bool> {
        let key = format!("reminder_shown:{}:{}", schedule.id, date.format("%Y-%m-%d"));
        let first_time = {
            let db = self.lock();
            Self::in_transaction(&db, |db| {
                if db.kv_get(&key)?.is_some() {
                    return Ok(false);
                }
                db.kv_set(&key, &Utc::now().to_rfc3339())?;
                Ok(true)
            })?
        };
        if first_time {
            notifier.show_reminder(schedule);
        }
        Ok(first_time)
    }

    /// Route a sensor event to an automatic TAKEN transition.
    ///
    /// Only detected box-open events count. The event's compartment is
    /// matched against today's active schedules; a removal with no due
    /// schedule is logged and dropped.
    pub fn record_sensor_event(&self, event: &SensorEvent) -> Result<Option<LedgerOutcome>> {
        if event.box_state != BoxState::Open || !event.detected {
            return Ok(None);
        }

        let date = event.timestamp.date_naive();
        let weekday = date.weekday();

        let schedule = {
            let db = self.lock();
            db.list_active_schedules()?
                .into_iter()
                .find(|s| s.compartment == event.compartment && s.is_due_on(weekday))
        };

        let Some(schedule) = schedule else {
            log::info!(
                "sensor removal in compartment {} with no schedule due on {date}; ignoring",
                event.compartment
            );
            return Ok(None);
        };

        let outcome = self.mark_taken(
            event.compartment,
            date,
            schedule.time,
            event.timestamp,
            DetectionMethod::Sensor,
        )?;
        Ok(Some(outcome))
    }

    /// Current record for a (compartment, date) key, if any.
    pub fn record(
        &self,
        compartment: Compartment,
        date: NaiveDate,
    ) -> Result<Option<ConsumptionRecord>> {
        Ok(self.lock().get_record(compartment, date)?)
    }

    /// Records in an inclusive date range, optionally per compartment.
    pub fn records_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        compartment: Option<Compartment>,
    ) -> Result<Vec<ConsumptionRecord>> {
        Ok(self.lock().list_records(from, to, compartment)?)
    }
}
