//! Periodic reconciliation sweep.
//!
//! OS timers are best-effort; the sweep is the guarantee. Every period it
//! re-derives what should have happened from the schedules and the ledger
//! and repairs anything the timers dropped: reminders that never fired
//! and escalations that never marked a dose missed.
//!
//! The sweep window width equals the sweep period, so consecutive ticks
//! tile the day without gaps or overlap. Changing one without the other
//! would either double-process or skip dose times, which is why both are
//! a single constant here rather than configuration.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::alarm::ESCALATION_DELAY_MIN;
use crate::error::Result;
use crate::events::Event;
use crate::ledger::{ConsumptionLedger, RecordStatus};
use crate::notify::Notifier;
use crate::schedule::MedicationSchedule;
use crate::storage::Database;

/// Minutes between sweep ticks. Also the sweep window width.
pub const SWEEP_PERIOD_MIN: i64 = 15;

/// Hard budget for one tick; a wedged database must not stall the loop.
const TICK_BUDGET: StdDuration = StdDuration::from_secs(60);

/// Re-derives due reminders and overdue escalations from stored state.
#[derive(Clone)]
pub struct ReconciliationSweep {
    db: Arc<Mutex<Database>>,
    ledger: ConsumptionLedger,
    notifier: Arc<dyn Notifier>,
}

impl ReconciliationSweep {
    pub fn new(
        db: Arc<Mutex<Database>>,
        ledger: ConsumptionLedger,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            ledger,
            notifier,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One sweep pass at the given instant.
    ///
    /// For every active schedule due today or yesterday (a dose late in
    /// the day escalates after midnight), checks two windows anchored at
    /// the dose instant `t`:
    /// - reminder window `[t, t + period)`: surface the reminder unless
    ///   a record already settled the dose,
    /// - escalation window `[t + 1h, t + 1h + period)`: mark the dose
    ///   missed unless it was taken.
    ///
    /// Idempotent within a window: the ledger's reminder marker and the
    /// record state machine absorb repeated ticks.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let schedules = self.lock().list_active_schedules()?;
        let today = now.date_naive();
        let mut events = Vec::new();

        for schedule in &schedules {
            for date in [today - Duration::days(1), today] {
                if !schedule.is_due_on(date.weekday()) {
                    continue;
                }
                self.check_dose(schedule, date, now, &mut events)?;
            }
        }

        Ok(events)
    }

    fn check_dose(
        &self,
        schedule: &MedicationSchedule,
        date: NaiveDate,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let dose_at = date.and_time(schedule.time).and_utc();
        let period = Duration::minutes(SWEEP_PERIOD_MIN);
        let escalation_at = dose_at + Duration::minutes(ESCALATION_DELAY_MIN);

        if now >= dose_at && now < dose_at + period {
            let settled = self
                .ledger
                .record(schedule.compartment, date)?
                .map(|r| r.status != RecordStatus::Pending)
                .unwrap_or(false);
            if !settled && self.ledger.show_reminder(self.notifier.as_ref(), schedule, date)? {
                events.push(Event::ReminderShown {
                    schedule_id: schedule.id.clone(),
                    compartment: schedule.compartment,
                    date,
                    at: now,
                });
            }
        }

        if now >= escalation_at && now < escalation_at + period {
            let outcome =
                self.ledger
                    .mark_missed_if_not_taken(schedule.compartment, date, schedule.time)?;
            if outcome.changed() {
                self.notifier.show_missed_dose(schedule);
                events.push(Event::DoseMissed {
                    schedule_id: schedule.id.clone(),
                    compartment: schedule.compartment,
                    date,
                    at: now,
                });
            }
        }

        Ok(())
    }

    /// Drive the sweep until cancelled.
    ///
    /// Ticks every `SWEEP_PERIOD_MIN` minutes. A delayed tick runs late
    /// rather than bursting to catch up; the window math makes the late
    /// pass pick up whatever the missed one would have.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(SWEEP_PERIOD_MIN as u64 * 60));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("sweep loop stopping");
                    return;
                }
                _ = interval.tick() => {}
            }

            let sweep = self.clone();
            let now = Utc::now();
            let pass = tokio::task::spawn_blocking(move || sweep.tick(now));
            match tokio::time::timeout(TICK_BUDGET, pass).await {
                Ok(Ok(Ok(events))) => {
                    if !events.is_empty() {
                        log::info!("sweep produced {} event(s)", events.len());
                    }
                }
                Ok(Ok(Err(e))) => log::error!("sweep tick failed: {e}"),
                Ok(Err(e)) => log::error!("sweep task panicked: {e}"),
                Err(_) => log::error!("sweep tick exceeded {}s budget", TICK_BUDGET.as_secs()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DetectionMethod;
    use crate::notify::testing::RecordingNotifier;
    use crate::schedule::Compartment;
    use chrono::{NaiveTime, Weekday};

    fn setup(
        days: &[Weekday],
        time: NaiveTime,
    ) -> (ReconciliationSweep, Arc<RecordingNotifier>, MedicationSchedule) {
        let db = Arc::new(Mutex::new(Database::open_memory().unwrap()));
        let schedule = MedicationSchedule::new(
            Compartment::One,
            "Aspirin",
            days.iter().copied().collect(),
            time,
            1,
        );
        db.lock().unwrap().create_schedule(&schedule).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = ConsumptionLedger::new(Arc::clone(&db));
        let sweep = ReconciliationSweep::new(db, ledger, Arc::clone(&notifier) as Arc<dyn Notifier>);
        (sweep, notifier, schedule)
    }

    fn monday(h: u32, m: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2026, 8, 17)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
            .and_utc()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn missed_timers_are_repaired_by_consecutive_passes() {
        let (sweep, notifier, schedule) = setup(&[Weekday::Mon], time(16, 0));

        // 16:05, inside the reminder window. No record is written yet.
        let events = sweep.tick(monday(16, 5)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::ReminderShown { .. }));
        assert_eq!(notifier.reminders.lock().unwrap().len(), 1);
        assert!(sweep
            .ledger
            .record(Compartment::One, monday(16, 0).date_naive())
            .unwrap()
            .is_none());

        // 17:05, inside the escalation window. The dose becomes MISSED.
        let events = sweep.tick(monday(17, 5)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::DoseMissed { .. }));
        assert_eq!(notifier.missed.lock().unwrap().len(), 1);

        let record = sweep
            .ledger
            .record(Compartment::One, monday(16, 0).date_naive())
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Missed);
        assert_eq!(record.scheduled_time, schedule.time);
        assert!(record.consumed_time.is_none());
        assert!(record.detection_method.is_none());
    }

    #[test]
    fn repeated_ticks_inside_one_window_are_idempotent() {
        let (sweep, notifier, _) = setup(&[Weekday::Mon], time(16, 0));

        assert_eq!(sweep.tick(monday(16, 5)).unwrap().len(), 1);
        assert!(sweep.tick(monday(16, 10)).unwrap().is_empty());
        assert_eq!(notifier.reminders.lock().unwrap().len(), 1);

        assert_eq!(sweep.tick(monday(17, 5)).unwrap().len(), 1);
        assert!(sweep.tick(monday(17, 10)).unwrap().is_empty());
        assert_eq!(notifier.missed.lock().unwrap().len(), 1);
    }

    #[test]
    fn confirmed_dose_is_never_escalated() {
        let (sweep, notifier, schedule) = setup(&[Weekday::Mon], time(16, 0));

        sweep
            .ledger
            .mark_taken(
                schedule.compartment,
                monday(16, 0).date_naive(),
                schedule.time,
                monday(16, 2),
                DetectionMethod::Manual,
            )
            .unwrap();

        assert!(sweep.tick(monday(16, 5)).unwrap().is_empty());
        assert!(sweep.tick(monday(17, 5)).unwrap().is_empty());
        assert!(notifier.reminders.lock().unwrap().is_empty());
        assert!(notifier.missed.lock().unwrap().is_empty());
    }

    #[test]
    fn off_day_produces_nothing() {
        let (sweep, notifier, _) = setup(&[Weekday::Tue], time(16, 0));

        assert!(sweep.tick(monday(16, 5)).unwrap().is_empty());
        assert!(sweep.tick(monday(17, 5)).unwrap().is_empty());
        assert!(notifier.reminders.lock().unwrap().is_empty());
    }

    #[test]
    fn tick_after_window_closed_does_not_remind() {
        let (sweep, notifier, _) = setup(&[Weekday::Mon], time(16, 0));

        // 16:20 is past the 15-minute reminder window and before the
        // escalation window opens.
        assert!(sweep.tick(monday(16, 20)).unwrap().is_empty());
        assert!(notifier.reminders.lock().unwrap().is_empty());
    }

    #[test]
    fn escalation_crossing_midnight_keeps_dose_date() {
        let (sweep, _, schedule) = setup(&[Weekday::Mon], time(23, 30));

        // Tuesday 00:35, inside [Mon 23:30 + 1h, +15min).
        let events = sweep.tick(monday(23, 30) + Duration::minutes(65)).unwrap();
        assert_eq!(events.len(), 1);
        let Event::DoseMissed { date, .. } = &events[0] else {
            panic!("expected DoseMissed");
        };
        assert_eq!(*date, monday(0, 0).date_naive());

        let record = sweep
            .ledger
            .record(schedule.compartment, monday(0, 0).date_naive())
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Missed);
    }

    #[test]
    fn settled_dose_gets_no_reminder() {
        let (sweep, notifier, schedule) = setup(&[Weekday::Mon], time(16, 0));

        // Already marked missed, e.g. by a fired escalation timer.
        sweep
            .ledger
            .mark_missed_if_not_taken(
                schedule.compartment,
                monday(16, 0).date_naive(),
                schedule.time,
            )
            .unwrap();

        assert!(sweep.tick(monday(16, 5)).unwrap().is_empty());
        assert!(notifier.reminders.lock().unwrap().is_empty());
    }
}
