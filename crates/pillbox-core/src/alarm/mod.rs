//! Exact-time alarm planning.
//!
//! For every active schedule the planner registers two one-shot OS timers
//! per day: a reminder at the scheduled time and an escalation one hour
//! later. Timer identifiers are derived from the schedule id alone, so
//! they survive process restarts and re-planning the same schedule/day
//! replaces the previous registration instead of duplicating it.
//!
//! Registration is best-effort: the OS power-management subsystem may
//! drop a timer silently. The planner tolerates that without retrying --
//! the reconciliation sweep is the compensating mechanism.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::events::Event;
use crate::ledger::{ConsumptionLedger, RecordStatus};
use crate::notify::Notifier;
use crate::schedule::MedicationSchedule;
use crate::storage::Database;

/// Minutes between the reminder and the missed-dose escalation.
pub const ESCALATION_DELAY_MIN: i64 = 60;

/// Tag distinguishing the two timers derived from one schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    Reminder,
    Escalation,
}

/// OS timer boundary.
///
/// `schedule_exact` fires once at-or-after the trigger instant; delivery
/// is best-effort under power-saving states, with no SLA. Registering an
/// id that is already pending replaces the previous registration.
pub trait TimerService: Send + Sync {
    fn schedule_exact(
        &self,
        trigger_at: DateTime<Utc>,
        timer_id: i64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    fn cancel(&self, timer_id: i64) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Timer service that only logs. Used by headless shells where the sweep
/// alone drives reminders.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTimerService;

impl TimerService for LogTimerService {
    fn schedule_exact(
        &self,
        trigger_at: DateTime<Utc>,
        timer_id: i64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("timer {timer_id} registered for {trigger_at}");
        Ok(())
    }

    fn cancel(&self, timer_id: i64) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("timer {timer_id} cancelled");
        Ok(())
    }
}

/// Stable 64-bit identifier from the SHA-256 of the input.
///
/// The source of truth is data, never an in-memory counter: ids must
/// survive process restarts and collide only with themselves.
fn hash64(input: &str) -> i64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Timer id for a schedule's daily reminder.
pub fn reminder_timer_id(schedule_id: &str) -> i64 {
    hash64(schedule_id)
}

/// Timer id for a schedule's escalation, one hour after the reminder.
///
/// Hashing the suffixed id keeps the two ids unrelated; a fixed numeric
/// offset could collide with another schedule's reminder id.
pub fn escalation_timer_id(schedule_id: &str) -> i64 {
    hash64(&format!("{schedule_id}#escalation"))
}

/// The two instants planned for one schedule on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedAlarms {
    pub reminder_at: DateTime<Utc>,
    /// Absent when the escalation instant is already past.
    pub escalation_at: Option<DateTime<Utc>>,
}

/// Plans and cancels the per-schedule timer pair.
pub struct AlarmPlanner<T: TimerService> {
    db: Arc<Mutex<Database>>,
    timers: T,
}

impl<T: TimerService> AlarmPlanner<T> {
    pub fn new(db: Arc<Mutex<Database>>, timers: T) -> Self {
        Self { db, timers }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register today's reminder and escalation timers for one schedule.
    ///
    /// No-op when today's weekday is not covered or the reminder time is
    /// already past -- there is no catch-up scheduling; the sweep covers
    /// anything the timers miss.
    pub fn plan_for_today(
        &self,
        schedule: &MedicationSchedule,
        now: DateTime<Utc>,
    ) -> Option<PlannedAlarms> {
        let today = now.date_naive();
        if !schedule.is_due_on(today.weekday()) {
            return None;
        }

        let reminder_at = today.and_time(schedule.time).and_utc();
        if reminder_at <= now {
            return None;
        }

        if let Err(e) = self
            .timers
            .schedule_exact(reminder_at, reminder_timer_id(&schedule.id))
        {
            log::warn!("reminder timer registration dropped for {}: {e}", schedule.id);
        }

        let escalation_at = reminder_at + Duration::minutes(ESCALATION_DELAY_MIN);
        let escalation_at = if escalation_at > now {
            if let Err(e) = self
                .timers
                .schedule_exact(escalation_at, escalation_timer_id(&schedule.id))
            {
                log::warn!(
                    "escalation timer registration dropped for {}: {e}",
                    schedule.id
                );
            }
            Some(escalation_at)
        } else {
            None
        };

        Some(PlannedAlarms {
            reminder_at,
            escalation_at,
        })
    }

    /// (Re)plan every active schedule. The boot-completed entry point.
    pub fn plan_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let schedules = self.lock().list_active_schedules()?;
        let mut planned = 0;
        for schedule in &schedules {
            if self.plan_for_today(schedule, now).is_some() {
                planned += 1;
            }
        }
        Ok(planned)
    }

    /// Cancel both timers derived from a schedule id.
    ///
    /// Safe to call when nothing is pending; identifiers are recomputed
    /// from the id, so this works after a restart too.
    pub fn cancel(&self, schedule_id: &str) {
        for timer_id in [
            reminder_timer_id(schedule_id),
            escalation_timer_id(schedule_id),
        ] {
            if let Err(e) = self.timers.cancel(timer_id) {
                log::warn!("timer {timer_id} cancellation failed for {schedule_id}: {e}");
            }
        }
    }

    /// Map a fired timer id back to its schedule and kind.
    pub fn resolve(&self, timer_id: i64) -> Result<Option<(MedicationSchedule, TimerKind)>> {
        let schedules = self.lock().list_schedules()?;
        for schedule in schedules {
            if reminder_timer_id(&schedule.id) == timer_id {
                return Ok(Some((schedule, TimerKind::Reminder)));
            }
            if escalation_timer_id(&schedule.id) == timer_id {
                return Ok(Some((schedule, TimerKind::Escalation)));
            }
        }
        Ok(None)
    }

    /// Handle a fired timer.
    ///
    /// A timer whose schedule has since been deleted finds nothing and
    /// no-ops: it is treated as already cancelled, not as an error. The
    /// ledger's guards make this path safe to race against the sweep and
    /// the sensor route.
    pub fn handle_fired(
        &self,
        timer_id: i64,
        now: DateTime<Utc>,
        ledger: &ConsumptionLedger,
        notifier: &dyn Notifier,
    ) -> Result<Option<Event>> {
        let Some((schedule, kind)) = self.resolve(timer_id)? else {
            log::info!("timer {timer_id} fired for a deleted schedule; ignoring");
            return Ok(None);
        };
        if !schedule.is_active {
            log::info!("timer {timer_id} fired for deactivated schedule {}", schedule.id);
            return Ok(None);
        }

        match kind {
            TimerKind::Reminder => {
                let date = now.date_naive();
                let record = ledger.record(schedule.compartment, date)?;
                let pending = record
                    .map(|r| r.status == RecordStatus::Pending)
                    .unwrap_or(true);
                if pending && ledger.show_reminder(notifier, &schedule, date)? {
                    return Ok(Some(Event::ReminderShown {
                        schedule_id: schedule.id.clone(),
                        compartment: schedule.compartment,
                        date,
                        at: now,
                    }));
                }
                Ok(None)
            }
            TimerKind::Escalation => {
                // The escalation fires one hour after the dose time;
                // attribute the record to the dose's date even when the
                // hour crossed midnight.
                let dose_date = (now - Duration::minutes(ESCALATION_DELAY_MIN)).date_naive();
                let outcome = ledger.mark_missed_if_not_taken(
                    schedule.compartment,
                    dose_date,
                    schedule.time,
                )?;
                if outcome.changed() {
                    notifier.show_missed_dose(&schedule);
                    return Ok(Some(Event::DoseMissed {
                        schedule_id: schedule.id.clone(),
                        compartment: schedule.compartment,
                        date: dose_date,
                        at: now,
                    }));
                }
                Ok(None)
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
    use chrono::{NaiveDate, NaiveTime, Weekday};

    /// Records registrations and cancellations for assertions.
    #[derive(Default)]
    struct MockTimerService {
        scheduled: Mutex<Vec<(DateTime<Utc>, i64)>>,
        cancelled: Mutex<Vec<i64>>,
    }

    impl TimerService for &MockTimerService {
        fn schedule_exact(
            &self,
            trigger_at: DateTime<Utc>,
            timer_id: i64,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.scheduled.lock().unwrap().push((trigger_at, timer_id));
            Ok(())
        }

        fn cancel(&self, timer_id: i64) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.cancelled.lock().unwrap().push(timer_id);
            Ok(())
        }
    }

    fn shared_db() -> Arc<Mutex<Database>> {
        Arc::new(Mutex::new(Database::open_memory().unwrap()))
    }

    fn monday_16h_schedule() -> MedicationSchedule {
        MedicationSchedule::new(
            Compartment::One,
            "Aspirin",
            [Weekday::Mon].into_iter().collect(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            1,
        )
    }

    fn monday(h: u32, m: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2026, 8, 17)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn timer_ids_are_deterministic_and_distinct() {
        let a = "3f3f0b1c-1111-2222-3333-444455556666";
        let b = "3f3f0b1c-1111-2222-3333-444455556667";

        assert_eq!(reminder_timer_id(a), reminder_timer_id(a));
        assert_ne!(reminder_timer_id(a), escalation_timer_id(a));
        assert_ne!(reminder_timer_id(a), reminder_timer_id(b));
        assert_ne!(escalation_timer_id(a), escalation_timer_id(b));
        // The failure mode of the offset scheme: one schedule's escalation
        // colliding with another's reminder.
        assert_ne!(escalation_timer_id(a), reminder_timer_id(b));
    }

    #[test]
    fn plans_both_timers_when_due_in_future() {
        let timers = MockTimerService::default();
        let planner = AlarmPlanner::new(shared_db(), &timers);
        let schedule = monday_16h_schedule();

        let planned = planner.plan_for_today(&schedule, monday(8, 0)).unwrap();
        assert_eq!(planned.reminder_at, monday(16, 0));
        assert_eq!(planned.escalation_at, Some(monday(17, 0)));

        let scheduled = timers.scheduled.lock().unwrap();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0], (monday(16, 0), reminder_timer_id(&schedule.id)));
        assert_eq!(scheduled[1], (monday(17, 0), escalation_timer_id(&schedule.id)));
    }

    #[test]
    fn skips_wrong_weekday() {
        let timers = MockTimerService::default();
        let planner = AlarmPlanner::new(shared_db(), &timers);
        let tuesday = monday(8, 0) + Duration::days(1);

        assert!(planner.plan_for_today(&monday_16h_schedule(), tuesday).is_none());
        assert!(timers.scheduled.lock().unwrap().is_empty());
    }

    #[test]
    fn no_catch_up_for_past_reminder() {
        let timers = MockTimerService::default();
        let planner = AlarmPlanner::new(shared_db(), &timers);

        assert!(planner
            .plan_for_today(&monday_16h_schedule(), monday(16, 30))
            .is_none());
        assert!(timers.scheduled.lock().unwrap().is_empty());
    }

    #[test]
    fn replanning_reuses_identifiers() {
        let timers = MockTimerService::default();
        let planner = AlarmPlanner::new(shared_db(), &timers);
        let schedule = monday_16h_schedule();

        assert!(planner.plan_for_today(&schedule, monday(8, 0)).is_some());
        assert!(planner.plan_for_today(&schedule, monday(9, 0)).is_some());

        let scheduled = timers.scheduled.lock().unwrap();
        let ids: Vec<i64> = scheduled.iter().map(|(_, id)| *id).collect();
        // Same two ids both times: replace, not duplicate.
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[1], ids[3]);
    }

    #[test]
    fn cancel_recomputes_both_identifiers() {
        let timers = MockTimerService::default();
        let planner = AlarmPlanner::new(shared_db(), &timers);
        let schedule = monday_16h_schedule();

        planner.cancel(&schedule.id);

        let cancelled = timers.cancelled.lock().unwrap();
        assert_eq!(
            *cancelled,
            vec![
                reminder_timer_id(&schedule.id),
                escalation_timer_id(&schedule.id)
            ]
        );
    }

    #[test]
    fn fired_timer_for_deleted_schedule_noops() {
        let timers = MockTimerService::default();
        let db = shared_db();
        let planner = AlarmPlanner::new(Arc::clone(&db), &timers);
        let ledger = ConsumptionLedger::new(db);
        let notifier = RecordingNotifier::default();

        let event = planner
            .handle_fired(12345, monday(16, 0), &ledger, &notifier)
            .unwrap();
        assert!(event.is_none());
        assert!(notifier.reminders.lock().unwrap().is_empty());
    }

    #[test]
    fn reminder_fire_notifies_once() {
        let timers = MockTimerService::default();
        let db = shared_db();
        let schedule = monday_16h_schedule();
        db.lock().unwrap().create_schedule(&schedule).unwrap();
        let planner = AlarmPlanner::new(Arc::clone(&db), &timers);
        let ledger = ConsumptionLedger::new(db);
        let notifier = RecordingNotifier::default();

        let timer_id = reminder_timer_id(&schedule.id);
        let first = planner
            .handle_fired(timer_id, monday(16, 0), &ledger, &notifier)
            .unwrap();
        assert!(matches!(first, Some(Event::ReminderShown { .. })));

        // A redundant fire (or a racing sweep) shows nothing further.
        let second = planner
            .handle_fired(timer_id, monday(16, 1), &ledger, &notifier)
            .unwrap();
        assert!(second.is_none());
        assert_eq!(notifier.reminders.lock().unwrap().len(), 1);
    }

    #[test]
    fn escalation_fire_marks_missed_unless_taken() {
        let timers = MockTimerService::default();
        let db = shared_db();
        let schedule = monday_16h_schedule();
        db.lock().unwrap().create_schedule(&schedule).unwrap();
        let planner = AlarmPlanner::new(Arc::clone(&db), &timers);
        let ledger = ConsumptionLedger::new(Arc::clone(&db));
        let notifier = RecordingNotifier::default();

        let timer_id = escalation_timer_id(&schedule.id);
        let event = planner
            .handle_fired(timer_id, monday(17, 0), &ledger, &notifier)
            .unwrap();
        assert!(matches!(event, Some(Event::DoseMissed { .. })));
        assert_eq!(notifier.missed.lock().unwrap().len(), 1);

        let record = ledger
            .record(schedule.compartment, monday(16, 0).date_naive())
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Missed);
    }

    #[test]
    fn escalation_fire_respects_confirmed_dose() {
        let timers = MockTimerService::default();
        let db = shared_db();
        let schedule = monday_16h_schedule();
        db.lock().unwrap().create_schedule(&schedule).unwrap();
        let planner = AlarmPlanner::new(Arc::clone(&db), &timers);
        let ledger = ConsumptionLedger::new(Arc::clone(&db));
        let notifier = RecordingNotifier::default();

        ledger
            .mark_taken(
                schedule.compartment,
                monday(16, 0).date_naive(),
                schedule.time,
                monday(16, 5),
                DetectionMethod::Sensor,
            )
            .unwrap();

        let event = planner
            .handle_fired(
                escalation_timer_id(&schedule.id),
                monday(17, 0),
                &ledger,
                &notifier,
            )
            .unwrap();
        assert!(event.is_none());
        assert!(notifier.missed.lock().unwrap().is_empty());
    }
}
