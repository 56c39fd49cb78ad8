//! Notification sink boundary.
//!
//! Rendering notifications is a collaborator concern. The engine only
//! needs a fire-and-forget sink: no acknowledgement is ever consumed.

use crate::schedule::MedicationSchedule;

/// Every notification backend implements this trait.
pub trait Notifier: Send + Sync {
    /// A dose is due now.
    fn show_reminder(&self, schedule: &MedicationSchedule);

    /// A dose went unconfirmed past the escalation window.
    fn show_missed_dose(&self, schedule: &MedicationSchedule);
}

/// Notifier that writes to the log. Default backend for headless use.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show_reminder(&self, schedule: &MedicationSchedule) {
        log::info!(
            "reminder: take {} from compartment {}",
            schedule.medication_name,
            schedule.compartment
        );
    }

    fn show_missed_dose(&self, schedule: &MedicationSchedule) {
        log::warn!(
            "missed dose: {} from compartment {} was not taken",
            schedule.medication_name,
            schedule.compartment
        );
    }
}
