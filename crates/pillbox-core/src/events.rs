use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::DetectionMethod;
use crate::schedule::Compartment;

/// Every externally visible transition in the engine produces an Event.
/// The shell (CLI, GUI, notification router) consumes them; the engine
/// itself never acts on its own events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A dose reminder was surfaced to the user.
    ReminderShown {
        schedule_id: String,
        compartment: Compartment,
        date: NaiveDate,
        at: DateTime<Utc>,
    },
    /// A dose was confirmed consumed.
    DoseTaken {
        compartment: Compartment,
        date: NaiveDate,
        method: DetectionMethod,
        at: DateTime<Utc>,
    },
    /// The escalation window closed without a confirmed consumption.
    DoseMissed {
        schedule_id: String,
        compartment: Compartment,
        date: NaiveDate,
        at: DateTime<Utc>,
    },
    /// The box lid crossed the tilt threshold from below.
    BoxOpened {
        compartment: Compartment,
        detected: bool,
        at: DateTime<Utc>,
    },
    /// Detector state was cleared after a device reconnection.
    DetectorReset {
        at: DateTime<Utc>,
    },
}
