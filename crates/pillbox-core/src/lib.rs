//! # Pillbox Core Library
//!
//! This library provides the core adherence logic for the Pillbox smart
//! pill box. It implements a CLI-first philosophy where all operations are
//! available via a standalone CLI binary, with any GUI or device shell
//! being a thin layer over the same core library.
//!
//! ## Architecture
//!
//! - **Alarm Planner**: Registers exact-time reminder/escalation timers
//!   through a pluggable `TimerService`; ids are derived from schedule ids
//!   so replanning replaces instead of duplicating
//! - **Reconciliation Sweep**: A periodic pass that re-derives due
//!   reminders and overdue escalations from stored state, compensating
//!   for timers the OS dropped
//! - **Consumption Ledger**: The single writer of dose records; enforces
//!   the PENDING/TAKEN/MISSED state machine and one record per
//!   compartment and day
//! - **Sensor Detection**: Edge-triggered box-opened detection over raw
//!   tilt and light readings
//! - **Storage**: SQLite-based schedule/record persistence and TOML-based
//!   configuration
//!
//! ## Key Components
//!
//! - [`AlarmPlanner`]: Per-schedule timer pair planning
//! - [`ReconciliationSweep`]: Periodic repair pass
//! - [`ConsumptionLedger`]: Dose record state machine
//! - [`SensorDetector`]: Edge-triggered opening detection
//! - [`Database`]: Schedule and record persistence
//! - [`Config`]: Application configuration management

pub mod alarm;
pub mod error;
pub mod events;
pub mod ledger;
pub mod notify;
pub mod schedule;
pub mod sensor;
pub mod stats;
pub mod storage;
pub mod sweep;

pub use alarm::{AlarmPlanner, LogTimerService, TimerKind, TimerService};
pub use error::{ConfigError, CoreError, DatabaseError, ValidationError};
pub use events::Event;
pub use ledger::{
    ConsumptionLedger, ConsumptionRecord, DetectionMethod, LedgerOutcome, RecordStatus,
};
pub use notify::{LogNotifier, Notifier};
pub use schedule::{Compartment, MedicationSchedule};
pub use sensor::{
    BoxState, CompartmentState, SensorDetector, SensorEvent, SensorReading, SensorThresholds,
};
pub use stats::{AdherenceReport, StatisticsEngine};
pub use storage::{Config, Database, NotificationsConfig};
pub use sweep::ReconciliationSweep;
