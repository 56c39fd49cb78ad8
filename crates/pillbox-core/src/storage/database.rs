//! SQLite-based storage for schedules and consumption records.
//!
//! Two tables carry the engine state: `schedules`, keyed by id, and
//! `consumption_records`, keyed by id with a UNIQUE index over
//! (compartment, date) -- the storage-level backstop for the one-record-
//! per-compartment-per-day invariant. A small `kv` table holds engine
//! bookkeeping such as reminder-shown markers and the simulated detector
//! state used by the CLI.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::data_dir;
use crate::error::DatabaseError;
use crate::ledger::{ConsumptionRecord, DetectionMethod, RecordStatus};
use crate::schedule::{
    format_weekday, parse_weekday, sorted_weekdays, Compartment, MedicationSchedule,
};

// === Helper Functions ===

/// Format a record status for database storage
fn format_status(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::Pending => "PENDING",
        RecordStatus::Taken => "TAKEN",
        RecordStatus::Missed => "MISSED",
    }
}

/// Parse a record status from its stored form
fn parse_status(status_str: &str) -> RecordStatus {
    match status_str {
        "TAKEN" => RecordStatus::Taken,
        "MISSED" => RecordStatus::Missed,
        _ => RecordStatus::Pending,
    }
}

/// Format a detection method for database storage
fn format_method(method: Option<DetectionMethod>) -> Option<&'static str> {
    method.map(|m| match m {
        DetectionMethod::Sensor => "SENSOR",
        DetectionMethod::Manual => "MANUAL",
    })
}

/// Parse a detection method from its stored form
fn parse_method(method_str: Option<&str>) -> Option<DetectionMethod> {
    match method_str {
        Some("SENSOR") => Some(DetectionMethod::Sensor),
        Some("MANUAL") => Some(DetectionMethod::Manual),
        _ => None,
    }
}

fn format_days(days: &HashSet<chrono::Weekday>) -> String {
    let names: Vec<&'static str> = sorted_weekdays(days)
        .into_iter()
        .map(format_weekday)
        .collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}

fn parse_days(days_json: &str) -> HashSet<chrono::Weekday> {
    let names: Vec<String> = serde_json::from_str(days_json).unwrap_or_default();
    names.iter().filter_map(|n| parse_weekday(n)).collect()
}

/// Parse datetime from RFC3339 string with fallback to current time
fn parse_datetime_fallback(dt_str: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn column_conversion_error(
    index: usize,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

/// Parse a stored `YYYY-MM-DD` date. The date is part of the record key,
/// so a corrupt value is a hard error, not a fallback.
fn parse_date_strict(index: usize, date_str: &str) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .map_err(|e| column_conversion_error(index, format!("bad date '{date_str}': {e}")))
}

fn parse_time_strict(index: usize, time_str: &str) -> Result<NaiveTime, rusqlite::Error> {
    NaiveTime::parse_from_str(time_str, "%H:%M:%S")
        .map_err(|e| column_conversion_error(index, format!("bad time '{time_str}': {e}")))
}

fn parse_compartment_strict(index: usize, value: i64) -> Result<Compartment, rusqlite::Error> {
    u8::try_from(value)
        .ok()
        .and_then(|v| Compartment::try_from(v).ok())
        .ok_or_else(|| column_conversion_error(index, format!("bad compartment {value}")))
}

/// Build a MedicationSchedule from a database row
fn row_to_schedule(row: &rusqlite::Row) -> Result<MedicationSchedule, rusqlite::Error> {
    let compartment = parse_compartment_strict(1, row.get(1)?)?;
    let days_json: String = row.get(3)?;
    let time_str: String = row.get(4)?;

    Ok(MedicationSchedule {
        id: row.get(0)?,
        compartment,
        medication_name: row.get(2)?,
        days_of_week: parse_days(&days_json),
        time: parse_time_strict(4, &time_str)?,
        pill_count: row.get(5)?,
        is_active: row.get::<_, i32>(6)? != 0,
        created_at: parse_datetime_fallback(&row.get::<_, String>(7)?),
    })
}

/// Build a ConsumptionRecord from a database row
fn row_to_record(row: &rusqlite::Row) -> Result<ConsumptionRecord, rusqlite::Error> {
    let compartment = parse_compartment_strict(1, row.get(1)?)?;
    let date_str: String = row.get(2)?;
    let time_str: String = row.get(3)?;

    let consumed_time_str: Option<String> = row.get(4)?;
    let consumed_time = consumed_time_str
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let status_str: String = row.get(5)?;
    let method_str: Option<String> = row.get(6)?;

    Ok(ConsumptionRecord {
        id: row.get(0)?,
        compartment,
        date: parse_date_strict(2, &date_str)?,
        scheduled_time: parse_time_strict(3, &time_str)?,
        consumed_time,
        status: parse_status(&status_str),
        detection_method: parse_method(method_str.as_deref()),
    })
}

const SCHEDULE_COLUMNS: &str =
    "id, compartment, medication_name, days_of_week, time, pill_count, is_active, created_at";
const RECORD_COLUMNS: &str =
    "id, compartment, date, scheduled_time, consumed_time, status, detection_method";

/// SQLite database for the adherence engine.
///
/// Stores medication schedules and consumption records.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Get a reference to the underlying SQLite connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Open the database at `~/.config/pillbox/pillbox.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, Box<dyn std::error::Error>> {
        Self::open_at(&data_dir()?.join("pillbox.db"))
    }

    /// Open (or create) a database file at an explicit path.
    pub fn open_at(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let db = Self { conn };
        db.migrate()
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, Box<dyn std::error::Error>> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schedules (
                id              TEXT PRIMARY KEY,
                compartment     INTEGER NOT NULL,
                medication_name TEXT NOT NULL,
                days_of_week    TEXT NOT NULL DEFAULT '[]',
                time            TEXT NOT NULL,
                pill_count      INTEGER NOT NULL DEFAULT 1,
                is_active       INTEGER NOT NULL DEFAULT 1,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS consumption_records (
                id               TEXT PRIMARY KEY,
                compartment      INTEGER NOT NULL,
                date             TEXT NOT NULL,
                scheduled_time   TEXT NOT NULL,
                consumed_time    TEXT,
                status           TEXT NOT NULL DEFAULT 'PENDING',
                detection_method TEXT
            );

            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- One record per compartment per day, enforced at the store.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_records_compartment_date
                ON consumption_records(compartment, date);
            CREATE INDEX IF NOT EXISTS idx_records_date ON consumption_records(date);
            CREATE INDEX IF NOT EXISTS idx_records_status ON consumption_records(status);
            CREATE INDEX IF NOT EXISTS idx_schedules_active ON schedules(is_active);",
        )?;
        Ok(())
    }

    // === Schedule CRUD ===

    /// Create a new schedule.
    pub fn create_schedule(&self, schedule: &MedicationSchedule) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO schedules (id, compartment, medication_name, days_of_week, time, pill_count, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                schedule.id,
                schedule.compartment.number(),
                schedule.medication_name,
                format_days(&schedule.days_of_week),
                schedule.time.format("%H:%M:%S").to_string(),
                schedule.pill_count,
                schedule.is_active,
                schedule.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a schedule by ID.
    pub fn get_schedule(&self, id: &str) -> Result<Option<MedicationSchedule>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"
        ))?;
        stmt.query_row(params![id], row_to_schedule).optional()
    }

    /// List all schedules.
    pub fn list_schedules(&self) -> Result<Vec<MedicationSchedule>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY compartment, time"
        ))?;
        let schedules = stmt.query_map([], row_to_schedule)?;
        schedules.collect()
    }

    /// List active schedules only.
    pub fn list_active_schedules(&self) -> Result<Vec<MedicationSchedule>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE is_active = 1 ORDER BY compartment, time"
        ))?;
        let schedules = stmt.query_map([], row_to_schedule)?;
        schedules.collect()
    }

    /// Update an existing schedule.
    pub fn update_schedule(&self, schedule: &MedicationSchedule) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE schedules
             SET compartment = ?1, medication_name = ?2, days_of_week = ?3, time = ?4,
                 pill_count = ?5, is_active = ?6
             WHERE id = ?7",
            params![
                schedule.compartment.number(),
                schedule.medication_name,
                format_days(&schedule.days_of_week),
                schedule.time.format("%H:%M:%S").to_string(),
                schedule.pill_count,
                schedule.is_active,
                schedule.id,
            ],
        )?;
        Ok(())
    }

    /// Mark a schedule active or inactive. Returns false when no such id.
    pub fn set_schedule_active(&self, id: &str, active: bool) -> Result<bool, rusqlite::Error> {
        let changed = self.conn.execute(
            "UPDATE schedules SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(changed > 0)
    }

    /// Delete a schedule. Returns false when no such id.
    pub fn delete_schedule(&self, id: &str) -> Result<bool, rusqlite::Error> {
        let changed = self
            .conn
            .execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // === Consumption record access ===

    /// Get the record for a (compartment, date) key, if any.
    pub fn get_record(
        &self,
        compartment: Compartment,
        date: NaiveDate,
    ) -> Result<Option<ConsumptionRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM consumption_records WHERE compartment = ?1 AND date = ?2"
        ))?;
        stmt.query_row(
            params![compartment.number(), date.format("%Y-%m-%d").to_string()],
            row_to_record,
        )
        .optional()
    }

    /// Insert a fresh record.
    pub fn insert_record(&self, record: &ConsumptionRecord) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO consumption_records (id, compartment, date, scheduled_time, consumed_time, status, detection_method)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.compartment.number(),
                record.date.format("%Y-%m-%d").to_string(),
                record.scheduled_time.format("%H:%M:%S").to_string(),
                record.consumed_time.map(|dt| dt.to_rfc3339()),
                format_status(record.status),
                format_method(record.detection_method),
            ],
        )?;
        Ok(())
    }

    /// Overwrite the mutable fields of an existing record.
    pub fn update_record(&self, record: &ConsumptionRecord) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE consumption_records
             SET scheduled_time = ?1, consumed_time = ?2, status = ?3, detection_method = ?4
             WHERE id = ?5",
            params![
                record.scheduled_time.format("%H:%M:%S").to_string(),
                record.consumed_time.map(|dt| dt.to_rfc3339()),
                format_status(record.status),
                format_method(record.detection_method),
                record.id,
            ],
        )?;
        Ok(())
    }

    /// List records within a date range (inclusive), optionally filtered
    /// to one compartment.
    pub fn list_records(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        compartment: Option<Compartment>,
    ) -> Result<Vec<ConsumptionRecord>, rusqlite::Error> {
        let from_str = from.format("%Y-%m-%d").to_string();
        let to_str = to.format("%Y-%m-%d").to_string();

        match compartment {
            Some(c) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM consumption_records
                     WHERE date >= ?1 AND date <= ?2 AND compartment = ?3
                     ORDER BY date, compartment"
                ))?;
                let records = stmt.query_map(params![from_str, to_str, c.number()], row_to_record)?;
                records.collect()
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM consumption_records
                     WHERE date >= ?1 AND date <= ?2
                     ORDER BY date, compartment"
                ))?;
                let records = stmt.query_map(params![from_str, to_str], row_to_record)?;
                records.collect()
            }
        }
    }

    /// Distinct dates with at least one TAKEN record, newest first.
    ///
    /// Feeds the streak computation, which deliberately counts any
    /// compartment's TAKEN record for a date.
    pub fn taken_dates(&self, through: NaiveDate) -> Result<Vec<NaiveDate>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT date FROM consumption_records
             WHERE status = 'TAKEN' AND date <= ?1
             ORDER BY date DESC",
        )?;
        let rows = stmt.query_map(params![through.format("%Y-%m-%d").to_string()], |row| {
            let date_str: String = row.get(0)?;
            parse_date_strict(0, &date_str)
        })?;
        rows.collect()
    }

    // === KV store ===

    /// Get a value from the kv store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>, rusqlite::Error> {
        let mut stmt = self.conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        stmt.query_row(params![key], |row| row.get::<_, String>(0))
            .optional()
    }

    /// Set a value in the kv store.
    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Delete all engine data in a single transaction.
    ///
    /// Intended for destructive "factory reset" style actions.
    pub fn reset_all(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute_batch("BEGIN IMMEDIATE TRANSACTION;")?;
        let result: Result<(), rusqlite::Error> = (|| {
            self.conn.execute("DELETE FROM consumption_records", [])?;
            self.conn.execute("DELETE FROM schedules", [])?;
            self.conn.execute("DELETE FROM kv", [])?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.conn.execute_batch("COMMIT;")?;
                Ok(())
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK;");
                Err(err)
            }
        }
    }
}
