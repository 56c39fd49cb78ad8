//! Medication schedules.
//!
//! A [`MedicationSchedule`] binds one physical compartment to a medication,
//! a time of day and a set of weekdays. Schedules are validated at the API
//! boundary before anything downstream (alarms, sweep windows) is derived
//! from them.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// One of the two physical pill compartments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Compartment {
    One,
    Two,
}

impl Compartment {
    /// All compartments, in box order.
    pub const ALL: [Compartment; 2] = [Compartment::One, Compartment::Two];

    pub fn number(self) -> u8 {
        match self {
            Compartment::One => 1,
            Compartment::Two => 2,
        }
    }
}

impl TryFrom<u8> for Compartment {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Compartment::One),
            2 => Ok(Compartment::Two),
            other => Err(ValidationError::InvalidCompartment(other)),
        }
    }
}

impl From<Compartment> for u8 {
    fn from(value: Compartment) -> Self {
        value.number()
    }
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Format a weekday for storage and JSON payloads.
pub fn format_weekday(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

/// Parse a weekday from its stored form. Accepts the short names written
/// by [`format_weekday`], case-insensitively.
pub fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.to_ascii_lowercase().as_str() {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Weekdays sorted monday-first, for deterministic storage and output.
pub fn sorted_weekdays(days: &HashSet<Weekday>) -> Vec<Weekday> {
    let mut sorted: Vec<Weekday> = days.iter().copied().collect();
    sorted.sort_by_key(|d| d.num_days_from_monday());
    sorted
}

/// Serde adapter for weekday sets, stored as sorted arrays of short names.
pub mod weekday_set {
    use super::{format_weekday, parse_weekday, sorted_weekdays};
    use chrono::Weekday;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::HashSet;

    pub fn serialize<S: Serializer>(
        days: &HashSet<Weekday>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(sorted_weekdays(days).into_iter().map(format_weekday))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashSet<Weekday>, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names
            .iter()
            .map(|name| {
                parse_weekday(name)
                    .ok_or_else(|| D::Error::custom(format!("unknown weekday '{name}'")))
            })
            .collect()
    }
}

/// A medication schedule for one compartment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicationSchedule {
    pub id: String,
    pub compartment: Compartment,
    pub medication_name: String,
    /// Weekdays the dose is due. Never empty for a valid schedule.
    #[serde(with = "weekday_set")]
    pub days_of_week: HashSet<Weekday>,
    /// Time of day the dose is due.
    pub time: NaiveTime,
    /// Pills dispensed per dose. Currently always 1 in the shipped box.
    pub pill_count: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl MedicationSchedule {
    /// Create a new active schedule with a fresh id.
    ///
    /// The caller still has to [`validate`](Self::validate) before
    /// persisting or planning alarms.
    pub fn new(
        compartment: Compartment,
        medication_name: impl Into<String>,
        days_of_week: HashSet<Weekday>,
        time: NaiveTime,
        pill_count: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            compartment,
            medication_name: medication_name.into(),
            days_of_week,
            time,
            pill_count,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Validate the schedule invariants.
    ///
    /// # Errors
    /// Returns the first violated invariant: empty weekday set or a
    /// non-positive pill count. Compartment values outside {1, 2} are
    /// unrepresentable and rejected earlier at parse time.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.days_of_week.is_empty() {
            return Err(ValidationError::EmptyDays);
        }
        if self.pill_count == 0 {
            return Err(ValidationError::InvalidPillCount(self.pill_count));
        }
        Ok(())
    }

    /// Whether a dose is due on the given weekday.
    pub fn is_due_on(&self, weekday: Weekday) -> bool {
        self.is_active && self.days_of_week.contains(&weekday)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_day() -> HashSet<Weekday> {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn compartment_round_trip() {
        assert_eq!(Compartment::try_from(1).unwrap(), Compartment::One);
        assert_eq!(Compartment::try_from(2).unwrap(), Compartment::Two);
        assert!(Compartment::try_from(0).is_err());
        assert!(Compartment::try_from(3).is_err());
        assert_eq!(u8::from(Compartment::Two), 2);
    }

    #[test]
    fn validate_rejects_empty_days() {
        let schedule = MedicationSchedule::new(
            Compartment::One,
            "Aspirin",
            HashSet::new(),
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            1,
        );
        assert!(matches!(
            schedule.validate(),
            Err(ValidationError::EmptyDays)
        ));
    }

    #[test]
    fn validate_rejects_zero_pills() {
        let schedule = MedicationSchedule::new(
            Compartment::One,
            "Aspirin",
            every_day(),
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            0,
        );
        assert!(matches!(
            schedule.validate(),
            Err(ValidationError::InvalidPillCount(0))
        ));
    }

    #[test]
    fn due_only_on_listed_days_when_active() {
        let mut schedule = MedicationSchedule::new(
            Compartment::Two,
            "Vitamin D",
            [Weekday::Mon].into_iter().collect(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            1,
        );
        assert!(schedule.is_due_on(Weekday::Mon));
        assert!(!schedule.is_due_on(Weekday::Tue));

        schedule.is_active = false;
        assert!(!schedule.is_due_on(Weekday::Mon));
    }

    #[test]
    fn weekday_set_serde_round_trip() {
        let schedule = MedicationSchedule::new(
            Compartment::One,
            "Aspirin",
            [Weekday::Mon, Weekday::Fri].into_iter().collect(),
            NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            1,
        );
        let json = serde_json::to_string(&schedule).unwrap();
        assert!(json.contains("\"mon\""));
        assert!(json.contains("\"fri\""));

        let back: MedicationSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.days_of_week, schedule.days_of_week);
        assert_eq!(back.compartment, Compartment::One);
    }

    #[test]
    fn weekday_wire_order_is_monday_first() {
        // Set iteration order must not leak into the wire form.
        let schedule = MedicationSchedule::new(
            Compartment::One,
            "Aspirin",
            [Weekday::Fri, Weekday::Mon, Weekday::Wed].into_iter().collect(),
            NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            1,
        );
        let value = serde_json::to_value(&schedule).unwrap();
        assert_eq!(
            value["days_of_week"],
            serde_json::json!(["mon", "wed", "fri"])
        );
    }
}
