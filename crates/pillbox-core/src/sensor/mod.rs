//! Edge-triggered pill-removal detection.
//!
//! The smart box streams `(light1, light2, tilt)` readings over BLE. The
//! [`SensorDetector`] turns that stream into at most one [`SensorEvent`]
//! per box-open transition: an event fires when the tilt value crosses its
//! threshold from below, never while the lid simply stays open.
//!
//! The detector's previous-value state belongs to a single live device
//! connection. Call [`SensorDetector::reset`] on every reconnect --
//! stale values from the old connection can suppress legitimate edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::schedule::Compartment;

/// Tilt classification of the whole box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxState {
    Open,
    Closed,
}

/// Light classification of a single compartment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompartmentState {
    /// A pill blocks the light sensor.
    Loaded,
    Empty,
}

/// Per-compartment light thresholds plus the shared tilt threshold.
///
/// Pure configuration; supplied by the config layer or the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorThresholds {
    /// Light threshold (0-100) for compartment 1.
    pub light_compartment1: u8,
    /// Light threshold (0-100) for compartment 2.
    pub light_compartment2: u8,
    /// Tilt threshold shared by both compartments.
    pub tilt: u16,
}

impl Default for SensorThresholds {
    fn default() -> Self {
        Self {
            light_compartment1: 40,
            light_compartment2: 40,
            tilt: 1,
        }
    }
}

impl SensorThresholds {
    /// Light threshold for the given compartment.
    pub fn light_for(&self, compartment: Compartment) -> u8 {
        match compartment {
            Compartment::One => self.light_compartment1,
            Compartment::Two => self.light_compartment2,
        }
    }

    /// Validate the 0-100 range of both light thresholds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for compartment in Compartment::ALL {
            let value = self.light_for(compartment);
            if value > 100 {
                return Err(ValidationError::InvalidThreshold {
                    compartment: compartment.number(),
                    value: u16::from(value),
                });
            }
        }
        Ok(())
    }
}

/// One raw reading pushed by the BLE collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub light_compartment1: u8,
    pub light_compartment2: u8,
    pub tilt: u16,
}

impl SensorReading {
    /// Parse the wire form `light1,light2,tilt`.
    ///
    /// Malformed or partial payloads yield `None`; the caller discards the
    /// tick and keeps its detector state unchanged.
    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.split(',').map(str::trim);
        let light1: u8 = parts.next()?.parse().ok()?;
        let light2: u8 = parts.next()?.parse().ok()?;
        let tilt: u16 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || light1 > 100 || light2 > 100 {
            return None;
        }
        Some(Self {
            light_compartment1: light1,
            light_compartment2: light2,
            tilt,
        })
    }
}

/// A box-open transition observed for one compartment.
///
/// Ephemeral -- routed to the consumption ledger, never persisted. The
/// raw values and the thresholds used to classify them are carried along
/// for auditability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub compartment: Compartment,
    /// Whether the compartment read as emptied (pill removed).
    pub detected: bool,
    pub box_state: BoxState,
    pub timestamp: DateTime<Utc>,
    pub light_value: u8,
    pub tilt_value: u16,
    pub thresholds: SensorThresholds,
}

/// Stateless tilt classifier for instantaneous display.
pub fn box_state(tilt: u16, threshold: u16) -> BoxState {
    if tilt >= threshold {
        BoxState::Open
    } else {
        BoxState::Closed
    }
}

/// Stateless light classifier for instantaneous display.
pub fn compartment_state(light: u8, threshold: u8) -> CompartmentState {
    if light < threshold {
        CompartmentState::Loaded
    } else {
        CompartmentState::Empty
    }
}

/// Edge-triggered detector over the live sensor stream.
///
/// Owns the previous-value state for one device connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorDetector {
    previous_tilt: u16,
    previous_light: [u8; 2],
}

impl SensorDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all previous values. Must be invoked on reconnection.
    pub fn reset(&mut self) {
        self.previous_tilt = 0;
        self.previous_light = [0, 0];
    }

    /// Feed one single-compartment reading.
    ///
    /// Returns an event only on the tilt rising edge. Previous values are
    /// updated unconditionally so the state always reflects the latest
    /// tick, whether or not an event fired.
    pub fn detect(
        &mut self,
        compartment: Compartment,
        light: u8,
        tilt: u16,
        thresholds: &SensorThresholds,
    ) -> Option<SensorEvent> {
        let box_just_opened = tilt >= thresholds.tilt && self.previous_tilt < thresholds.tilt;

        self.previous_tilt = tilt;
        self.previous_light[compartment_index(compartment)] = light;

        if !box_just_opened {
            return None;
        }

        Some(SensorEvent {
            compartment,
            detected: light > thresholds.light_for(compartment),
            box_state: BoxState::Open,
            timestamp: Utc::now(),
            light_value: light,
            tilt_value: tilt,
            thresholds: *thresholds,
        })
    }

    /// Feed one dual-compartment reading.
    ///
    /// The shared tilt edge is computed once; each compartment's light
    /// condition is then evaluated independently, producing 0, 1 or 2
    /// events in a single call.
    pub fn detect_both(
        &mut self,
        light1: u8,
        light2: u8,
        tilt: u16,
        thresholds: &SensorThresholds,
    ) -> Vec<SensorEvent> {
        let box_just_opened = tilt >= thresholds.tilt && self.previous_tilt < thresholds.tilt;

        self.previous_tilt = tilt;
        self.previous_light = [light1, light2];

        if !box_just_opened {
            return Vec::new();
        }

        let timestamp = Utc::now();
        [(Compartment::One, light1), (Compartment::Two, light2)]
            .into_iter()
            .map(|(compartment, light)| SensorEvent {
                compartment,
                detected: light > thresholds.light_for(compartment),
                box_state: BoxState::Open,
                timestamp,
                light_value: light,
                tilt_value: tilt,
                thresholds: *thresholds,
            })
            .collect()
    }

    pub fn previous_tilt(&self) -> u16 {
        self.previous_tilt
    }

    pub fn previous_light(&self, compartment: Compartment) -> u8 {
        self.previous_light[compartment_index(compartment)]
    }
}

fn compartment_index(compartment: Compartment) -> usize {
    (compartment.number() - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn thresholds() -> SensorThresholds {
        SensorThresholds {
            light_compartment1: 40,
            light_compartment2: 40,
            tilt: 1,
        }
    }

    #[test]
    fn rising_edge_emits_single_event() {
        let mut detector = SensorDetector::new();
        let th = thresholds();

        let event = detector.detect(Compartment::Two, 50, 2, &th).unwrap();
        assert!(event.detected);
        assert_eq!(event.box_state, BoxState::Open);
        assert_eq!(event.compartment, Compartment::Two);
        assert_eq!(event.light_value, 50);
        assert_eq!(event.tilt_value, 2);

        // Lid still open: no further event until tilt drops and rises again.
        assert!(detector.detect(Compartment::Two, 50, 2, &th).is_none());
        assert!(detector.detect(Compartment::Two, 50, 0, &th).is_none());
        assert!(detector.detect(Compartment::Two, 50, 2, &th).is_some());
    }

    #[test]
    fn dark_compartment_reports_not_detected() {
        let mut detector = SensorDetector::new();
        let event = detector
            .detect(Compartment::One, 10, 5, &thresholds())
            .unwrap();
        assert!(!event.detected);
        assert_eq!(event.box_state, BoxState::Open);
    }

    #[test]
    fn previous_values_update_without_event() {
        let mut detector = SensorDetector::new();
        let th = thresholds();

        assert!(detector.detect(Compartment::One, 30, 0, &th).is_none());
        assert_eq!(detector.previous_light(Compartment::One), 30);
        assert_eq!(detector.previous_tilt(), 0);
    }

    #[test]
    fn detect_both_shares_one_edge() {
        let mut detector = SensorDetector::new();
        let th = thresholds();

        let events = detector.detect_both(50, 10, 3, &th);
        assert_eq!(events.len(), 2);
        assert!(events[0].detected); // compartment 1, light 50 > 40
        assert!(!events[1].detected); // compartment 2, light 10 <= 40

        // Same tilt on the next tick: the edge already fired.
        assert!(detector.detect_both(50, 10, 3, &th).is_empty());
        assert_eq!(detector.previous_light(Compartment::One), 50);
        assert_eq!(detector.previous_light(Compartment::Two), 10);
    }

    #[test]
    fn reset_restores_edge_sensitivity() {
        let mut detector = SensorDetector::new();
        let th = thresholds();

        assert!(detector.detect(Compartment::One, 50, 2, &th).is_some());
        assert!(detector.detect(Compartment::One, 50, 2, &th).is_none());

        detector.reset();
        assert!(detector.detect(Compartment::One, 50, 2, &th).is_some());
    }

    #[test]
    fn stateless_classifiers() {
        assert_eq!(box_state(2, 1), BoxState::Open);
        assert_eq!(box_state(0, 1), BoxState::Closed);
        assert_eq!(compartment_state(10, 40), CompartmentState::Loaded);
        assert_eq!(compartment_state(60, 40), CompartmentState::Empty);
    }

    #[test]
    fn reading_parse_rejects_malformed_payloads() {
        assert_eq!(
            SensorReading::parse("55, 10, 3"),
            Some(SensorReading {
                light_compartment1: 55,
                light_compartment2: 10,
                tilt: 3,
            })
        );
        assert!(SensorReading::parse("55,10").is_none());
        assert!(SensorReading::parse("55,10,3,9").is_none());
        assert!(SensorReading::parse("150,10,3").is_none());
        assert!(SensorReading::parse("a,b,c").is_none());
        assert!(SensorReading::parse("").is_none());
    }

    #[test]
    fn thresholds_validate_range() {
        assert!(thresholds().validate().is_ok());
    }

    proptest! {
        /// Holding the tilt at or above threshold after an edge never
        /// produces a second event, regardless of light values.
        #[test]
        fn no_repeat_events_while_open(
            lights in proptest::collection::vec(0u8..=100, 1..20),
            tilt in 1u16..500,
        ) {
            let th = thresholds();
            let mut detector = SensorDetector::new();

            let first = detector.detect(Compartment::One, lights[0], tilt, &th);
            prop_assert!(first.is_some());

            for light in &lights[1..] {
                prop_assert!(detector
                    .detect(Compartment::One, *light, tilt, &th)
                    .is_none());
            }
        }

        /// The edge count equals the number of below-to-at-or-above tilt
        /// transitions in the input sequence.
        #[test]
        fn edge_count_matches_transitions(tilts in proptest::collection::vec(0u16..4, 0..40)) {
            let th = thresholds(); // tilt threshold = 1
            let mut detector = SensorDetector::new();

            let mut expected = 0;
            let mut prev = 0u16;
            let mut fired = 0;
            for tilt in &tilts {
                if *tilt >= th.tilt && prev < th.tilt {
                    expected += 1;
                }
                prev = *tilt;
                if detector.detect(Compartment::One, 50, *tilt, &th).is_some() {
                    fired += 1;
                }
            }
            prop_assert_eq!(fired, expected);
        }
    }
}
