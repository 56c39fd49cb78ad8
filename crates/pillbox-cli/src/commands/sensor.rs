use std::sync::{Arc, Mutex};

use chrono::Utc;
use clap::Subcommand;
use pillbox_core::sensor::{box_state, compartment_state};
use pillbox_core::{
    Compartment, Config, ConsumptionLedger, Database, Event, SensorDetector, SensorReading,
};

/// Detector state lives in the kv store so edge detection works across
/// CLI invocations, matching a device connection that outlives any one
/// process.
const DETECTOR_STATE_KEY: &str = "sensor_detector_state";

#[derive(Subcommand)]
pub enum SensorAction {
    /// Feed one raw reading through the detector
    Read {
        /// Raw payload `light1,light2,tilt`, e.g. `70,20,3`
        payload: String,
    },
    /// Show detector state and instantaneous classification
    State,
    /// Clear detector state after a device reconnection
    Reset,
}

pub fn run(action: SensorAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = super::shared_db()?;

    match action {
        SensorAction::Read { payload } => {
            let Some(reading) = SensorReading::parse(&payload) else {
                return Err(
                    format!("malformed reading '{payload}' (expected light1,light2,tilt)").into(),
                );
            };

            let config = Config::load_or_default();
            let mut detector = load_detector(&db)?;
            let events = detector.detect_both(
                reading.light_compartment1,
                reading.light_compartment2,
                reading.tilt,
                &config.thresholds,
            );
            save_detector(&db, &detector)?;

            let ledger = ConsumptionLedger::new(Arc::clone(&db));
            for event in &events {
                if let Some(outcome) = ledger.record_sensor_event(event)? {
                    log::info!("compartment {} dose recorded: {outcome:?}", event.compartment);
                }
            }

            let opened: Vec<Event> = events
                .iter()
                .map(|e| Event::BoxOpened {
                    compartment: e.compartment,
                    detected: e.detected,
                    at: e.timestamp,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&opened)?);
        }
        SensorAction::State => {
            let config = Config::load_or_default();
            let detector = load_detector(&db)?;
            let state = serde_json::json!({
                "previous_tilt": detector.previous_tilt(),
                "box": box_state(detector.previous_tilt(), config.thresholds.tilt),
                "compartment1": compartment_state(
                    detector.previous_light(Compartment::One),
                    config.thresholds.light_compartment1,
                ),
                "compartment2": compartment_state(
                    detector.previous_light(Compartment::Two),
                    config.thresholds.light_compartment2,
                ),
            });
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        SensorAction::Reset => {
            let mut detector = load_detector(&db)?;
            detector.reset();
            save_detector(&db, &detector)?;
            let event = Event::DetectorReset { at: Utc::now() };
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
    }
    Ok(())
}

fn load_detector(db: &Arc<Mutex<Database>>) -> Result<SensorDetector, Box<dyn std::error::Error>> {
    match super::lock(db).kv_get(DETECTOR_STATE_KEY)? {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(SensorDetector::new()),
    }
}

fn save_detector(
    db: &Arc<Mutex<Database>>,
    detector: &SensorDetector,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string(detector)?;
    super::lock(db).kv_set(DETECTOR_STATE_KEY, &json)?;
    Ok(())
}
