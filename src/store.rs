//! Persistence collaborator interface
//!
//! The engine never talks SQL; it hands rounded row images to a
//! [`ReadingStore`] and reacts to the outcome. Rows are keyed by
//! `(device_feature, reading_end)`. Numeric columns are rounded before
//! they leave the engine (five fractional digits for energy-like
//! quantities, two for volts/amps, one for frequency) so that repeated
//! writes of an unchanged reading compare equal.
//!
//! [`MemoryStore`] is the reference implementation used by tests and by
//! deployments without a relational backend. It serialises all writers
//! behind one lock, matching the single-writer policy real backends
//! need; that lock is always taken after a collection lock, never
//! before.

use crate::reading::{round_dp, Reading, ENERGY_DECIMALS, FREQUENCY_DECIMALS, VOLTAGE_DECIMALS};
use crate::types::DeviceFeature;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by a reading store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row already exists: {0}")]
    Duplicate(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// One persisted reading row, rounded for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingRecord {
    pub feature: DeviceFeature,
    pub reading_end: DateTime<Utc>,
    pub reading_start: DateTime<Utc>,
    pub energy_today: Option<f64>,
    pub energy_total: Option<f64>,
    pub energy_delta: f64,
    pub calibration_delta: Option<f64>,
    pub history_delta: Option<f64>,
    pub mode: Option<String>,
    pub error_code: Option<u32>,
    pub power: Option<f64>,
    pub volts: Option<f64>,
    pub amps: Option<f64>,
    pub frequency: Option<f64>,
    pub temperature: Option<f64>,
    pub min_power: Option<f64>,
    pub max_power: Option<f64>,
}

impl ReadingRecord {
    /// Row image of a reading, applying the storage rounding rules.
    pub fn from_reading(feature: DeviceFeature, reading: &Reading) -> ReadingRecord {
        let energy = |v: f64| round_dp(v, ENERGY_DECIMALS);
        ReadingRecord {
            feature,
            reading_end: reading.end,
            reading_start: reading.start,
            energy_today: reading.energy_today.map(energy),
            energy_total: reading.energy_total.map(energy),
            energy_delta: energy(reading.energy_delta),
            calibration_delta: reading.calibration_delta.map(energy),
            history_delta: reading.history_delta.map(energy),
            mode: reading.mode.clone(),
            error_code: reading.error_code,
            power: reading.power.map(energy),
            volts: reading.volts.map(|v| round_dp(v, VOLTAGE_DECIMALS)),
            amps: reading.amps.map(|v| round_dp(v, VOLTAGE_DECIMALS)),
            frequency: reading.frequency.map(|v| round_dp(v, FREQUENCY_DECIMALS)),
            temperature: reading.temperature,
            min_power: reading.min_power.map(energy),
            max_power: reading.max_power.map(energy),
        }
    }

    /// Reconstruct the in-memory reading. Loaded readings are clean by
    /// definition: the row is the source they came from.
    pub fn to_reading(&self) -> Reading {
        let mut reading = Reading::new(self.reading_start, self.reading_end, self.energy_delta);
        reading.energy_today = self.energy_today;
        reading.energy_total = self.energy_total;
        reading.calibration_delta = self.calibration_delta;
        reading.history_delta = self.history_delta;
        reading.mode = self.mode.clone();
        reading.error_code = self.error_code;
        reading.power = self.power;
        reading.volts = self.volts;
        reading.amps = self.amps;
        reading.frequency = self.frequency;
        reading.temperature = self.temperature;
        reading.min_power = self.min_power;
        reading.max_power = self.max_power;
        reading.in_database = true;
        reading.update_pending = false;
        reading
    }

    fn key_string(&self) -> String {
        format!("{}@{}", self.feature, self.reading_end)
    }
}

/// Storage backend for reading rows.
///
/// Implementations serialise concurrent writers internally; callers hold
/// their collection lock first and never in the reverse order.
pub trait ReadingStore: Send + Sync {
    fn insert(&self, record: &ReadingRecord) -> Result<(), StoreError>;
    fn update(&self, record: &ReadingRecord) -> Result<(), StoreError>;
    fn delete(&self, feature: &DeviceFeature, reading_end: DateTime<Utc>)
        -> Result<(), StoreError>;
    /// Rows with `from < reading_end <= to`, oldest first. The lower
    /// bound is exclusive because rows are keyed by end time: a row
    /// ending exactly at a period start belongs to the preceding
    /// period.
    fn load_range(
        &self,
        feature: &DeviceFeature,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReadingRecord>, StoreError>;
}

/// In-memory reading store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<(DeviceFeature, DateTime<Utc>), ReadingRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().expect("store lock poisoned").len()
    }

    pub fn get(
        &self,
        feature: &DeviceFeature,
        reading_end: DateTime<Utc>,
    ) -> Option<ReadingRecord> {
        self.rows
            .lock()
            .expect("store lock poisoned")
            .get(&(*feature, reading_end))
            .cloned()
    }
}

impl ReadingStore for MemoryStore {
    fn insert(&self, record: &ReadingRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        let key = (record.feature, record.reading_end);
        if rows.contains_key(&key) {
            return Err(StoreError::Duplicate(record.key_string()));
        }
        rows.insert(key, record.clone());
        Ok(())
    }

    fn update(&self, record: &ReadingRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        let key = (record.feature, record.reading_end);
        match rows.get_mut(&key) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.key_string())),
        }
    }

    fn delete(
        &self,
        feature: &DeviceFeature,
        reading_end: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        match rows.remove(&(*feature, reading_end)) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("{feature}@{reading_end}"))),
        }
    }

    fn load_range(
        &self,
        feature: &DeviceFeature,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReadingRecord>, StoreError> {
        let rows = self.rows.lock().expect("store lock poisoned");
        Ok(rows
            .range((
                std::ops::Bound::Excluded((*feature, from)),
                std::ops::Bound::Included((*feature, to)),
            ))
            .map(|(_, record)| record.clone())
            .collect())
    }
}
