//! Shared identifiers and configuration for the Sunledger engine
//!
//! This module defines how device-feature series are addressed and the
//! tunable limits the consolidation engine runs under. Drivers resolve
//! device identity; the engine only ever sees the typed identifiers here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a physical or virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generate a fresh device identity
    pub fn new() -> Self {
        DeviceId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        DeviceId(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of measurement series a device-feature records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// AC-side energy produced by an inverter
    YieldAc,
    /// DC-side energy measured at the panel strings
    YieldDc,
    /// Energy exported to the grid
    GridFeedIn,
    /// Energy imported from the grid
    GridDraw,
    /// Site consumption
    Consumption,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::YieldAc => "yield_ac",
            FeatureKind::YieldDc => "yield_dc",
            FeatureKind::GridFeedIn => "grid_feed_in",
            FeatureKind::GridDraw => "grid_draw",
            FeatureKind::Consumption => "consumption",
        }
    }
}

/// One measurement series on a device: a kind plus an instance index
/// (multi-string inverters expose e.g. `yield_dc` 0 and 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureId {
    pub kind: FeatureKind,
    pub index: u8,
}

impl FeatureId {
    pub fn new(kind: FeatureKind, index: u8) -> Self {
        FeatureId { kind, index }
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.index)
    }
}

/// Fully-qualified address of one reading series
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceFeature {
    pub device: DeviceId,
    pub feature: FeatureId,
}

impl DeviceFeature {
    pub fn new(device: DeviceId, feature: FeatureId) -> Self {
        DeviceFeature { device, feature }
    }
}

impl std::fmt::Display for DeviceFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device, self.feature)
    }
}

/// How one feature's series is recorded: the period shape, the
/// sub-interval grain within it, and the site's calendar offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSpec {
    pub period_type: crate::period::PeriodType,
    pub interval_seconds: u32,
    pub offset_seconds: i32,
}

impl PeriodSpec {
    pub fn new(
        period_type: crate::period::PeriodType,
        interval_seconds: u32,
        offset_seconds: i32,
    ) -> Self {
        PeriodSpec {
            period_type,
            interval_seconds,
            offset_seconds,
        }
    }
}

/// Per-device behaviour switches, resolved by the driver layer
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Device reports running counters rather than per-reading deltas;
    /// deltas are derived during normalisation
    pub derive_from_totals: bool,
    /// Persist the trimmed remainder when a reading is cut at a period
    /// boundary instead of dropping it
    pub enforce_interval: bool,
    /// Meter calibration factor; populates `calibration_delta` when set
    pub calibration_factor: Option<f64>,
}

/// Engine-wide limits and retention settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Largest inter-reading gap (seconds) eligible for automatic
    /// prorated fill; larger gaps wait for history reconciliation
    pub small_gap_limit_seconds: i64,
    /// Gaps at or below this size (seconds) are below the drivers' own
    /// timestamp grain and are ignored
    pub gap_ignore_seconds: i64,
    /// Maximum tolerated overshoot (seconds) past a period boundary
    /// before a reading is rejected outright
    pub period_overlap_limit_seconds: i64,
    /// A finished period untouched for this long (seconds) is flushed
    /// and dropped from memory
    pub stale_retention_seconds: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            small_gap_limit_seconds: 120,
            gap_ignore_seconds: 1,
            period_overlap_limit_seconds: 4 * 3600,
            stale_retention_seconds: 24 * 3600,
        }
    }
}
