//! Sunledger - Period/reading consolidation engine for solar telemetry
//!
//! Sunledger turns the periodic telemetry of solar inverters and energy
//! meters (power, energy, voltage, temperature) into a gap-free,
//! boundary-aligned, persistable time series: readings are routed into
//! calendar periods, aligned to the recording grid, merged per
//! sub-interval, gap-filled with conserved totals, and reconciled
//! against authoritative low-resolution history records. Virtual
//! consolidation devices aggregate several real series lazily.
//!
//! ## Modules
//!
//! - **Period geometry**: calendar windows and sub-interval numbering
//! - **Readings**: the measurement value object and its merge/split
//!   primitives, plus the invariant-checked per-period collection
//! - **Periods**: per-feature period instances and their container
//! - **Consolidation**: declarative source → target aggregation links
//! - **Engine**: the stateful facade drivers and schedulers talk to
//!
//! Wire protocols, scheduling and SQL live outside this crate; the
//! engine sees them only through the [`ReadingStore`] and
//! [`OutputNotifier`] traits.

pub mod consolidation;
pub mod detail_period;
pub mod detail_periods;
pub mod engine;
pub mod error;
pub mod notify;
pub mod period;
pub mod reading;
pub mod readings;
pub mod store;
pub mod types;

pub use consolidation::{ConsolidationLink, ConsolidationOp, ConsolidationRegistry};
pub use detail_period::{DeviceDetailPeriod, SyncOutcome};
pub use detail_periods::DeviceDetailPeriods;
pub use engine::{FeatureRegistration, TelemetryEngine};
pub use error::EngineError;
pub use notify::{NullNotifier, OutputNotifier};
pub use period::{Period, PeriodType};
pub use reading::Reading;
pub use readings::{AddMode, ReadingsCollection};
pub use store::{MemoryStore, ReadingRecord, ReadingStore, StoreError};
pub use types::{
    DeviceFeature, DeviceId, DeviceParams, EngineConfig, FeatureId, FeatureKind, PeriodSpec,
};

/// Engine version embedded in diagnostics
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
