//! Error types for Sunledger

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while consolidating readings
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("reading {new_start}..{new_end} overlaps existing reading {existing_start}..{existing_end}")]
    Overlap {
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        existing_start: DateTime<Utc>,
        existing_end: DateTime<Utc>,
    },

    #[error("reading {start}..{end} lies outside period {period_start}..{period_end}")]
    OutOfPeriod {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },

    #[error("reading ending {end} has non-positive duration ({seconds}s)")]
    NonPositiveDuration { end: DateTime<Utc>, seconds: i64 },

    #[error("reading overshoots period boundary by {overshoot_seconds}s (limit {limit_seconds}s)")]
    BoundaryOvershoot {
        overshoot_seconds: i64,
        limit_seconds: i64,
    },

    #[error("history range {range_start}..{range_end} is not aligned to interval boundaries")]
    HistoryMisaligned {
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    },

    #[error("history record covers {history_seconds}s but matched readings cover {actual_seconds}s")]
    HistoryDurationMismatch {
        history_seconds: i64,
        actual_seconds: i64,
    },

    #[error("no period registration for feature: {0}")]
    UnknownFeature(String),

    #[error("split time {at} is outside reading {start}..{end}")]
    SplitOutOfRange {
        at: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),
}
