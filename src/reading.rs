//! The reading value object
//!
//! One measurement window `[start, end)` with an energy delta, optional
//! adjustment deltas, and instantaneous attributes sampled at the device.
//! All merge, split, gap-fill and history-adjustment arithmetic lives on
//! this type; collections only decide *which* readings the primitives run
//! against.
//!
//! Energy-like quantities carry five fractional digits so that equality
//! and idempotence checks are well-defined after repeated arithmetic.

use crate::error::EngineError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Fractional digits carried by energy-like quantities (kWh)
pub const ENERGY_DECIMALS: u32 = 5;
/// Fractional digits stored for volts and amps
pub const VOLTAGE_DECIMALS: u32 = 2;
/// Fractional digits stored for grid frequency
pub const FREQUENCY_DECIMALS: u32 = 1;

/// Round to a fixed number of fractional digits.
pub fn round_dp(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

fn round_energy(value: f64) -> f64 {
    round_dp(value, ENERGY_DECIMALS)
}

fn opt_round_energy(value: Option<f64>) -> Option<f64> {
    value.map(round_energy)
}

fn opt_max(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn opt_min(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// One measurement record.
///
/// A reading is owned by exactly one collection at a time; dirty state is
/// carried on the reading itself (`update_pending`) and collected by the
/// owning period, never propagated through back-references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Window start (UTC)
    pub start: DateTime<Utc>,
    /// Window end (UTC); always `start + duration`
    pub end: DateTime<Utc>,
    /// Energy recorded in this window (kWh)
    pub energy_delta: f64,
    /// Calibration adjustment on top of `energy_delta` (kWh)
    pub calibration_delta: Option<f64>,
    /// History-reconciliation adjustment (kWh)
    pub history_delta: Option<f64>,
    /// Running counter since start of day (kWh)
    pub energy_today: Option<f64>,
    /// Lifetime running counter (kWh)
    pub energy_total: Option<f64>,
    /// Instantaneous power (W)
    pub power: Option<f64>,
    /// Lowest power seen in the window (W)
    pub min_power: Option<f64>,
    /// Highest power seen in the window (W)
    pub max_power: Option<f64>,
    /// AC voltage (V)
    pub volts: Option<f64>,
    /// AC current (A)
    pub amps: Option<f64>,
    /// Grid frequency (Hz)
    pub frequency: Option<f64>,
    /// Device temperature (°C)
    pub temperature: Option<f64>,
    /// Device operating mode as reported
    pub mode: Option<String>,
    /// Device error code, zero or absent when healthy
    pub error_code: Option<u32>,
    /// A row for this reading exists in the store
    pub in_database: bool,
    /// The in-memory state differs from the stored row
    pub update_pending: bool,
    /// Derived from an authoritative low-resolution history record;
    /// exempt from interval splitting and merging
    pub is_history: bool,
    /// Produced by aggregating consolidation sources
    pub is_consolidation: bool,
}

impl Reading {
    /// A reading covering `[start, end)` with the given energy delta and
    /// no instantaneous attributes.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, energy_delta: f64) -> Reading {
        Reading {
            start,
            end,
            energy_delta: round_energy(energy_delta),
            calibration_delta: None,
            history_delta: None,
            energy_today: None,
            energy_total: None,
            power: None,
            min_power: None,
            max_power: None,
            volts: None,
            amps: None,
            frequency: None,
            temperature: None,
            mode: None,
            error_code: None,
            in_database: false,
            update_pending: true,
            is_history: false,
            is_consolidation: false,
        }
    }

    /// A zero-energy reading covering `[start, end)`; used as the seed
    /// bucket for consolidation aggregation.
    pub fn zero(start: DateTime<Utc>, end: DateTime<Utc>) -> Reading {
        Reading::new(start, end, 0.0)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// Energy delta with calibration and history adjustments applied.
    pub fn effective_delta(&self) -> f64 {
        self.energy_delta
            + self.calibration_delta.unwrap_or(0.0)
            + self.history_delta.unwrap_or(0.0)
    }

    /// Whether `other` covers exactly the same window.
    pub fn same_span(&self, other: &Reading) -> bool {
        self.start == other.start && self.end == other.end
    }

    /// Whether `other` overlaps this reading's `[start, end)` window.
    pub fn overlaps(&self, other: &Reading) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn min_power_or_power(&self) -> Option<f64> {
        self.min_power.or(self.power)
    }

    fn max_power_or_power(&self) -> Option<f64> {
        self.max_power.or(self.power)
    }

    /// Prorated copy covering `new_duration` seconds ending at `new_end`.
    ///
    /// Energy-like deltas scale by `new_duration / duration`; the
    /// instantaneous attributes are copied unchanged. The copy keeps
    /// `in_database` only when it still ends at the same time and covers
    /// the same span; any reshaped copy is a record the store has not
    /// seen in this form.
    pub fn clone_to(&self, new_end: DateTime<Utc>, new_duration_seconds: i64) -> Reading {
        let old_seconds = self.duration_seconds();
        if new_end == self.end && new_duration_seconds == old_seconds {
            return self.clone();
        }
        let ratio = new_duration_seconds as f64 / old_seconds as f64;
        let mut copy = self.clone();
        copy.start = new_end - Duration::seconds(new_duration_seconds);
        copy.end = new_end;
        copy.energy_delta = round_energy(self.energy_delta * ratio);
        copy.calibration_delta = opt_round_energy(self.calibration_delta.map(|d| d * ratio));
        copy.history_delta = opt_round_energy(self.history_delta.map(|d| d * ratio));
        copy.in_database = self.in_database && new_end == self.end;
        copy.update_pending = true;
        copy
    }

    /// Split at `at`, conserving every delta exactly: the head is
    /// prorated and the tail receives the remainder, so head + tail
    /// always reproduce the original to the last digit.
    pub fn split_at(&self, at: DateTime<Utc>) -> Result<(Reading, Reading), EngineError> {
        if at <= self.start || at >= self.end {
            return Err(EngineError::SplitOutOfRange {
                at,
                start: self.start,
                end: self.end,
            });
        }
        let head = self.clone_to(at, (at - self.start).num_seconds());
        let mut tail = self.clone_to(self.end, (self.end - at).num_seconds());
        tail.energy_delta = round_energy(self.energy_delta - head.energy_delta);
        tail.calibration_delta = match (self.calibration_delta, head.calibration_delta) {
            (Some(total), Some(first)) => Some(round_energy(total - first)),
            (total, _) => total,
        };
        tail.history_delta = match (self.history_delta, head.history_delta) {
            (Some(total), Some(first)) => Some(round_energy(total - first)),
            (total, _) => total,
        };
        Ok((head, tail))
    }

    /// Merge `other` into this reading. The single merge primitive used
    /// by interval consolidation, multi-source aggregation and history
    /// range totals.
    ///
    /// The merged window is the union of the two spans, so merging
    /// adjacent readings extends the duration by the other's duration
    /// while same-span aggregation leaves it unchanged. Deltas sum with
    /// `operation_factor` (±1), running counters take the larger value,
    /// power extremes widen, and instantaneous attributes take the
    /// latest non-null value.
    pub fn accumulate(&mut self, other: &Reading, operation_factor: f64) {
        let new_end = self.end.max(other.end);

        self.energy_delta =
            round_energy(self.energy_delta + other.energy_delta * operation_factor);
        self.calibration_delta = match (self.calibration_delta, other.calibration_delta) {
            (None, None) => None,
            (a, b) => Some(round_energy(
                a.unwrap_or(0.0) + b.unwrap_or(0.0) * operation_factor,
            )),
        };
        self.history_delta = match (self.history_delta, other.history_delta) {
            (None, None) => None,
            (a, b) => Some(round_energy(
                a.unwrap_or(0.0) + b.unwrap_or(0.0) * operation_factor,
            )),
        };

        self.energy_today = opt_max(self.energy_today, other.energy_today);
        self.energy_total = opt_max(self.energy_total, other.energy_total);

        self.min_power = opt_min(self.min_power_or_power(), other.min_power_or_power());
        self.max_power = opt_max(self.max_power_or_power(), other.max_power_or_power());

        self.power = other.power.or(self.power);
        self.volts = other.volts.or(self.volts);
        self.amps = other.amps.or(self.amps);
        self.frequency = other.frequency.or(self.frequency);
        self.temperature = other.temperature.or(self.temperature);
        self.mode = other.mode.clone().or(self.mode.take());
        self.error_code = other.error_code.or(self.error_code);

        self.is_history |= other.is_history;
        self.is_consolidation |= other.is_consolidation;

        if new_end != self.end {
            self.in_database = false;
        }
        self.start = self.start.min(other.start);
        self.end = new_end;
        self.update_pending = true;
    }

    /// Manufacture a synthetic reading covering the `gap_seconds` ending
    /// at `gap_end`, prorated from this reading as the pattern.
    ///
    /// With `borrow`, this reading's own deltas are reduced by exactly
    /// the amount given away, so the pair still sums to the original.
    /// The synthetic reading is never history-derived regardless of the
    /// pattern.
    pub fn fill_small_gap(
        &mut self,
        gap_end: DateTime<Utc>,
        gap_seconds: i64,
        borrow: bool,
    ) -> Reading {
        let mut synthetic = self.clone_to(gap_end, gap_seconds);
        synthetic.is_history = false;
        synthetic.in_database = false;
        synthetic.energy_today = None;
        synthetic.energy_total = None;
        if borrow {
            self.energy_delta = round_energy(self.energy_delta - synthetic.energy_delta);
            if let (Some(own), Some(given)) = (self.calibration_delta, synthetic.calibration_delta)
            {
                self.calibration_delta = Some(round_energy(own - given));
            }
            if let (Some(own), Some(given)) = (self.history_delta, synthetic.history_delta) {
                self.history_delta = Some(round_energy(own - given));
            }
            self.update_pending = true;
        }
        synthetic
    }

    /// Distribute the variance between an authoritative history record
    /// and the matched actual total into this reading's `history_delta`,
    /// evenly by duration.
    ///
    /// The two totals must cover the same number of seconds; a mismatch
    /// means the caller selected an inconsistent sub-range and is an
    /// error, never silently absorbed.
    pub fn history_adjust_average(
        &mut self,
        actual_total: &Reading,
        history: &Reading,
    ) -> Result<(), EngineError> {
        let history_seconds = history.duration_seconds();
        let actual_seconds = actual_total.duration_seconds();
        if history_seconds != actual_seconds {
            return Err(EngineError::HistoryDurationMismatch {
                history_seconds,
                actual_seconds,
            });
        }
        let variance = history.effective_delta() - actual_total.effective_delta();
        let share = variance * self.duration_seconds() as f64 / history_seconds as f64;
        self.history_delta = Some(round_energy(self.history_delta.unwrap_or(0.0) + share));
        self.update_pending = true;
        Ok(())
    }

    /// Distribute the residual variance proportionally to this reading's
    /// own delta. Readings that recorded nothing (or negative noise)
    /// take no share.
    pub fn history_adjust_prorata(&mut self, actual_total: &Reading, history: &Reading) {
        let own = self.effective_delta();
        let total = actual_total.effective_delta();
        if own <= 0.0 || total <= 0.0 {
            return;
        }
        let variance = history.effective_delta() - total;
        let share = variance * own / total;
        self.history_delta = Some(round_energy(self.history_delta.unwrap_or(0.0) + share));
        self.update_pending = true;
    }

    /// Compare calibrated delta values rounded to `digits`, ignoring the
    /// running counters. Drives reconciliation convergence checks and
    /// idempotent-persistence dedupe.
    pub fn compare_value(&self, other: &Reading, digits: u32) -> Ordering {
        let a = round_dp(self.effective_delta(), digits);
        let b = round_dp(other.effective_delta(), digits);
        a.total_cmp(&b)
    }

    /// Whether `other` records the same measurement: same window, same
    /// rounded deltas, same attributes. Flags are not compared.
    pub fn values_equal(&self, other: &Reading) -> bool {
        self.same_span(other)
            && self.compare_value(other, ENERGY_DECIMALS) == Ordering::Equal
            && self.energy_today == other.energy_today
            && self.energy_total == other.energy_total
            && self.power == other.power
            && self.min_power == other.min_power
            && self.max_power == other.max_power
            && self.volts == other.volts
            && self.amps == other.amps
            && self.frequency == other.frequency
            && self.temperature == other.temperature
            && self.mode == other.mode
            && self.error_code == other.error_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn reading(start: &str, end: &str, delta: f64) -> Reading {
        Reading::new(ts(start), ts(end), delta)
    }

    #[test]
    fn test_clone_to_prorates_deltas() {
        let mut r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        r.calibration_delta = Some(0.1);
        r.power = Some(2500.0);

        let half = r.clone_to(ts("2024-03-15T00:02:30Z"), 150);
        assert_eq!(half.energy_delta, 0.5);
        assert_eq!(half.calibration_delta, Some(0.05));
        assert_eq!(half.power, Some(2500.0));
        assert_eq!(half.duration_seconds(), 150);
    }

    #[test]
    fn test_clone_to_in_database_preserved_only_for_same_end() {
        let mut r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        r.in_database = true;

        let trimmed = r.clone_to(ts("2024-03-15T00:05:00Z"), 120);
        assert!(trimmed.in_database);

        let moved = r.clone_to(ts("2024-03-15T00:04:00Z"), 120);
        assert!(!moved.in_database);
    }

    #[test]
    fn test_split_conserves_delta() {
        // An awkward delta whose prorated halves do not round cleanly
        let r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.00001);
        let (head, tail) = r.split_at(ts("2024-03-15T00:02:00Z")).unwrap();
        assert_eq!(head.duration_seconds(), 120);
        assert_eq!(tail.duration_seconds(), 180);
        assert_eq!(round_dp(head.energy_delta + tail.energy_delta, 5), 1.00001);
    }

    #[test]
    fn test_split_outside_window_fails() {
        let r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        assert!(r.split_at(ts("2024-03-15T00:00:00Z")).is_err());
        assert!(r.split_at(ts("2024-03-15T00:05:00Z")).is_err());
    }

    #[test]
    fn test_accumulate_adjacent_extends_duration() {
        let mut a = reading("2024-03-15T00:00:00Z", "2024-03-15T00:02:00Z", 1.0);
        let b = reading("2024-03-15T00:02:00Z", "2024-03-15T00:05:00Z", 1.5);
        a.accumulate(&b, 1.0);
        assert_eq!(a.energy_delta, 2.5);
        assert_eq!(a.duration_seconds(), 300);
        assert_eq!(a.end, ts("2024-03-15T00:05:00Z"));
    }

    #[test]
    fn test_accumulate_same_span_subtract() {
        let mut a = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 2.0);
        let b = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 2.0);
        a.accumulate(&b, -1.0);
        assert_eq!(a.energy_delta, 0.0);
        assert_eq!(a.duration_seconds(), 300);
    }

    #[test]
    fn test_accumulate_counters_and_extremes() {
        let mut a = reading("2024-03-15T00:00:00Z", "2024-03-15T00:02:00Z", 1.0);
        a.energy_today = Some(3.0);
        a.power = Some(1000.0);
        let mut b = reading("2024-03-15T00:02:00Z", "2024-03-15T00:05:00Z", 1.0);
        b.energy_today = Some(4.0);
        b.power = Some(1800.0);
        b.volts = Some(231.5);

        a.accumulate(&b, 1.0);
        assert_eq!(a.energy_today, Some(4.0));
        assert_eq!(a.min_power, Some(1000.0));
        assert_eq!(a.max_power, Some(1800.0));
        assert_eq!(a.power, Some(1800.0));
        assert_eq!(a.volts, Some(231.5));
    }

    #[test]
    fn test_fill_small_gap_conserves_total() {
        let mut neighbour = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        let synthetic =
            neighbour.fill_small_gap(ts("2024-03-15T00:06:00Z"), 60, true);

        assert_eq!(synthetic.duration_seconds(), 60);
        assert_eq!(synthetic.energy_delta, 0.2);
        assert_eq!(neighbour.energy_delta, 0.8);
        assert_eq!(
            round_dp(synthetic.energy_delta + neighbour.energy_delta, 5),
            1.0
        );
        assert!(!synthetic.is_history);
        assert!(!synthetic.in_database);
    }

    #[test]
    fn test_history_adjust_average_requires_equal_durations() {
        let mut r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        let actual = reading("2024-03-15T00:00:00Z", "2024-03-15T01:00:00Z", 10.0);
        let history = reading("2024-03-15T00:00:00Z", "2024-03-15T00:30:00Z", 12.0);
        assert!(r.history_adjust_average(&actual, &history).is_err());
    }

    #[test]
    fn test_history_adjust_average_distributes_by_duration() {
        let mut r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:15:00Z", 1.0);
        let actual = reading("2024-03-15T00:00:00Z", "2024-03-15T01:00:00Z", 10.0);
        let history = reading("2024-03-15T00:00:00Z", "2024-03-15T01:00:00Z", 12.0);
        r.history_adjust_average(&actual, &history).unwrap();
        // Variance 2.0 spread over an hour; this reading covers a quarter
        assert_eq!(r.history_delta, Some(0.5));
    }

    #[test]
    fn test_history_adjust_prorata_weights_by_delta() {
        let mut r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:15:00Z", 4.0);
        let actual = reading("2024-03-15T00:00:00Z", "2024-03-15T01:00:00Z", 10.0);
        let history = reading("2024-03-15T00:00:00Z", "2024-03-15T01:00:00Z", 12.5);
        r.history_adjust_prorata(&actual, &history);
        // Variance 2.5 weighted by 4/10
        assert_eq!(r.history_delta, Some(1.0));
    }

    #[test]
    fn test_history_adjust_prorata_skips_zero_delta() {
        let mut r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:15:00Z", 0.0);
        let actual = reading("2024-03-15T00:00:00Z", "2024-03-15T01:00:00Z", 10.0);
        let history = reading("2024-03-15T00:00:00Z", "2024-03-15T01:00:00Z", 12.5);
        r.history_adjust_prorata(&actual, &history);
        assert_eq!(r.history_delta, None);
    }

    #[test]
    fn test_compare_value_ignores_counters() {
        let mut a = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        a.energy_today = Some(100.0);
        let mut b = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 0.9);
        b.calibration_delta = Some(0.1);
        assert_eq!(a.compare_value(&b, 5), Ordering::Equal);
    }
}
