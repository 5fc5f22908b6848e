//! One period instance bound to a device-feature
//!
//! A `DeviceDetailPeriod` wraps the readings collection of one period
//! with everything that needs period context: boundary trimming on
//! insert, the normalisation pass, database sync bookkeeping, and the
//! history-reconciliation pipeline.
//!
//! Lifecycle: a period is created empty (or loaded from the store),
//! accepts readings while active, oscillates between dirty and persisted
//! as sync cycles run, and becomes discardable once its end has passed
//! and nothing has touched it for the retention window.
//!
//! All state lives behind one mutex; multi-step operations (the whole
//! history pipeline included) run under a single lock hold so no caller
//! observes a half-reconciled sub-range.

use crate::error::EngineError;
use crate::period::Period;
use crate::reading::{round_dp, Reading, ENERGY_DECIMALS};
use crate::readings::{AddMode, ReadingsCollection};
use crate::store::{ReadingRecord, ReadingStore, StoreError};
use crate::types::{DeviceFeature, DeviceParams, EngineConfig};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, warn};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of one database sync pass.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// End times of readings persisted this pass, oldest first; each is
    /// a finalised sub-interval downstream consumers may act on.
    pub finalised: Vec<DateTime<Utc>>,
    /// Readings whose write failed twice; they stay pending and retry
    /// on the next cycle.
    pub failed: usize,
}

struct PeriodState {
    readings: ReadingsCollection,
    last_find_time: DateTime<Utc>,
}

/// One period of one device-feature series.
pub struct DeviceDetailPeriod {
    period: Period,
    feature: DeviceFeature,
    params: DeviceParams,
    store: Arc<dyn ReadingStore>,
    state: Mutex<PeriodState>,
}

impl DeviceDetailPeriod {
    pub fn new(
        period: Period,
        feature: DeviceFeature,
        params: DeviceParams,
        store: Arc<dyn ReadingStore>,
        now: DateTime<Utc>,
    ) -> Self {
        DeviceDetailPeriod {
            feature,
            params,
            store,
            state: Mutex::new(PeriodState {
                readings: ReadingsCollection::new(period),
                last_find_time: now,
            }),
            period,
        }
    }

    pub fn period(&self) -> &Period {
        &self.period
    }

    pub fn feature(&self) -> DeviceFeature {
        self.feature
    }

    pub fn params(&self) -> DeviceParams {
        self.params
    }

    fn lock(&self) -> MutexGuard<'_, PeriodState> {
        self.state.lock().expect("period lock poisoned")
    }

    /// Populate from the store. A stored row spanning more than one
    /// sub-interval can only have come from history reconciliation, so
    /// it is re-flagged as history-derived on the way in.
    pub fn load(&self) -> Result<usize, EngineError> {
        let records =
            self.store
                .load_range(&self.feature, self.period.start(), self.period.end())?;
        let mut state = self.lock();
        let count = records.len();
        for record in records {
            let mut reading = record.to_reading();
            let (start_interval, _) = self.period.interval_of(reading.start, false);
            let (end_interval, _) = self.period.interval_of(reading.end, true);
            if end_interval > start_interval {
                reading.is_history = true;
            }
            state.readings.add_reading(reading, AddMode::Insert)?;
        }
        debug!(
            "loaded {count} readings for {} period starting {}",
            self.feature,
            self.period.start()
        );
        Ok(count)
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        self.lock().last_find_time = now;
    }

    pub fn last_find_time(&self) -> DateTime<Utc> {
        self.lock().last_find_time
    }

    pub fn has_pending_work(&self) -> bool {
        self.lock().readings.has_pending_work()
    }

    /// A period is discardable once it has ended (relative to the start
    /// of the current day on its own calendar grid) and nothing has
    /// looked at it for the retention window.
    pub fn is_discardable(&self, now: DateTime<Utc>, retention_seconds: i64) -> bool {
        let today = crate::period::period_start(
            crate::period::PeriodType::Day,
            self.period.offset_seconds(),
            now,
            false,
        );
        self.period.end() <= today
            && now - self.last_find_time() > Duration::seconds(retention_seconds)
    }

    /// Copy of the current readings, oldest first.
    pub fn readings_snapshot(&self) -> Vec<Reading> {
        self.lock().readings.readings().to_vec()
    }

    /// Insert a reading, trimming at the period boundaries.
    ///
    /// An overshoot within the overlap limit is recovered by splitting
    /// at the boundary; the remainder outside the period is dropped (or
    /// persisted, when the device is configured to enforce intervals).
    /// A larger overshoot means a driver or clock defect and fails the
    /// whole insert.
    pub fn add_reading(
        &self,
        reading: Reading,
        mode: AddMode,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        let mut reading = reading;
        if reading.duration_seconds() <= 0 {
            return Err(EngineError::NonPositiveDuration {
                end: reading.end,
                seconds: reading.duration_seconds(),
            });
        }
        if reading.end <= self.period.start() || reading.start >= self.period.end() {
            return Err(EngineError::OutOfPeriod {
                start: reading.start,
                end: reading.end,
                period_start: self.period.start(),
                period_end: self.period.end(),
            });
        }

        if reading.start < self.period.start() {
            let overshoot = (self.period.start() - reading.start).num_seconds();
            if overshoot > config.period_overlap_limit_seconds {
                return Err(EngineError::BoundaryOvershoot {
                    overshoot_seconds: overshoot,
                    limit_seconds: config.period_overlap_limit_seconds,
                });
            }
            let (outside, inside) = reading.split_at(self.period.start())?;
            self.handle_trimmed(outside);
            reading = inside;
        }

        if reading.end > self.period.end() {
            let overshoot = (reading.end - self.period.end()).num_seconds();
            if overshoot > config.period_overlap_limit_seconds {
                return Err(EngineError::BoundaryOvershoot {
                    overshoot_seconds: overshoot,
                    limit_seconds: config.period_overlap_limit_seconds,
                });
            }
            let (inside, outside) = reading.split_at(self.period.end())?;
            self.handle_trimmed(outside);
            reading = inside;
        }

        self.lock().readings.add_reading(reading, mode)
    }

    fn handle_trimmed(&self, remainder: Reading) {
        warn!(
            "trimmed reading remainder {}..{} at period boundary for {}",
            remainder.start, remainder.end, self.feature
        );
        if self.params.enforce_interval {
            if let Err(e) = self.persist_with_fallback(&remainder) {
                error!("failed to persist trimmed remainder for {}: {e}", self.feature);
            }
        }
    }

    /// Normalise everything strictly before `active_interval`: align to
    /// the interval grid, merge each closed interval to one reading,
    /// derive deltas from running counters where the device reports
    /// totals, apply calibration, and fill small gaps. The active
    /// interval is still accumulating and is never touched.
    pub fn normalise(
        &self,
        active_interval: u32,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        self.normalise_locked(&mut state, active_interval, config)
    }

    fn normalise_locked(
        &self,
        state: &mut PeriodState,
        active_interval: u32,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        state.readings.align_intervals()?;
        let active_start = self.period.interval_start(active_interval);
        state.readings.consolidate_intervals(active_start)?;
        if self.params.derive_from_totals {
            derive_deltas_from_counters(&mut state.readings);
        }
        self.apply_calibration(&mut state.readings);
        if active_start > self.period.start() {
            state.readings.fill_small_gaps(
                self.period.start(),
                active_start,
                false,
                config.gap_ignore_seconds,
                config.small_gap_limit_seconds,
            )?;
        }
        Ok(())
    }

    fn apply_calibration(&self, readings: &mut ReadingsCollection) {
        let Some(factor) = self.params.calibration_factor else {
            return;
        };
        for r in readings.iter_mut() {
            if r.is_history {
                continue;
            }
            let calibration = round_dp(r.energy_delta * (factor - 1.0), ENERGY_DECIMALS);
            if r.calibration_delta != Some(calibration) {
                r.calibration_delta = Some(calibration);
                r.update_pending = true;
            }
        }
    }

    /// Normalise, then persist every pending reading except the one in
    /// the still-open interval containing `active_reading_time` (it
    /// will be rewritten when the interval closes).
    ///
    /// A failed write falls back once between insert and update, which
    /// absorbs a stale `in_database` flag; a second failure leaves the
    /// reading pending for the next cycle.
    pub fn update_database(
        &self,
        active_reading_time: DateTime<Utc>,
        config: &EngineConfig,
    ) -> Result<SyncOutcome, EngineError> {
        let mut state = self.lock();
        let (active_interval, _) = self.period.interval_of(active_reading_time, false);
        self.normalise_locked(&mut state, active_interval, config)?;
        let active_start = self.period.interval_start(active_interval);

        let mut outcome = SyncOutcome::default();

        let mut failed_deletes = Vec::new();
        for purge in state.readings.take_purged() {
            match self.store.delete(&self.feature, purge.end) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    error!("failed to delete stale row for {}: {e}", self.feature);
                    failed_deletes.push(purge);
                }
            }
        }
        state.readings.requeue_purged(failed_deletes);

        for r in state.readings.iter_mut() {
            if !r.update_pending || r.end > active_start {
                continue;
            }
            match persist_record(self.store.as_ref(), self.feature, r) {
                Ok(()) => {
                    r.in_database = true;
                    r.update_pending = false;
                    outcome.finalised.push(r.end);
                }
                Err(e) => {
                    error!("failed to persist reading for {}: {e}", self.feature);
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn persist_with_fallback(&self, reading: &Reading) -> Result<(), EngineError> {
        persist_record(self.store.as_ref(), self.feature, reading)
    }

    /// Reconcile the sub-range `[history.end - window, history.end]`
    /// against an authoritative low-resolution total.
    ///
    /// The pipeline runs atomically under the collection lock: clear
    /// prior history adjustments, re-derive deltas, fill every gap
    /// (small ones by proration, large ones with manufactured
    /// history-derived readings), then force the range total onto the
    /// authoritative value: evenly by duration over the manufactured
    /// readings, residually prorated by delta over every reading in the
    /// range. Any failure restores the pre-pipeline state.
    pub fn adjust_from_history(
        &self,
        history: &Reading,
        history_window_seconds: i64,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        if history.duration_seconds() != history_window_seconds {
            return Err(EngineError::HistoryDurationMismatch {
                history_seconds: history.duration_seconds(),
                actual_seconds: history_window_seconds,
            });
        }
        let range_end = history.end;
        let range_start = range_end - Duration::seconds(history_window_seconds);
        let (_, start_aligned) = self.period.interval_of(range_start, false);
        let (_, end_aligned) = self.period.interval_of(range_end, true);
        if !start_aligned
            || !end_aligned
            || range_start < self.period.start()
            || range_end > self.period.end()
        {
            return Err(EngineError::HistoryMisaligned {
                range_start,
                range_end,
            });
        }

        let mut state = self.lock();
        let snapshot = state.readings.clone();
        let result =
            self.adjust_from_history_locked(&mut state, history, range_start, range_end, config);
        if result.is_err() {
            state.readings = snapshot;
        }
        result
    }

    fn adjust_from_history_locked(
        &self,
        state: &mut PeriodState,
        history: &Reading,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        state.readings.align_intervals()?;
        for r in state.readings.iter() {
            let straddles_start = r.start < range_start && r.end > range_start;
            let straddles_end = r.start < range_end && r.end > range_end;
            if straddles_start || straddles_end {
                return Err(EngineError::HistoryMisaligned {
                    range_start,
                    range_end,
                });
            }
        }

        // Step 1: previous reconciliations of this range are void.
        for r in in_range_mut(&mut state.readings, range_start, range_end) {
            if r.history_delta.is_some() {
                r.history_delta = None;
                r.update_pending = true;
            }
        }

        // Step 2: deltas and calibration may shift once counters moved.
        if self.params.derive_from_totals {
            derive_deltas_from_counters(&mut state.readings);
        }
        self.apply_calibration(&mut state.readings);

        // Step 3: the authoritative total demands full coverage, so the
        // trailing gap is filled here, unlike routine normalisation.
        state.readings.fill_small_gaps(
            range_start,
            range_end,
            true,
            config.gap_ignore_seconds,
            config.small_gap_limit_seconds,
        )?;

        // Steps 4-5: manufacture history-derived readings over whatever
        // gaps remain, then spread the variance over them evenly.
        let gaps: Vec<(DateTime<Utc>, DateTime<Utc>)> = state
            .readings
            .uncovered_ranges(range_start, range_end)
            .into_iter()
            .filter(|(s, e)| (*e - *s).num_seconds() > config.gap_ignore_seconds)
            .collect();

        for (gap_start, gap_end) in &gaps {
            let seconds = (*gap_end - *gap_start).num_seconds();
            let pattern = nearest_pattern(&state.readings, *gap_start, range_start, range_end);
            let mut synthetic = match pattern {
                Some(p) => {
                    let mut s = p.clone_to(*gap_end, seconds);
                    s.energy_today = None;
                    s.energy_total = None;
                    s
                }
                None => Reading::zero(*gap_start, *gap_end),
            };
            synthetic.is_history = true;
            synthetic.in_database = false;
            synthetic.update_pending = true;
            state.readings.add_reading(synthetic, AddMode::Insert)?;
        }

        let Some(total) = range_total(&state.readings, range_start, range_end) else {
            return Ok(());
        };

        let total = if gaps.is_empty() {
            total
        } else {
            for r in in_range_mut(&mut state.readings, range_start, range_end) {
                if gaps.iter().any(|(s, e)| r.start == *s && r.end == *e) {
                    r.history_adjust_average(&total, history)?;
                }
            }
            match range_total(&state.readings, range_start, range_end) {
                Some(t) => t,
                None => return Ok(()),
            }
        };

        // Step 6: whatever variance is left lands proportionally on
        // every reading in the range, manufactured ones included.
        if total.compare_value(history, ENERGY_DECIMALS - 2) != Ordering::Equal {
            for r in in_range_mut(&mut state.readings, range_start, range_end) {
                r.history_adjust_prorata(&total, history);
            }
        }
        Ok(())
    }

    /// Merge one consolidation-source reading into this period's bucket
    /// for the source reading's sub-interval, creating the bucket on
    /// first touch.
    pub fn merge_source_reading(
        &self,
        source: &Reading,
        operation_factor: f64,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        let mut contribution = source.clone();
        contribution.is_history = false;
        contribution.is_consolidation = true;
        contribution.in_database = false;

        let (interval, _) = self.period.interval_of(contribution.end, true);
        let existing = state
            .readings
            .iter()
            .position(|r| r.is_consolidation && self.period.interval_of(r.end, true).0 == interval);
        match existing {
            Some(index) => state
                .readings
                .accumulate_at(index, &contribution, operation_factor),
            None => {
                let mut bucket = Reading::zero(contribution.start, contribution.end);
                bucket.accumulate(&contribution, operation_factor);
                bucket.update_pending = true;
                state.readings.add_reading(bucket, AddMode::Insert)
            }
        }
    }

    /// Drop all aggregated readings ahead of a full rebuild from the
    /// sources, queueing deletes for any stored rows.
    pub fn clear_for_rebuild(&self) {
        self.lock().readings.clear();
    }
}

/// Mutable iterator over the readings inside `[range_start, range_end]`.
fn in_range_mut<'a>(
    readings: &'a mut ReadingsCollection,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> impl Iterator<Item = &'a mut Reading> {
    readings
        .iter_mut()
        .filter(move |r| r.end > range_start && r.start < range_end)
}

/// Merge every reading in the range into one scratch total whose
/// duration is the covered seconds (not the span), so the duration
/// equality check in the average adjustment catches missing coverage.
fn range_total(
    readings: &ReadingsCollection,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> Option<Reading> {
    let mut covered = 0i64;
    let mut total: Option<Reading> = None;
    for r in readings
        .iter()
        .filter(|r| r.end > range_start && r.start < range_end)
    {
        covered += r.duration_seconds();
        match &mut total {
            None => total = Some(r.clone()),
            Some(t) => t.accumulate(r, 1.0),
        }
    }
    total.map(|mut t| {
        t.start = t.end - Duration::seconds(covered);
        t
    })
}

/// Closest reading to prorate a manufactured gap reading from: the last
/// one ending at or before the gap, else the first one after it.
fn nearest_pattern(
    readings: &ReadingsCollection,
    gap_start: DateTime<Utc>,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> Option<Reading> {
    let in_range: Vec<&Reading> = readings
        .iter()
        .filter(|r| r.end > range_start && r.start < range_end)
        .collect();
    in_range
        .iter()
        .rev()
        .find(|r| r.end <= gap_start)
        .or_else(|| in_range.first())
        .map(|r| (*r).clone())
}

/// Walk oldest→newest deriving per-reading deltas from the running
/// counters a totals-reporting device supplies. A day counter that went
/// backwards rolled over midnight; the lifetime counter bridges it, and
/// failing that the fresh day counter is itself the delta since reset.
fn derive_deltas_from_counters(readings: &mut ReadingsCollection) {
    let mut prev_today: Option<f64> = None;
    let mut prev_total: Option<f64> = None;
    for r in readings.iter_mut() {
        if r.is_history {
            continue;
        }
        let derived = match (r.energy_today, prev_today) {
            (Some(today), Some(previous)) if today >= previous => Some(today - previous),
            (Some(today), Some(_)) => match (r.energy_total, prev_total) {
                (Some(total), Some(previous_total)) if total >= previous_total => {
                    Some(total - previous_total)
                }
                _ => Some(today),
            },
            _ => None,
        };
        if let Some(delta) = derived {
            let delta = round_dp(delta, ENERGY_DECIMALS);
            if r.energy_delta != delta {
                r.energy_delta = delta;
                r.update_pending = true;
            }
        }
        if r.energy_today.is_some() {
            prev_today = r.energy_today;
        }
        if r.energy_total.is_some() {
            prev_total = r.energy_total;
        }
    }
}

fn persist_record(
    store: &dyn ReadingStore,
    feature: DeviceFeature,
    reading: &Reading,
) -> Result<(), EngineError> {
    let record = ReadingRecord::from_reading(feature, reading);
    let first = if reading.in_database {
        store.update(&record)
    } else {
        store.insert(&record)
    };
    if let Err(first_error) = first {
        warn!(
            "persist fallback for {feature}@{}: {first_error}",
            reading.end
        );
        let second = if reading.in_database {
            store.insert(&record)
        } else {
            store.update(&record)
        };
        second?;
    }
    Ok(())
}
