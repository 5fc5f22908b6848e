//! Ordered, invariant-checked reading storage for one period
//!
//! The collection owns every reading of one device-feature period and
//! guards the temporal invariants:
//!
//! 1. every reading lies inside the period,
//! 2. no two readings overlap,
//! 3. no reading has a non-positive duration.
//!
//! Every structural mutation runs against a snapshot: if the mutated
//! collection fails the integrity check the prior state is restored and
//! the error propagated, so corrupt state is never observable. Readings
//! removed while their row exists in the store are retained on a purge
//! list until the owning period's next database sync issues the deletes.

use crate::error::EngineError;
use crate::period::Period;
use crate::reading::Reading;
use chrono::{DateTime, Utc};
use std::ops::Range;

/// How `add_reading` treats overlap with existing readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Reject any overlap. Live sources produce strictly advancing
    /// readings, so overlap here is an upstream defect.
    Insert,
    /// Replace whatever the new reading's span covers, splitting
    /// partially-overlapped readings at the new boundaries and keeping
    /// the trimmed leftovers. Re-adding an identical reading is a no-op.
    InsertReplace,
    /// Insert only the uncovered sub-ranges of the new reading, leaving
    /// existing readings untouched. Used to merge lower-priority
    /// gap-fill data under higher-priority actuals.
    FillGaps,
}

/// Readings of one device-feature period, ordered by `reading_end`.
#[derive(Debug, Clone)]
pub struct ReadingsCollection {
    period: Period,
    readings: Vec<Reading>,
    purged: Vec<Reading>,
}

impl ReadingsCollection {
    pub fn new(period: Period) -> Self {
        ReadingsCollection {
            period,
            readings: Vec::new(),
            purged: Vec::new(),
        }
    }

    pub fn period(&self) -> &Period {
        &self.period
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Reading> {
        self.readings.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Reading> {
        self.readings.iter_mut()
    }

    /// Whether any reading carries unsynced changes or deletes.
    pub fn has_pending_work(&self) -> bool {
        !self.purged.is_empty() || self.readings.iter().any(|r| r.update_pending)
    }

    /// Readings removed while present in the store, handed over for
    /// deletion. Draining transfers responsibility to the caller.
    pub fn take_purged(&mut self) -> Vec<Reading> {
        std::mem::take(&mut self.purged)
    }

    /// Remove the reading at `index`, recording a pending delete when a
    /// row for it exists in the store.
    pub fn remove_reading_at(&mut self, index: usize) -> Reading {
        let removed = self.readings.remove(index);
        if removed.in_database {
            self.purged.push(removed.clone());
        }
        removed
    }

    /// Drop all readings, recording pending deletes for stored rows.
    pub fn clear(&mut self) {
        for r in self.readings.drain(..) {
            if r.in_database {
                self.purged.push(r);
            }
        }
    }

    /// Insert a reading under the given overlap policy.
    pub fn add_reading(&mut self, reading: Reading, mode: AddMode) -> Result<(), EngineError> {
        self.check_fits_period(&reading)?;
        match mode {
            AddMode::Insert => {
                let overlapping = self.overlapping_indices(reading.start, reading.end);
                if !overlapping.is_empty() {
                    let existing = &self.readings[overlapping.start];
                    return Err(EngineError::Overlap {
                        new_start: reading.start,
                        new_end: reading.end,
                        existing_start: existing.start,
                        existing_end: existing.end,
                    });
                }
                self.guarded(|c| {
                    c.insert_sorted(reading);
                    Ok(())
                })
            }
            AddMode::InsertReplace => self.insert_replace(reading),
            AddMode::FillGaps => self.guarded(|c| {
                let gaps = c.uncovered_ranges(reading.start, reading.end);
                for (gap_start, gap_end) in gaps {
                    let piece =
                        reading.clone_to(gap_end, (gap_end - gap_start).num_seconds());
                    c.insert_sorted(piece);
                }
                Ok(())
            }),
        }
    }

    fn insert_replace(&mut self, mut reading: Reading) -> Result<(), EngineError> {
        let overlapping = self.overlapping_indices(reading.start, reading.end);

        // Exact re-delivery of an unchanged reading is a no-op so that
        // repeated persistence cycles stay idempotent.
        if overlapping.len() == 1 {
            let existing = &self.readings[overlapping.start];
            if existing.same_span(&reading) {
                if existing.values_equal(&reading) {
                    return Ok(());
                }
                reading.in_database = existing.in_database;
                reading.update_pending = true;
                let index = overlapping.start;
                return self.guarded(move |c| {
                    c.readings[index] = reading;
                    Ok(())
                });
            }
        }

        self.guarded(move |c| {
            let mut leftovers: Vec<Reading> = Vec::new();
            for index in overlapping.rev() {
                let old = c.readings.remove(index);
                c.carve_out(old, &reading, &mut leftovers)?;
            }
            for piece in leftovers {
                c.insert_sorted(piece);
            }
            reading.update_pending = true;
            c.insert_sorted(reading);
            Ok(())
        })
    }

    /// Split `old` around the replacement's span: the covered middle is
    /// discarded (its stored row queued for delete), the trimmed
    /// leftovers are kept and persisted.
    fn carve_out(
        &mut self,
        old: Reading,
        replacement: &Reading,
        leftovers: &mut Vec<Reading>,
    ) -> Result<(), EngineError> {
        if old.start < replacement.start {
            let (left, rest) = old.split_at(replacement.start)?;
            leftovers.push(left);
            if rest.end > replacement.end {
                let (covered, right) = rest.split_at(replacement.end)?;
                self.discard(covered);
                leftovers.push(right);
            } else {
                self.discard(rest);
            }
        } else if old.end > replacement.end {
            let (covered, right) = old.split_at(replacement.end)?;
            self.discard(covered);
            leftovers.push(right);
        } else {
            self.discard(old);
        }
        Ok(())
    }

    fn discard(&mut self, reading: Reading) {
        if reading.in_database {
            self.purged.push(reading);
        }
    }

    /// Split every reading spanning more than one sub-interval at each
    /// interval boundary. History-derived readings are exempt and keep
    /// their multi-interval span.
    pub fn align_intervals(&mut self) -> Result<(), EngineError> {
        self.guarded(|c| {
            let mut aligned = Vec::with_capacity(c.readings.len());
            for reading in c.readings.drain(..) {
                if reading.is_history {
                    aligned.push(reading);
                    continue;
                }
                let mut rest = reading;
                loop {
                    let (interval, _) = c.period.interval_of(rest.start, false);
                    let boundary = c.period.interval_end(interval);
                    if boundary >= rest.end {
                        aligned.push(rest);
                        break;
                    }
                    let (head, tail) = rest.split_at(boundary)?;
                    aligned.push(head);
                    rest = tail;
                }
            }
            c.readings = aligned;
            Ok(())
        })
    }

    /// Merge all readings sharing a sub-interval into one, for every
    /// interval ending at or before `up_to`.
    ///
    /// An interval already reduced to a single end-aligned reading is
    /// left alone, as is any interval holding a history-derived reading
    /// (merging would erase the history signature that future
    /// re-adjustment keys on).
    pub fn consolidate_intervals(&mut self, up_to: DateTime<Utc>) -> Result<(), EngineError> {
        self.guarded(|c| {
            let mut result: Vec<Reading> = Vec::with_capacity(c.readings.len());
            let readings = std::mem::take(&mut c.readings);
            let mut i = 0;
            while i < readings.len() {
                let (interval, _) = c.period.interval_of(readings[i].end, true);
                let interval_end = c.period.interval_end(interval);

                let mut j = i + 1;
                while j < readings.len()
                    && c.period.interval_of(readings[j].end, true).0 == interval
                {
                    j += 1;
                }
                let group = &readings[i..j];

                let skip = interval_end > up_to
                    || group.iter().any(|r| r.is_history)
                    || (group.len() == 1 && group[0].end == interval_end);
                if skip {
                    result.extend_from_slice(group);
                } else {
                    let mut merged = group[0].clone();
                    for r in &group[1..] {
                        merged.accumulate(r, 1.0);
                    }
                    for r in &group[..group.len() - 1] {
                        if r.in_database {
                            c.purged.push(r.clone());
                        }
                    }
                    merged.in_database =
                        group[group.len() - 1].in_database && merged.end == group[group.len() - 1].end;
                    merged.update_pending = true;
                    result.push(merged);
                }
                i = j;
            }
            c.readings = result;
            Ok(())
        })
    }

    /// Fill small measurement gaps in `[range_start, range_end)` by
    /// prorating from a neighbouring reading, conserving totals by
    /// borrowing the synthetic delta from the pattern.
    ///
    /// Inner and trailing gaps borrow from the earlier neighbour; a
    /// leading gap borrows from the later one. Gaps at or below
    /// `ignore_seconds` sit under the drivers' own timestamp grain and
    /// are ignored. The trailing gap is only touched when
    /// `fill_end_gap` is set (history reconciliation demands full
    /// coverage; routine normalisation must not invent the future).
    ///
    /// Returns the summed seconds of gaps too large to fill; those wait
    /// for history reconciliation.
    pub fn fill_small_gaps(
        &mut self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        fill_end_gap: bool,
        ignore_seconds: i64,
        limit_seconds: i64,
    ) -> Result<i64, EngineError> {
        let in_range: Vec<usize> = (0..self.readings.len())
            .filter(|&i| {
                self.readings[i].end > range_start && self.readings[i].start < range_end
            })
            .collect();

        if in_range.is_empty() {
            // Nothing to prorate from; the whole range is one large gap.
            return Ok((range_end - range_start).num_seconds());
        }

        let mut remaining = 0i64;
        self.guarded(|c| {
            let mut synthetics: Vec<Reading> = Vec::new();

            let first = in_range[0];
            let lead = (c.readings[first].start - range_start).num_seconds();
            if lead > limit_seconds {
                remaining += lead;
            } else if lead > ignore_seconds {
                let gap_end = c.readings[first].start;
                synthetics.push(c.readings[first].fill_small_gap(gap_end, lead, true));
            }

            for pair in in_range.windows(2) {
                let gap_end = c.readings[pair[1]].start;
                let gap = (gap_end - c.readings[pair[0]].end).num_seconds();
                if gap > limit_seconds {
                    remaining += gap;
                } else if gap > ignore_seconds {
                    synthetics.push(c.readings[pair[0]].fill_small_gap(gap_end, gap, true));
                }
            }

            if fill_end_gap {
                let last = in_range[in_range.len() - 1];
                let gap = (range_end - c.readings[last].end).num_seconds();
                if gap > limit_seconds {
                    remaining += gap;
                } else if gap > ignore_seconds {
                    synthetics.push(c.readings[last].fill_small_gap(range_end, gap, true));
                }
            }

            for synthetic in synthetics {
                c.insert_sorted(synthetic);
            }
            Ok(())
        })?;
        Ok(remaining)
    }

    /// Merge `other` into the reading at `index` in place, keeping the
    /// collection ordered and invariant-checked. Used by consolidation
    /// aggregation, where the bucket reading grows as sources arrive.
    pub fn accumulate_at(
        &mut self,
        index: usize,
        other: &Reading,
        operation_factor: f64,
    ) -> Result<(), EngineError> {
        self.guarded(|c| {
            c.readings[index].accumulate(other, operation_factor);
            c.readings.sort_by_key(|r| r.end);
            Ok(())
        })
    }

    /// Put back pending deletes whose store round-trip failed; they are
    /// retried on the next sync.
    pub fn requeue_purged(&mut self, readings: Vec<Reading>) {
        self.purged.extend(readings);
    }

    /// Sub-ranges of `[range_start, range_end)` not covered by any
    /// reading.
    pub fn uncovered_ranges(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let mut gaps = Vec::new();
        let mut cursor = range_start;
        for r in &self.readings {
            if r.end <= range_start || r.start >= range_end {
                continue;
            }
            if r.start > cursor {
                gaps.push((cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < range_end {
            gaps.push((cursor, range_end));
        }
        gaps
    }

    /// Indices of readings overlapping `[start, end)`. Contiguous
    /// because the collection is ordered and overlap-free.
    fn overlapping_indices(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Range<usize> {
        let first = self.readings.partition_point(|r| r.end <= start);
        let mut last = first;
        while last < self.readings.len() && self.readings[last].start < end {
            last += 1;
        }
        first..last
    }

    fn insert_sorted(&mut self, reading: Reading) {
        let at = self.readings.partition_point(|r| r.end <= reading.end);
        self.readings.insert(at, reading);
    }

    fn check_fits_period(&self, reading: &Reading) -> Result<(), EngineError> {
        if reading.duration_seconds() <= 0 {
            return Err(EngineError::NonPositiveDuration {
                end: reading.end,
                seconds: reading.duration_seconds(),
            });
        }
        if reading.start < self.period.start() || reading.end > self.period.end() {
            return Err(EngineError::OutOfPeriod {
                start: reading.start,
                end: reading.end,
                period_start: self.period.start(),
                period_end: self.period.end(),
            });
        }
        Ok(())
    }

    /// Full-collection invariant check; run after every structural
    /// mutation.
    pub fn check_integrity(&self) -> Result<(), EngineError> {
        for r in &self.readings {
            self.check_fits_period(r)?;
        }
        for w in self.readings.windows(2) {
            if w[1].start < w[0].end || w[1].end < w[0].end {
                return Err(EngineError::Overlap {
                    new_start: w[1].start,
                    new_end: w[1].end,
                    existing_start: w[0].start,
                    existing_end: w[0].end,
                });
            }
        }
        Ok(())
    }

    /// Run a structural mutation against a snapshot: on any error,
    /// including a failed integrity check, the prior state is restored
    /// before the error propagates.
    fn guarded<F>(&mut self, mutate: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Self) -> Result<(), EngineError>,
    {
        let readings_snapshot = self.readings.clone();
        let purged_snapshot = self.purged.clone();
        let result = mutate(self).and_then(|_| self.check_integrity());
        if result.is_err() {
            self.readings = readings_snapshot;
            self.purged = purged_snapshot;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodType;
    use crate::reading::round_dp;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn day_period(interval_seconds: u32) -> Period {
        Period::containing(
            PeriodType::Day,
            interval_seconds,
            0,
            ts("2024-03-15T12:00:00Z"),
            false,
        )
    }

    fn reading(start: &str, end: &str, delta: f64) -> Reading {
        Reading::new(ts(start), ts(end), delta)
    }

    #[test]
    fn test_insert_rejects_overlap() {
        let mut collection = ReadingsCollection::new(day_period(300));
        collection
            .add_reading(
                reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0),
                AddMode::Insert,
            )
            .unwrap();

        let overlapping = reading("2024-03-15T00:04:00Z", "2024-03-15T00:06:00Z", 0.5);
        let err = collection.add_reading(overlapping, AddMode::Insert);
        assert!(matches!(err, Err(EngineError::Overlap { .. })));
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_insert_rejects_out_of_period() {
        let mut collection = ReadingsCollection::new(day_period(300));
        let outside = reading("2024-03-14T23:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        assert!(matches!(
            collection.add_reading(outside, AddMode::Insert),
            Err(EngineError::OutOfPeriod { .. })
        ));
    }

    #[test]
    fn test_insert_replace_is_idempotent() {
        let mut collection = ReadingsCollection::new(day_period(300));
        let mut r = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        r.in_database = true;
        r.update_pending = false;

        collection.add_reading(r.clone(), AddMode::InsertReplace).unwrap();
        collection.add_reading(r.clone(), AddMode::InsertReplace).unwrap();

        assert_eq!(collection.len(), 1);
        assert!(collection.readings()[0].in_database);
        assert!(!collection.readings()[0].update_pending);
        assert!(collection.take_purged().is_empty());
    }

    #[test]
    fn test_insert_replace_same_span_inherits_database_state() {
        let mut collection = ReadingsCollection::new(day_period(300));
        let mut stored = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        stored.in_database = true;
        stored.update_pending = false;
        collection.add_reading(stored, AddMode::Insert).unwrap();

        let changed = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.2);
        collection.add_reading(changed, AddMode::InsertReplace).unwrap();

        assert_eq!(collection.len(), 1);
        let kept = &collection.readings()[0];
        assert_eq!(kept.energy_delta, 1.2);
        assert!(kept.in_database);
        assert!(kept.update_pending);
        // Replaced in place, not deleted
        assert!(collection.take_purged().is_empty());
    }

    #[test]
    fn test_insert_replace_splits_partial_overlap() {
        let mut collection = ReadingsCollection::new(day_period(300));
        collection
            .add_reading(
                reading("2024-03-15T00:00:00Z", "2024-03-15T00:10:00Z", 2.0),
                AddMode::Insert,
            )
            .unwrap();

        let replacement = reading("2024-03-15T00:03:00Z", "2024-03-15T00:07:00Z", 5.0);
        collection
            .add_reading(replacement, AddMode::InsertReplace)
            .unwrap();

        assert_eq!(collection.len(), 3);
        let spans: Vec<(DateTime<Utc>, DateTime<Utc>)> =
            collection.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(
            spans,
            vec![
                (ts("2024-03-15T00:00:00Z"), ts("2024-03-15T00:03:00Z")),
                (ts("2024-03-15T00:03:00Z"), ts("2024-03-15T00:07:00Z")),
                (ts("2024-03-15T00:07:00Z"), ts("2024-03-15T00:10:00Z")),
            ]
        );
        // Leftovers keep their prorated share of the original 2.0
        let leftover_sum: f64 = collection.readings()[0].energy_delta
            + collection.readings()[2].energy_delta;
        assert_eq!(round_dp(leftover_sum, 5), 1.2);
        assert_eq!(collection.readings()[1].energy_delta, 5.0);
        assert!(collection.check_integrity().is_ok());
    }

    #[test]
    fn test_fill_gaps_mode_inserts_only_uncovered() {
        let mut collection = ReadingsCollection::new(day_period(300));
        collection
            .add_reading(
                reading("2024-03-15T00:02:00Z", "2024-03-15T00:04:00Z", 9.0),
                AddMode::Insert,
            )
            .unwrap();

        // Template spans 00:00..00:06; only 00:00..00:02 and 00:04..00:06
        // are uncovered
        let template = reading("2024-03-15T00:00:00Z", "2024-03-15T00:06:00Z", 3.0);
        collection.add_reading(template, AddMode::FillGaps).unwrap();

        assert_eq!(collection.len(), 3);
        // The higher-priority actual reading is untouched
        assert_eq!(collection.readings()[1].energy_delta, 9.0);
        // Each inserted piece is prorated from the template (2min of 6min)
        assert_eq!(collection.readings()[0].energy_delta, 1.0);
        assert_eq!(collection.readings()[2].energy_delta, 1.0);
    }

    #[test]
    fn test_align_intervals_splits_at_boundaries() {
        let mut collection = ReadingsCollection::new(day_period(300));
        collection
            .add_reading(
                reading("2024-03-15T00:03:00Z", "2024-03-15T00:12:00Z", 0.9),
                AddMode::Insert,
            )
            .unwrap();

        collection.align_intervals().unwrap();

        assert_eq!(collection.len(), 3);
        for r in collection.iter() {
            let (start_interval, _) = collection.period().interval_of(r.start, false);
            let (end_interval, _) = collection.period().interval_of(r.end, true);
            assert_eq!(start_interval, end_interval);
        }
        let total: f64 = collection.iter().map(|r| r.energy_delta).sum();
        assert_eq!(round_dp(total, 5), 0.9);
    }

    #[test]
    fn test_align_intervals_leaves_history_readings() {
        let mut collection = ReadingsCollection::new(day_period(300));
        let mut history = reading("2024-03-15T00:00:00Z", "2024-03-15T01:00:00Z", 4.0);
        history.is_history = true;
        collection.add_reading(history, AddMode::Insert).unwrap();

        collection.align_intervals().unwrap();
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.readings()[0].duration_seconds(), 3600);
    }

    #[test]
    fn test_consolidate_merges_interval_groups() {
        let mut collection = ReadingsCollection::new(day_period(300));
        for (start, end, delta) in [
            ("2024-03-15T00:00:00Z", "2024-03-15T00:02:00Z", 0.4),
            ("2024-03-15T00:02:00Z", "2024-03-15T00:05:00Z", 0.6),
            ("2024-03-15T00:05:00Z", "2024-03-15T00:10:00Z", 1.5),
        ] {
            collection
                .add_reading(reading(start, end, delta), AddMode::Insert)
                .unwrap();
        }

        collection
            .consolidate_intervals(ts("2024-03-15T00:10:00Z"))
            .unwrap();

        assert_eq!(collection.len(), 2);
        assert_eq!(collection.readings()[0].energy_delta, 1.0);
        assert_eq!(collection.readings()[0].end, ts("2024-03-15T00:05:00Z"));
        // Already a single aligned reading: untouched
        assert_eq!(collection.readings()[1].energy_delta, 1.5);
    }

    #[test]
    fn test_consolidate_skips_active_and_history_intervals() {
        let mut collection = ReadingsCollection::new(day_period(300));
        let mut history = reading("2024-03-15T00:00:00Z", "2024-03-15T00:02:00Z", 0.4);
        history.is_history = true;
        collection.add_reading(history, AddMode::Insert).unwrap();
        collection
            .add_reading(
                reading("2024-03-15T00:02:00Z", "2024-03-15T00:05:00Z", 0.6),
                AddMode::Insert,
            )
            .unwrap();
        collection
            .add_reading(
                reading("2024-03-15T00:05:00Z", "2024-03-15T00:07:00Z", 0.2),
                AddMode::Insert,
            )
            .unwrap();

        // Interval 0 holds a history reading; interval 1 is past `up_to`
        collection
            .consolidate_intervals(ts("2024-03-15T00:05:00Z"))
            .unwrap();

        assert_eq!(collection.len(), 3);
    }

    #[test]
    fn test_fill_small_gaps_fills_and_reports() {
        let mut collection = ReadingsCollection::new(day_period(300));
        // 90s gap between first two; 200s gap after the third
        collection
            .add_reading(
                reading("2024-03-15T00:05:00Z", "2024-03-15T00:10:00Z", 1.0),
                AddMode::Insert,
            )
            .unwrap();
        collection
            .add_reading(
                reading("2024-03-15T00:11:30Z", "2024-03-15T00:15:00Z", 0.7),
                AddMode::Insert,
            )
            .unwrap();
        collection
            .add_reading(
                reading("2024-03-15T00:18:20Z", "2024-03-15T00:20:00Z", 0.5),
                AddMode::Insert,
            )
            .unwrap();

        let remaining = collection
            .fill_small_gaps(
                ts("2024-03-15T00:05:00Z"),
                ts("2024-03-15T00:20:00Z"),
                false,
                1,
                120,
            )
            .unwrap();

        assert_eq!(remaining, 200);
        assert_eq!(collection.len(), 4);
        // The synthetic reading covers the 90s gap, borrowed from the
        // earlier neighbour: totals conserved
        let total: f64 = collection.iter().map(|r| r.energy_delta).sum();
        assert_eq!(round_dp(total, 5), 2.2);
        assert!(collection
            .iter()
            .any(|r| r.start == ts("2024-03-15T00:10:00Z")
                && r.end == ts("2024-03-15T00:11:30Z")));
    }

    #[test]
    fn test_fill_small_gaps_leading_gap_borrows_from_next() {
        let mut collection = ReadingsCollection::new(day_period(300));
        collection
            .add_reading(
                reading("2024-03-15T00:01:00Z", "2024-03-15T00:05:00Z", 1.2),
                AddMode::Insert,
            )
            .unwrap();

        let remaining = collection
            .fill_small_gaps(
                ts("2024-03-15T00:00:00Z"),
                ts("2024-03-15T00:05:00Z"),
                false,
                1,
                120,
            )
            .unwrap();

        assert_eq!(remaining, 0);
        assert_eq!(collection.len(), 2);
        let total: f64 = collection.iter().map(|r| r.energy_delta).sum();
        assert_eq!(round_dp(total, 5), 1.2);
        assert_eq!(collection.readings()[0].start, ts("2024-03-15T00:00:00Z"));
    }

    #[test]
    fn test_fill_small_gaps_empty_range_reports_whole_range() {
        let mut collection = ReadingsCollection::new(day_period(300));
        let remaining = collection
            .fill_small_gaps(
                ts("2024-03-15T00:00:00Z"),
                ts("2024-03-15T00:30:00Z"),
                true,
                1,
                120,
            )
            .unwrap();
        assert_eq!(remaining, 1800);
    }

    #[test]
    fn test_purged_rows_are_reported_once() {
        let mut collection = ReadingsCollection::new(day_period(300));
        let mut stored = reading("2024-03-15T00:00:00Z", "2024-03-15T00:05:00Z", 1.0);
        stored.in_database = true;
        collection.add_reading(stored, AddMode::Insert).unwrap();

        collection.remove_reading_at(0);
        let purged = collection.take_purged();
        assert_eq!(purged.len(), 1);
        assert!(collection.take_purged().is_empty());
    }

    #[test]
    fn test_uncovered_ranges() {
        let mut collection = ReadingsCollection::new(day_period(300));
        collection
            .add_reading(
                reading("2024-03-15T00:02:00Z", "2024-03-15T00:04:00Z", 1.0),
                AddMode::Insert,
            )
            .unwrap();

        let gaps = collection
            .uncovered_ranges(ts("2024-03-15T00:00:00Z"), ts("2024-03-15T00:06:00Z"));
        assert_eq!(
            gaps,
            vec![
                (ts("2024-03-15T00:00:00Z"), ts("2024-03-15T00:02:00Z")),
                (ts("2024-03-15T00:04:00Z"), ts("2024-03-15T00:06:00Z")),
            ]
        );
    }
}
