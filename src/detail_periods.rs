//! The per-feature period container
//!
//! Owns every in-memory period of one device-feature series. Periods
//! are found by start timestamp and created lazily on first reference
//! (loading whatever the store already holds for their window). Raw
//! readings that straddle a period boundary (a reading crossing
//! midnight, typically) are split and routed piecewise. Periods whose
//! window has closed and that nothing has touched for the retention
//! window are flushed and dropped.

use crate::detail_period::DeviceDetailPeriod;
use crate::error::EngineError;
use crate::period::Period;
use crate::reading::Reading;
use crate::readings::AddMode;
use crate::store::ReadingStore;
use crate::types::{DeviceFeature, DeviceParams, EngineConfig, PeriodSpec};
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::{Arc, Mutex};

/// All periods of one device-feature series.
pub struct DeviceDetailPeriods {
    feature: DeviceFeature,
    spec: PeriodSpec,
    params: DeviceParams,
    store: Arc<dyn ReadingStore>,
    periods: Mutex<Vec<Arc<DeviceDetailPeriod>>>,
}

impl DeviceDetailPeriods {
    pub fn new(
        feature: DeviceFeature,
        spec: PeriodSpec,
        params: DeviceParams,
        store: Arc<dyn ReadingStore>,
    ) -> Self {
        DeviceDetailPeriods {
            feature,
            spec,
            params,
            store,
            periods: Mutex::new(Vec::new()),
        }
    }

    pub fn feature(&self) -> DeviceFeature {
        self.feature
    }

    pub fn spec(&self) -> PeriodSpec {
        self.spec
    }

    pub fn params(&self) -> DeviceParams {
        self.params
    }

    pub fn period_count(&self) -> usize {
        self.periods.lock().expect("periods lock poisoned").len()
    }

    /// Find the period containing `timestamp`, creating and loading it
    /// on first reference.
    pub fn find_or_create(
        &self,
        timestamp: DateTime<Utc>,
        is_end_time: bool,
        now: DateTime<Utc>,
    ) -> Result<Arc<DeviceDetailPeriod>, EngineError> {
        let period = Period::containing(
            self.spec.period_type,
            self.spec.interval_seconds,
            self.spec.offset_seconds,
            timestamp,
            is_end_time,
        );
        let mut periods = self.periods.lock().expect("periods lock poisoned");
        if let Some(existing) = periods.iter().find(|p| p.period().start() == period.start()) {
            existing.touch(now);
            return Ok(existing.clone());
        }

        let created = Arc::new(DeviceDetailPeriod::new(
            period,
            self.feature,
            self.params,
            self.store.clone(),
            now,
        ));
        created.load()?;
        periods.push(created.clone());
        debug!(
            "created period {} starting {} for {}",
            period.period_type().as_str(),
            period.start(),
            self.feature
        );
        Ok(created)
    }

    /// Currently loaded periods, in creation order.
    pub fn loaded_periods(&self) -> Vec<Arc<DeviceDetailPeriod>> {
        self.periods.lock().expect("periods lock poisoned").clone()
    }

    /// Periods whose windows overlap `[from, to)`, if loaded.
    pub fn periods_overlapping(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Arc<DeviceDetailPeriod>> {
        self.periods
            .lock()
            .expect("periods lock poisoned")
            .iter()
            .filter(|p| p.period().start() < to && p.period().end() > from)
            .cloned()
            .collect()
    }

    /// Route a raw reading into the period(s) its span intersects.
    ///
    /// Normally that is exactly one period, but a reading may straddle a
    /// period boundary; each boundary crossing splits the reading and
    /// routes the pieces separately, conserving the delta across them.
    pub fn add_raw_reading(
        &self,
        reading: Reading,
        mode: AddMode,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut rest = reading;
        loop {
            let period = self.find_or_create(rest.start, false, now)?;
            if rest.end <= period.period().end() {
                return period.add_reading(rest, mode, config);
            }
            let (inside, outside) = rest.split_at(period.period().end())?;
            period.add_reading(inside, mode, config)?;
            rest = outside;
        }
    }

    /// Flush and drop periods that have ended and gone untouched for
    /// the retention window. A period whose flush leaves pending work
    /// stays loaded and is retried next sweep.
    pub fn discard_old_periods(
        &self,
        now: DateTime<Utc>,
        config: &EngineConfig,
    ) -> Result<usize, EngineError> {
        let candidates: Vec<Arc<DeviceDetailPeriod>> = self
            .periods
            .lock()
            .expect("periods lock poisoned")
            .iter()
            .filter(|p| p.is_discardable(now, config.stale_retention_seconds))
            .cloned()
            .collect();

        let mut dropped = 0usize;
        for period in candidates {
            if period.has_pending_work() {
                // Everything in a finished period is final; flush it all.
                period.update_database(period.period().end(), config)?;
            }
            if !period.has_pending_work() {
                let mut periods = self.periods.lock().expect("periods lock poisoned");
                periods.retain(|p| p.period().start() != period.period().start());
                dropped += 1;
                debug!(
                    "discarded stale period starting {} for {}",
                    period.period().start(),
                    self.feature
                );
            }
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodType;
    use crate::reading::round_dp;
    use crate::store::MemoryStore;
    use crate::types::{DeviceId, FeatureId, FeatureKind};

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn feature() -> DeviceFeature {
        DeviceFeature::new(DeviceId::new(), FeatureId::new(FeatureKind::YieldAc, 0))
    }

    fn container() -> (DeviceDetailPeriods, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let periods = DeviceDetailPeriods::new(
            feature(),
            PeriodSpec::new(PeriodType::Day, 300, 0),
            DeviceParams::default(),
            store.clone(),
        );
        (periods, store)
    }

    #[test]
    fn test_find_or_create_reuses_periods() {
        let (container, _) = container();
        let now = ts("2024-03-15T08:00:00Z");

        let first = container
            .find_or_create(ts("2024-03-15T07:00:00Z"), false, now)
            .unwrap();
        let second = container
            .find_or_create(ts("2024-03-15T19:30:00Z"), false, now)
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(container.period_count(), 1);
    }

    #[test]
    fn test_midnight_straddle_is_split_and_routed() {
        let (container, _) = container();
        let config = EngineConfig::default();
        let now = ts("2024-03-15T00:01:00Z");

        // 23:58 to 00:02 crosses midnight: each day gets its share
        let straddling = Reading::new(
            ts("2024-03-14T23:58:00Z"),
            ts("2024-03-15T00:02:00Z"),
            1.0,
        );
        container
            .add_raw_reading(straddling, AddMode::Insert, &config, now)
            .unwrap();

        assert_eq!(container.period_count(), 2);
        let periods = container.loaded_periods();
        let first_day = periods[0].readings_snapshot();
        let second_day = periods[1].readings_snapshot();
        assert_eq!(first_day.len(), 1);
        assert_eq!(second_day.len(), 1);
        assert_eq!(first_day[0].end, ts("2024-03-15T00:00:00Z"));
        assert_eq!(second_day[0].start, ts("2024-03-15T00:00:00Z"));
        assert_eq!(
            round_dp(first_day[0].energy_delta + second_day[0].energy_delta, 5),
            1.0
        );
    }

    #[test]
    fn test_find_or_create_loads_stored_rows() {
        let (container, store) = container();
        let reading = Reading::new(
            ts("2024-03-15T00:00:00Z"),
            ts("2024-03-15T00:05:00Z"),
            1.0,
        );
        store
            .insert(&crate::store::ReadingRecord::from_reading(
                container.feature(),
                &reading,
            ))
            .unwrap();

        let period = container
            .find_or_create(ts("2024-03-15T12:00:00Z"), false, ts("2024-03-15T12:00:00Z"))
            .unwrap();
        let readings = period.readings_snapshot();
        assert_eq!(readings.len(), 1);
        assert!(readings[0].in_database);
    }

    #[test]
    fn test_discard_flushes_dirty_period_first() {
        let (container, store) = container();
        let config = EngineConfig::default();
        let created = ts("2024-03-15T06:00:00Z");

        let period = container
            .find_or_create(ts("2024-03-15T06:00:00Z"), false, created)
            .unwrap();
        period
            .add_reading(
                Reading::new(
                    ts("2024-03-15T06:00:00Z"),
                    ts("2024-03-15T06:05:00Z"),
                    1.0,
                ),
                AddMode::Insert,
                &config,
            )
            .unwrap();

        // Two days later, untouched: flushed to the store, then dropped
        let dropped = container
            .discard_old_periods(ts("2024-03-17T12:00:00Z"), &config)
            .unwrap();

        assert_eq!(dropped, 1);
        assert_eq!(container.period_count(), 0);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_recently_found_period_is_kept() {
        let (container, _) = container();
        let config = EngineConfig::default();
        let now = ts("2024-03-17T12:00:00Z");

        container
            .find_or_create(ts("2024-03-15T06:00:00Z"), false, now)
            .unwrap();
        let dropped = container.discard_old_periods(now, &config).unwrap();

        assert_eq!(dropped, 0);
        assert_eq!(container.period_count(), 1);
    }
}
