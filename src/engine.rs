//! Engine orchestration
//!
//! This module provides the public API of Sunledger. A
//! [`TelemetryEngine`] owns the per-feature period containers, the
//! persistence and notification handles, and the consolidation
//! registry; drivers push raw readings in, the scheduler asks for sync
//! cycles, and consolidation targets recompute lazily when referenced.
//!
//! The engine is synchronous throughout. Callers may invoke it from as
//! many worker threads as they like; each period serialises its own
//! mutations and the store serialises its writers.

use crate::consolidation::{ConsolidationLink, ConsolidationRegistry};
use crate::detail_period::SyncOutcome;
use crate::detail_periods::DeviceDetailPeriods;
use crate::error::EngineError;
use crate::notify::OutputNotifier;
use crate::reading::Reading;
use crate::readings::AddMode;
use crate::store::ReadingStore;
use crate::types::{DeviceFeature, DeviceParams, EngineConfig, PeriodSpec};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// How one feature's series is recorded and which device behaviour
/// applies to it.
#[derive(Debug, Clone, Copy)]
pub struct FeatureRegistration {
    pub spec: PeriodSpec,
    pub params: DeviceParams,
}

/// Stateful consolidation engine for a site's device-feature series.
pub struct TelemetryEngine {
    store: Arc<dyn ReadingStore>,
    notifier: Arc<dyn OutputNotifier>,
    config: EngineConfig,
    registry: ConsolidationRegistry,
    registrations: Mutex<HashMap<DeviceFeature, FeatureRegistration>>,
    features: Mutex<HashMap<DeviceFeature, Arc<DeviceDetailPeriods>>>,
}

impl TelemetryEngine {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        notifier: Arc<dyn OutputNotifier>,
        config: EngineConfig,
    ) -> Self {
        TelemetryEngine {
            store,
            notifier,
            config,
            registry: ConsolidationRegistry::default(),
            registrations: Mutex::new(HashMap::new()),
            features: Mutex::new(HashMap::new()),
        }
    }

    /// Engine with the site's consolidation links resolved at startup.
    pub fn with_links(
        store: Arc<dyn ReadingStore>,
        notifier: Arc<dyn OutputNotifier>,
        config: EngineConfig,
        links: Vec<ConsolidationLink>,
    ) -> Self {
        let mut engine = TelemetryEngine::new(store, notifier, config);
        engine.registry = ConsolidationRegistry::new(links);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Declare a feature's recording shape. Drivers do this once per
    /// resolved device-feature before delivering readings.
    pub fn register_feature(
        &self,
        feature: DeviceFeature,
        spec: PeriodSpec,
        params: DeviceParams,
    ) {
        self.registrations
            .lock()
            .expect("registrations lock poisoned")
            .insert(feature, FeatureRegistration { spec, params });
    }

    /// The period container of a registered feature, created on first
    /// reference.
    pub fn feature_periods(
        &self,
        feature: &DeviceFeature,
    ) -> Result<Arc<DeviceDetailPeriods>, EngineError> {
        let registration = {
            let registrations = self
                .registrations
                .lock()
                .expect("registrations lock poisoned");
            match registrations.get(feature) {
                Some(r) => *r,
                None => return Err(EngineError::UnknownFeature(feature.to_string())),
            }
        };
        let mut features = self.features.lock().expect("features lock poisoned");
        Ok(features
            .entry(*feature)
            .or_insert_with(|| {
                Arc::new(DeviceDetailPeriods::new(
                    *feature,
                    registration.spec,
                    registration.params,
                    self.store.clone(),
                ))
            })
            .clone())
    }

    /// Route one driver-produced reading into the right period(s).
    pub fn add_raw_reading(
        &self,
        feature: &DeviceFeature,
        reading: Reading,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.feature_periods(feature)?
            .add_raw_reading(reading, AddMode::Insert, &self.config, now)
    }

    /// Normalise and persist the period containing
    /// `active_reading_time`, notify downstream consumers of every
    /// newly finalised interval, and advance this feature's
    /// consolidation links.
    pub fn sync_feature(
        &self,
        feature: &DeviceFeature,
        active_reading_time: DateTime<Utc>,
    ) -> Result<SyncOutcome, EngineError> {
        let container = self.feature_periods(feature)?;
        let period = container.find_or_create(active_reading_time, false, active_reading_time)?;
        let outcome = period.update_database(active_reading_time, &self.config)?;

        for reading_end in &outcome.finalised {
            self.notifier.output_ready(feature, *reading_end);
        }
        if let Some(latest) = outcome.finalised.last() {
            for target in self.registry.notify_source_advanced(feature, *latest) {
                debug!("consolidation target {target} has pending source updates");
            }
        }
        Ok(outcome)
    }

    /// Recompute a consolidation target's period from its sources, but
    /// only if a source has advanced since the last rebuild. Safe to
    /// call redundantly.
    ///
    /// The period is rebuilt whole: cleared, then every source's
    /// finalised readings inside its window are accumulated into
    /// per-interval buckets under the link's operation.
    pub fn refresh_consolidation_target(
        &self,
        target: &DeviceFeature,
        window_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if !self.registry.has_updates_for(target) {
            return Ok(());
        }
        self.registry.take_updates_for(target);

        let container = self.feature_periods(target)?;
        let target_period = container.find_or_create(window_time, false, now)?;
        let window_start = target_period.period().start();
        let window_end = target_period.period().end();
        target_period.clear_for_rebuild();

        for (source, op) in self.registry.sources_of(target) {
            let Some(ready) = self.registry.ready_time(&source, target) else {
                // Source has never finalised anything; nothing to take.
                continue;
            };
            let source_container = self.feature_periods(&source)?;
            source_container.find_or_create(window_start, false, now)?;
            for source_period in source_container.periods_overlapping(window_start, window_end)
            {
                for reading in source_period.readings_snapshot() {
                    let inside =
                        reading.start >= window_start && reading.end <= window_end;
                    if inside && reading.end <= ready {
                        target_period.merge_source_reading(&reading, op.factor())?;
                    }
                }
            }
        }
        debug!("rebuilt consolidation target {target} window starting {window_start}");
        Ok(())
    }

    /// Reconcile a feature's readings against an authoritative
    /// low-resolution history record covering
    /// `[history.end - window, history.end]`.
    pub fn reconcile_history(
        &self,
        feature: &DeviceFeature,
        history: &Reading,
        history_window_seconds: i64,
    ) -> Result<(), EngineError> {
        let container = self.feature_periods(feature)?;
        let period = container.find_or_create(history.end, true, history.end)?;
        period.adjust_from_history(history, history_window_seconds, &self.config)
    }

    /// Flush and drop every stale period across all features.
    pub fn discard_stale(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let containers: Vec<Arc<DeviceDetailPeriods>> = self
            .features
            .lock()
            .expect("features lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut dropped = 0;
        for container in containers {
            dropped += container.discard_old_periods(now, &self.config)?;
        }
        Ok(dropped)
    }

    /// Serialised consolidation link state for a process restart.
    pub fn consolidation_state(&self) -> Result<String, serde_json::Error> {
        self.registry.to_json()
    }

    /// Restore consolidation link state saved by
    /// [`consolidation_state`](Self::consolidation_state).
    pub fn restore_consolidation_state(&self, json: &str) -> Result<(), serde_json::Error> {
        self.registry.restore(serde_json::from_str(json)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidation::ConsolidationOp;
    use crate::notify::NullNotifier;
    use crate::period::PeriodType;
    use crate::store::MemoryStore;
    use crate::types::{DeviceId, FeatureId, FeatureKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn feature(kind: FeatureKind) -> DeviceFeature {
        DeviceFeature::new(DeviceId::new(), FeatureId::new(kind, 0))
    }

    fn day_spec() -> PeriodSpec {
        PeriodSpec::new(PeriodType::Day, 300, 0)
    }

    #[derive(Default)]
    struct CountingNotifier {
        count: AtomicUsize,
    }

    impl OutputNotifier for CountingNotifier {
        fn output_ready(&self, _feature: &DeviceFeature, _reading_end: DateTime<Utc>) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_unregistered_feature_is_rejected() {
        let engine = TelemetryEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NullNotifier),
            EngineConfig::default(),
        );
        let unknown = feature(FeatureKind::YieldAc);
        assert!(matches!(
            engine.feature_periods(&unknown),
            Err(EngineError::UnknownFeature(_))
        ));
    }

    #[test]
    fn test_sync_notifies_finalised_intervals() {
        let notifier = Arc::new(CountingNotifier::default());
        let engine = TelemetryEngine::new(
            Arc::new(MemoryStore::new()),
            notifier.clone(),
            EngineConfig::default(),
        );
        let f = feature(FeatureKind::YieldAc);
        engine.register_feature(f, day_spec(), DeviceParams::default());

        for i in 0..2 {
            let start = ts("2024-03-15T00:00:00Z") + chrono::Duration::seconds(i * 300);
            let end = start + chrono::Duration::seconds(300);
            engine
                .add_raw_reading(&f, Reading::new(start, end, 0.5), end)
                .unwrap();
        }

        let outcome = engine.sync_feature(&f, ts("2024-03-15T00:12:00Z")).unwrap();
        assert_eq!(outcome.finalised.len(), 2);
        assert_eq!(notifier.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_consolidation_add_and_subtract_cancel() {
        let engine = consolidated_engine();
        let (yield_ac, grid_feed, consumption) = test_features(&engine);

        // Both sources contribute 2.0 to interval 0
        for source in [&yield_ac, &grid_feed] {
            engine
                .add_raw_reading(
                    source,
                    Reading::new(
                        ts("2024-03-15T00:00:00Z"),
                        ts("2024-03-15T00:05:00Z"),
                        2.0,
                    ),
                    ts("2024-03-15T00:05:00Z"),
                )
                .unwrap();
            engine
                .sync_feature(source, ts("2024-03-15T00:12:00Z"))
                .unwrap();
        }

        engine
            .refresh_consolidation_target(
                &consumption,
                ts("2024-03-15T00:00:00Z"),
                ts("2024-03-15T00:12:00Z"),
            )
            .unwrap();

        let container = engine.feature_periods(&consumption).unwrap();
        let period = container
            .find_or_create(
                ts("2024-03-15T00:00:00Z"),
                false,
                ts("2024-03-15T00:12:00Z"),
            )
            .unwrap();
        let readings = period.readings_snapshot();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].energy_delta, 0.0);
        assert!(readings[0].is_consolidation);
    }

    #[test]
    fn test_refresh_is_lazy_and_idempotent() {
        let engine = consolidated_engine();
        let (yield_ac, _, consumption) = test_features(&engine);

        engine
            .add_raw_reading(
                &yield_ac,
                Reading::new(
                    ts("2024-03-15T00:00:00Z"),
                    ts("2024-03-15T00:05:00Z"),
                    2.0,
                ),
                ts("2024-03-15T00:05:00Z"),
            )
            .unwrap();
        engine
            .sync_feature(&yield_ac, ts("2024-03-15T00:12:00Z"))
            .unwrap();

        for _ in 0..3 {
            engine
                .refresh_consolidation_target(
                    &consumption,
                    ts("2024-03-15T00:00:00Z"),
                    ts("2024-03-15T00:12:00Z"),
                )
                .unwrap();
        }

        let container = engine.feature_periods(&consumption).unwrap();
        let period = container
            .find_or_create(
                ts("2024-03-15T00:00:00Z"),
                false,
                ts("2024-03-15T00:12:00Z"),
            )
            .unwrap();
        let readings = period.readings_snapshot();
        // Redundant refreshes do not double-count
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].energy_delta, 2.0);
    }

    #[test]
    fn test_consolidation_state_round_trip() {
        let engine = consolidated_engine();
        let (yield_ac, _, consumption) = test_features(&engine);

        engine
            .add_raw_reading(
                &yield_ac,
                Reading::new(
                    ts("2024-03-15T00:00:00Z"),
                    ts("2024-03-15T00:05:00Z"),
                    2.0,
                ),
                ts("2024-03-15T00:05:00Z"),
            )
            .unwrap();
        engine
            .sync_feature(&yield_ac, ts("2024-03-15T00:12:00Z"))
            .unwrap();

        let saved = engine.consolidation_state().unwrap();
        engine.restore_consolidation_state(&saved).unwrap();
        assert!(engine.registry.has_updates_for(&consumption));
    }

    fn consolidated_engine() -> TelemetryEngine {
        let store = Arc::new(MemoryStore::new());
        TelemetryEngine::new(store, Arc::new(NullNotifier), EngineConfig::default())
    }

    /// Registers yield, grid-feed and a consumption target linked as
    /// `consumption = yield_ac - grid_feed`.
    fn test_features(
        engine: &TelemetryEngine,
    ) -> (DeviceFeature, DeviceFeature, DeviceFeature) {
        let yield_ac = feature(FeatureKind::YieldAc);
        let grid_feed = feature(FeatureKind::GridFeedIn);
        let consumption = feature(FeatureKind::Consumption);
        for f in [yield_ac, grid_feed, consumption] {
            engine.register_feature(f, day_spec(), DeviceParams::default());
        }
        engine.registry.restore(vec![
            ConsolidationLink::new(yield_ac, consumption, ConsolidationOp::Add),
            ConsolidationLink::new(grid_feed, consumption, ConsolidationOp::Subtract),
        ]);
        (yield_ac, grid_feed, consumption)
    }
}
