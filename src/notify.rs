//! Output-ready notification seam
//!
//! Downstream consumers (consolidation, eventing) learn that a
//! sub-interval has been finalised through this interface. The engine
//! fires it once per finalised interval during a database sync; what the
//! consumer does with it is not this crate's concern.

use crate::types::DeviceFeature;
use chrono::{DateTime, Utc};

/// Receiver for finalised-interval notifications.
pub trait OutputNotifier: Send + Sync {
    fn output_ready(&self, feature: &DeviceFeature, reading_end: DateTime<Utc>);
}

/// Notifier that drops every notification.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl OutputNotifier for NullNotifier {
    fn output_ready(&self, _feature: &DeviceFeature, _reading_end: DateTime<Utc>) {}
}
