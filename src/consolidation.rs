//! Consolidation linkage
//!
//! Declarative links from a source device-feature to a virtual target
//! feature with an arithmetic operation: a site meter minus the grid
//! feed, two inverters summed into a plant total. Aggregation is lazy:
//! a source advancing marks its links dirty, and the target recomputes
//! only when it is next referenced.
//!
//! Link state snapshots to JSON so a restarted process does not treat
//! every target as cold.

use crate::types::DeviceFeature;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// How a source's readings enter the target bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationOp {
    Add,
    Subtract,
}

impl ConsolidationOp {
    /// The factor fed into `Reading::accumulate`.
    pub fn factor(&self) -> f64 {
        match self {
            ConsolidationOp::Add => 1.0,
            ConsolidationOp::Subtract => -1.0,
        }
    }
}

/// One directional source → target aggregation link.
///
/// Many links may share a target; the target bucket sees each source
/// through its own operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationLink {
    pub from: DeviceFeature,
    pub to: DeviceFeature,
    pub op: ConsolidationOp,
    /// Frontier up to which the source has finalised intervals
    pub last_ready_time: Option<DateTime<Utc>>,
    /// The source advanced past the frontier the target last consumed
    pub source_updated: bool,
}

impl ConsolidationLink {
    pub fn new(from: DeviceFeature, to: DeviceFeature, op: ConsolidationOp) -> Self {
        ConsolidationLink {
            from,
            to,
            op,
            last_ready_time: None,
            source_updated: false,
        }
    }
}

/// All consolidation links of a site, with their dirty state.
#[derive(Debug, Default)]
pub struct ConsolidationRegistry {
    links: Mutex<Vec<ConsolidationLink>>,
}

impl ConsolidationRegistry {
    pub fn new(links: Vec<ConsolidationLink>) -> Self {
        ConsolidationRegistry {
            links: Mutex::new(links),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().expect("registry lock poisoned").is_empty()
    }

    pub fn links_snapshot(&self) -> Vec<ConsolidationLink> {
        self.links.lock().expect("registry lock poisoned").clone()
    }

    /// Whether `feature` is the target of any link.
    pub fn is_target(&self, feature: &DeviceFeature) -> bool {
        self.links
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .any(|l| l.to == *feature)
    }

    /// All sources feeding `target`, regardless of dirty state.
    pub fn sources_of(&self, target: &DeviceFeature) -> Vec<(DeviceFeature, ConsolidationOp)> {
        self.links
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .filter(|l| l.to == *target)
            .map(|l| (l.from, l.op))
            .collect()
    }

    /// Frontier of finalised source data for one link.
    pub fn ready_time(&self, from: &DeviceFeature, to: &DeviceFeature) -> Option<DateTime<Utc>> {
        self.links
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .find(|l| l.from == *from && l.to == *to)
            .and_then(|l| l.last_ready_time)
    }

    /// Record that `feature` has finalised intervals up to `up_to`.
    ///
    /// Every matching link advances its frontier and turns dirty; the
    /// distinct targets affected are returned once each, however many
    /// of their links advanced.
    pub fn notify_source_advanced(
        &self,
        feature: &DeviceFeature,
        up_to: DateTime<Utc>,
    ) -> Vec<DeviceFeature> {
        let mut links = self.links.lock().expect("registry lock poisoned");
        let mut targets: Vec<DeviceFeature> = Vec::new();
        for link in links.iter_mut() {
            if link.from != *feature {
                continue;
            }
            if link.last_ready_time.map_or(true, |t| t < up_to) {
                link.last_ready_time = Some(up_to);
                link.source_updated = true;
                if !targets.contains(&link.to) {
                    targets.push(link.to);
                }
            }
        }
        targets
    }

    /// Whether any link into `target` has unconsumed source progress.
    pub fn has_updates_for(&self, target: &DeviceFeature) -> bool {
        self.links
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .any(|l| l.to == *target && l.source_updated)
    }

    /// Consume the dirty flags of every link into `target`. Idempotent
    /// by construction: a second call without fresh source progress
    /// returns nothing.
    pub fn take_updates_for(&self, target: &DeviceFeature) -> Vec<ConsolidationLink> {
        let mut links = self.links.lock().expect("registry lock poisoned");
        let mut consumed = Vec::new();
        for link in links.iter_mut() {
            if link.to == *target && link.source_updated {
                link.source_updated = false;
                consumed.push(link.clone());
            }
        }
        consumed
    }

    /// Replace the link set wholesale, e.g. from a saved snapshot.
    pub fn restore(&self, links: Vec<ConsolidationLink>) {
        *self.links.lock().expect("registry lock poisoned") = links;
    }

    /// Serialise link state for a process restart.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.links.lock().expect("registry lock poisoned"))
    }

    /// Restore link state saved by [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(ConsolidationRegistry::new(serde_json::from_str(json)?))
    }
}
