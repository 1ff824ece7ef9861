// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Active-assignment tracker
//!
//! Mirrors the lane -> product table and notifies per-machine subscribers
//! of every change. Lanes are independent: writing one lane never touches
//! another lane of the same machine.
//!
//! Operator assignments and pulse-reported SKUs are two separate sources
//! of truth. [`AssignmentTracker::resolve`] combines them for display:
//! assignments win, the aggregator's current product is shown only for a
//! machine with no configured lanes, and disagreement on a lane is
//! reported as a [`ProductConflict`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::feed::{Broadcaster, Subscription};
use crate::live::MachineLiveState;
use crate::pulse::{ActiveAssignment, LaneAssignment, LaneId, MachineId, Sku};
use crate::store::AssignmentStore;

/// Change notification for one machine's lanes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum AssignmentChange {
    Assigned(ActiveAssignment),
    Cleared { machine_id: MachineId, lane_id: LaneId },
}

impl AssignmentChange {
    pub fn machine_id(&self) -> &str {
        match self {
            Self::Assigned(a) => &a.machine_id,
            Self::Cleared { machine_id, .. } => machine_id,
        }
    }
}

/// Lane whose assignment disagrees with what its pulses report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConflict {
    pub lane_id: LaneId,
    pub assigned_sku: Sku,
    pub reported_sku: Sku,
}

/// Where a displayed product comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductSource {
    Assignment,
    Pulse,
}

/// What to display as a machine's product(s)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductView {
    pub machine_id: MachineId,
    /// Configured lanes, ordered by lane id
    pub lanes: Vec<LaneAssignment>,
    /// Pulse-reported product, only when no lane is configured
    pub fallback_product: Option<Sku>,
    pub conflicts: Vec<ProductConflict>,
}

impl ProductView {
    pub fn source(&self) -> Option<ProductSource> {
        if !self.lanes.is_empty() {
            Some(ProductSource::Assignment)
        } else if self.fallback_product.is_some() {
            Some(ProductSource::Pulse)
        } else {
            None
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

type Mirror = BTreeMap<MachineId, BTreeMap<LaneId, Sku>>;

/// In-memory mirror of the assignment store with change fan-out
pub struct AssignmentTracker {
    store: Arc<dyn AssignmentStore>,
    mirror: RwLock<Mirror>,
    changes: Broadcaster<AssignmentChange>,
}

impl std::fmt::Debug for AssignmentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentTracker")
            .field("machines", &self.read().len())
            .field("subscribers", &self.changes.subscriber_count())
            .finish()
    }
}

impl AssignmentTracker {
    pub fn new(store: Arc<dyn AssignmentStore>) -> Self {
        Self {
            store,
            mirror: RwLock::new(BTreeMap::new()),
            changes: Broadcaster::new(),
        }
    }

    /// Reload the mirror from the store.
    ///
    /// Differences against the previous mirror are published, so
    /// subscribers catch up on anything missed while disconnected.
    pub fn load(&self) -> Result<usize> {
        let rows = self.store.all()?;
        let mut next: Mirror = BTreeMap::new();
        for row in &rows {
            next.entry(row.machine_id.clone())
                .or_default()
                .insert(row.lane_id.clone(), row.product_sku.clone());
        }

        let mut mirror = self.write();
        for (machine_id, lanes) in &next {
            let before = mirror.get(machine_id);
            for (lane_id, sku) in lanes {
                if before.and_then(|b| b.get(lane_id)) != Some(sku) {
                    self.publish(AssignmentChange::Assigned(ActiveAssignment::new(
                        machine_id.as_str(),
                        lane_id.as_str(),
                        sku.as_str(),
                    )));
                }
            }
        }
        for (machine_id, lanes) in mirror.iter() {
            for lane_id in lanes.keys() {
                let kept = next.get(machine_id).map_or(false, |l| l.contains_key(lane_id));
                if !kept {
                    self.publish(AssignmentChange::Cleared {
                        machine_id: machine_id.clone(),
                        lane_id: lane_id.clone(),
                    });
                }
            }
        }
        *mirror = next;

        info!("Loaded {} lane assignments", rows.len());
        Ok(rows.len())
    }

    /// Bind a product to a lane, replacing any previous binding
    pub fn assign(&self, assignment: ActiveAssignment) -> Result<()> {
        self.store.upsert(assignment.clone())?;
        {
            let mut mirror = self.write();
            mirror
                .entry(assignment.machine_id.clone())
                .or_default()
                .insert(assignment.lane_id.clone(), assignment.product_sku.clone());
        }
        debug!(
            "Assigned {} to {}/{}",
            assignment.product_sku, assignment.machine_id, assignment.lane_id
        );
        self.publish(AssignmentChange::Assigned(assignment));
        Ok(())
    }

    /// Remove a lane binding. Returns whether one existed.
    pub fn clear(&self, machine_id: &str, lane_id: &str) -> Result<bool> {
        let removed = self.store.remove(machine_id, lane_id)?;
        {
            let mut mirror = self.write();
            if let Some(lanes) = mirror.get_mut(machine_id) {
                lanes.remove(lane_id);
                if lanes.is_empty() {
                    mirror.remove(machine_id);
                }
            }
        }
        if removed.is_none() {
            return Ok(false);
        }
        debug!("Cleared {}/{}", machine_id, lane_id);
        self.publish(AssignmentChange::Cleared {
            machine_id: machine_id.to_string(),
            lane_id: lane_id.to_string(),
        });
        Ok(true)
    }

    /// Current bindings of a machine, ordered by lane
    pub fn assignments(&self, machine_id: &str) -> Vec<LaneAssignment> {
        self.read()
            .get(machine_id)
            .map(|lanes| {
                lanes
                    .iter()
                    .map(|(lane_id, sku)| LaneAssignment {
                        lane_id: lane_id.clone(),
                        product_sku: sku.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every binding
    pub fn all(&self) -> Vec<ActiveAssignment> {
        self.read()
            .iter()
            .flat_map(|(machine_id, lanes)| {
                lanes.iter().map(move |(lane_id, sku)| {
                    ActiveAssignment::new(machine_id.as_str(), lane_id.as_str(), sku.as_str())
                })
            })
            .collect()
    }

    /// Changes for one machine
    pub fn subscribe(&self, machine_id: &str) -> Subscription<AssignmentChange> {
        self.changes.subscribe_topic(machine_id)
    }

    /// Changes for every machine
    pub fn subscribe_all(&self) -> Subscription<AssignmentChange> {
        self.changes.subscribe()
    }

    /// Combine assignments and pulse-reported products for display
    pub fn resolve(&self, machine_id: &str, live: Option<&MachineLiveState>) -> ProductView {
        let lanes = self.assignments(machine_id);

        let mut conflicts = Vec::new();
        if let Some(state) = live {
            for lane in &lanes {
                if let Some(reported) = state.lane_products.get(&lane.lane_id) {
                    if reported != &lane.product_sku {
                        warn!(
                            "Product conflict on {}/{}: assigned {}, pulses report {}",
                            machine_id, lane.lane_id, lane.product_sku, reported
                        );
                        conflicts.push(ProductConflict {
                            lane_id: lane.lane_id.clone(),
                            assigned_sku: lane.product_sku.clone(),
                            reported_sku: reported.clone(),
                        });
                    }
                }
            }
        }

        let fallback_product = if lanes.is_empty() {
            live.and_then(|s| s.current_product.clone())
        } else {
            None
        };

        ProductView {
            machine_id: machine_id.to_string(),
            lanes,
            fallback_product,
            conflicts,
        }
    }

    fn publish(&self, change: AssignmentChange) {
        let machine_id = change.machine_id().to_string();
        self.changes.publish_topic(&machine_id, change);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Mirror> {
        self.mirror.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Mirror> {
        self.mirror.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::MachineStatus;
    use crate::store::MemoryAssignmentStore;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn tracker() -> (Arc<MemoryAssignmentStore>, AssignmentTracker) {
        let store = Arc::new(MemoryAssignmentStore::new());
        let tracker = AssignmentTracker::new(store.clone());
        (store, tracker)
    }

    fn live_state(current: Option<&str>, lanes: &[(&str, &str)]) -> MachineLiveState {
        MachineLiveState {
            machine_id: "m1".to_string(),
            day: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            total_count: 10,
            last_seen: Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap(),
            status: MachineStatus::Online,
            current_product: current.map(str::to_string),
            lane_products: lanes
                .iter()
                .map(|(l, s)| (l.to_string(), s.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_lanes_are_independent() {
        let (_, tracker) = tracker();
        let sub = tracker.subscribe("m1");

        tracker.assign(ActiveAssignment::new("m1", "A", "X")).unwrap();
        tracker.assign(ActiveAssignment::new("m1", "B", "Y")).unwrap();
        assert_eq!(
            tracker.assignments("m1"),
            vec![
                LaneAssignment { lane_id: "A".into(), product_sku: "X".into() },
                LaneAssignment { lane_id: "B".into(), product_sku: "Y".into() },
            ]
        );

        tracker.assign(ActiveAssignment::new("m1", "A", "Z")).unwrap();
        let lanes = tracker.assignments("m1");
        assert_eq!(lanes[0].product_sku, "Z");
        assert_eq!(lanes[1].product_sku, "Y");

        assert_eq!(sub.drain().len(), 3);
    }

    #[test]
    fn test_subscriber_scoped_to_machine() {
        let (_, tracker) = tracker();
        let m1 = tracker.subscribe("m1");
        let every = tracker.subscribe_all();

        tracker.assign(ActiveAssignment::new("m2", "A", "X")).unwrap();
        assert!(m1.drain().is_empty());
        assert_eq!(every.drain().len(), 1);
    }

    #[test]
    fn test_clear() {
        let (store, tracker) = tracker();
        tracker.assign(ActiveAssignment::new("m1", "A", "X")).unwrap();
        let sub = tracker.subscribe("m1");

        assert!(tracker.clear("m1", "A").unwrap());
        assert!(!tracker.clear("m1", "A").unwrap());
        assert!(tracker.assignments("m1").is_empty());
        assert!(store.all().unwrap().is_empty());
        assert_eq!(
            sub.drain(),
            vec![AssignmentChange::Cleared {
                machine_id: "m1".into(),
                lane_id: "A".into()
            }]
        );
    }

    #[test]
    fn test_load_publishes_differences() {
        let (store, tracker) = tracker();
        tracker.assign(ActiveAssignment::new("m1", "A", "X")).unwrap();
        tracker.assign(ActiveAssignment::new("m1", "B", "Y")).unwrap();
        let sub = tracker.subscribe("m1");

        // table changed behind the tracker's back
        store.upsert(ActiveAssignment::new("m1", "A", "W")).unwrap();
        store.remove("m1", "B").unwrap();

        assert_eq!(tracker.load().unwrap(), 1);
        let changes = sub.drain();
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&AssignmentChange::Assigned(ActiveAssignment::new("m1", "A", "W"))));
        assert!(changes.contains(&AssignmentChange::Cleared {
            machine_id: "m1".into(),
            lane_id: "B".into()
        }));
    }

    #[test]
    fn test_resolve_prefers_assignment() {
        let (_, tracker) = tracker();
        tracker.assign(ActiveAssignment::new("m1", "A", "X")).unwrap();

        let view = tracker.resolve("m1", Some(&live_state(Some("Q"), &[])));
        assert_eq!(view.source(), Some(ProductSource::Assignment));
        assert_eq!(view.fallback_product, None);
        assert!(!view.has_conflicts());
    }

    #[test]
    fn test_resolve_falls_back_to_pulse_product() {
        let (_, tracker) = tracker();
        let view = tracker.resolve("m1", Some(&live_state(Some("Q"), &[])));
        assert_eq!(view.source(), Some(ProductSource::Pulse));
        assert_eq!(view.fallback_product.as_deref(), Some("Q"));

        let view = tracker.resolve("m1", None);
        assert_eq!(view.source(), None);
    }

    #[test]
    fn test_resolve_reports_conflict() {
        let (_, tracker) = tracker();
        tracker.assign(ActiveAssignment::new("m1", "A", "X")).unwrap();
        tracker.assign(ActiveAssignment::new("m1", "B", "Y")).unwrap();

        let view = tracker.resolve("m1", Some(&live_state(Some("Z"), &[("A", "Z"), ("B", "Y")])));
        assert_eq!(
            view.conflicts,
            vec![ProductConflict {
                lane_id: "A".into(),
                assigned_sku: "X".into(),
                reported_sku: "Z".into(),
            }]
        );
        assert_eq!(view.lanes.len(), 2);
    }
}
