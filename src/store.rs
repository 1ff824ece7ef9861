// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Store abstractions
//!
//! The pulse log and the assignment table live outside this crate. These
//! traits describe the logical contract the aggregator, tracker and analyzer
//! rely on; [`MemoryPulseStore`] and [`MemoryAssignmentStore`] are in-process
//! implementations.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::pulse::{ActiveAssignment, MachineId, Pulse, PulseId};

/// Append-only pulse log indexed by `(machine_id, timestamp)`
pub trait PulseStore: Send + Sync {
    /// Append a pulse. Returns `false` when a pulse with the same id is
    /// already stored (the append is then a no-op).
    fn append(&self, pulse: Pulse) -> Result<bool, StoreError>;

    /// Allocate an id for a pulse delivered without one. The id is above
    /// every stored id and is never handed out twice.
    fn next_id(&self) -> Result<PulseId, StoreError>;

    /// Pulses with `start <= timestamp < end`, for one machine or all of them
    fn range(
        &self,
        machine_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Pulse>, StoreError>;

    /// Number of stored pulses
    fn len(&self) -> usize;

    /// Whether the store holds no pulses
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutable lane → product table keyed by `(machine_id, lane_id)`
pub trait AssignmentStore: Send + Sync {
    /// Insert or replace the binding for the assignment's lane
    fn upsert(&self, assignment: ActiveAssignment) -> Result<(), StoreError>;

    /// Remove a binding, returning it if it existed
    fn remove(&self, machine_id: &str, lane_id: &str)
        -> Result<Option<ActiveAssignment>, StoreError>;

    /// Bindings of one machine, ordered by lane
    fn for_machine(&self, machine_id: &str) -> Result<Vec<ActiveAssignment>, StoreError>;

    /// Every binding
    fn all(&self) -> Result<Vec<ActiveAssignment>, StoreError>;
}

type IndexKey = (MachineId, DateTime<Utc>, PulseId);

#[derive(Debug, Default)]
struct PulseIndex {
    ids: HashSet<PulseId>,
    by_machine: BTreeMap<IndexKey, Pulse>,
    next_id: u64,
}

/// In-memory pulse log
#[derive(Debug, Default)]
pub struct MemoryPulseStore {
    inner: RwLock<PulseIndex>,
    fail_reads: AtomicBool,
}

impl MemoryPulseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with pulses
    pub fn with_pulses(pulses: impl IntoIterator<Item = Pulse>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().unwrap_or_else(|e| e.into_inner());
            for pulse in pulses {
                insert(&mut inner, pulse);
            }
        }
        store
    }

    /// Make subsequent range reads fail (outage simulation)
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Whether a pulse id is stored
    pub fn contains(&self, id: PulseId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ids
            .contains(&id)
    }

    /// Distinct machines with at least one pulse
    pub fn machines(&self) -> Vec<MachineId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut machines: Vec<MachineId> =
            inner.by_machine.keys().map(|(m, _, _)| m.clone()).collect();
        machines.dedup();
        machines
    }
}

fn insert(index: &mut PulseIndex, pulse: Pulse) -> bool {
    if !index.ids.insert(pulse.id) {
        return false;
    }
    index.next_id = index.next_id.max(pulse.id.0.saturating_add(1));
    let key = (pulse.machine_id.clone(), pulse.timestamp, pulse.id);
    index.by_machine.insert(key, pulse);
    true
}

impl PulseStore for MemoryPulseStore {
    fn append(&self, pulse: Pulse) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        Ok(insert(&mut inner, pulse))
    }

    fn next_id(&self) -> Result<PulseId, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.next_id == u64::MAX {
            return Err(StoreError::WriteFailed {
                reason: "pulse id space exhausted".to_string(),
            });
        }
        let id = PulseId(inner.next_id);
        inner.next_id += 1;
        Ok(id)
    }

    fn range(
        &self,
        machine_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Pulse>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::ReadFailed {
                reason: "pulse store unavailable".to_string(),
            });
        }
        if start >= end {
            return Ok(Vec::new());
        }

        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let pulses = match machine_id {
            Some(machine) => {
                let lo = (machine.to_string(), start, PulseId(0));
                let hi = (machine.to_string(), end, PulseId(0));
                inner
                    .by_machine
                    .range(lo..hi)
                    .map(|(_, p)| p.clone())
                    .collect()
            }
            None => inner
                .by_machine
                .values()
                .filter(|p| p.timestamp >= start && p.timestamp < end)
                .cloned()
                .collect(),
        };
        Ok(pulses)
    }

    fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).ids.len()
    }
}

/// In-memory assignment table
#[derive(Debug, Default)]
pub struct MemoryAssignmentStore {
    rows: RwLock<BTreeMap<(MachineId, String), String>>,
}

impl MemoryAssignmentStore {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignmentStore for MemoryAssignmentStore {
    fn upsert(&self, assignment: ActiveAssignment) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        rows.insert(
            (assignment.machine_id, assignment.lane_id),
            assignment.product_sku,
        );
        Ok(())
    }

    fn remove(
        &self,
        machine_id: &str,
        lane_id: &str,
    ) -> Result<Option<ActiveAssignment>, StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .remove(&(machine_id.to_string(), lane_id.to_string()))
            .map(|sku| ActiveAssignment::new(machine_id, lane_id, sku)))
    }

    fn for_machine(&self, machine_id: &str) -> Result<Vec<ActiveAssignment>, StoreError> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .filter(|((m, _), _)| m == machine_id)
            .map(|((m, l), sku)| ActiveAssignment::new(m.as_str(), l.as_str(), sku.as_str()))
            .collect())
    }

    fn all(&self) -> Result<Vec<ActiveAssignment>, StoreError> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .map(|((m, l), sku)| ActiveAssignment::new(m.as_str(), l.as_str(), sku.as_str()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::RawPulse;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
    }

    fn pulse(machine: &str, h: u32, m: u32) -> Pulse {
        RawPulse::new(machine, at(h, m)).validate().unwrap()
    }

    #[test]
    fn test_append_dedups_by_id() {
        let store = MemoryPulseStore::new();
        assert!(store.append(pulse("m1", 8, 0)).unwrap());
        assert!(!store.append(pulse("m1", 8, 0)).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_next_id_skips_stored_and_allocated() {
        let store = MemoryPulseStore::new();
        assert_eq!(store.next_id().unwrap(), PulseId(0));

        let stored = RawPulse::new("m1", at(8, 0)).id(41).validate().unwrap();
        store.append(stored).unwrap();
        let a = store.next_id().unwrap();
        let b = store.next_id().unwrap();
        assert_eq!(a, PulseId(42));
        assert_eq!(b, PulseId(43));
    }

    #[test]
    fn test_next_id_exhausted() {
        let store = MemoryPulseStore::with_pulses(vec![RawPulse::new("m1", at(8, 0))
            .id(u64::MAX - 1)
            .validate()
            .unwrap()]);
        assert!(matches!(
            store.next_id(),
            Err(StoreError::WriteFailed { .. })
        ));
    }

    #[test]
    fn test_range_single_machine() {
        let store = MemoryPulseStore::with_pulses(vec![
            pulse("m1", 7, 59),
            pulse("m1", 8, 0),
            pulse("m1", 8, 30),
            pulse("m2", 8, 10),
            pulse("m1", 9, 0),
        ]);

        let got = store.range(Some("m1"), at(8, 0), at(9, 0)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].timestamp, at(8, 0));
        assert_eq!(got[1].timestamp, at(8, 30));
    }

    #[test]
    fn test_range_all_machines() {
        let store = MemoryPulseStore::with_pulses(vec![
            pulse("m1", 8, 0),
            pulse("m2", 8, 10),
            pulse("m3", 10, 0),
        ]);
        let got = store.range(None, at(8, 0), at(9, 0)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(store.machines(), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_fail_reads() {
        let store = MemoryPulseStore::with_pulses(vec![pulse("m1", 8, 0)]);
        store.set_fail_reads(true);
        assert!(matches!(
            store.range(None, at(0, 0), at(23, 0)),
            Err(StoreError::ReadFailed { .. })
        ));
        store.set_fail_reads(false);
        assert_eq!(store.range(None, at(0, 0), at(23, 0)).unwrap().len(), 1);
    }

    #[test]
    fn test_assignment_upsert_is_per_lane() {
        let store = MemoryAssignmentStore::new();
        store.upsert(ActiveAssignment::new("m1", "A", "X")).unwrap();
        store.upsert(ActiveAssignment::new("m1", "B", "Y")).unwrap();
        store.upsert(ActiveAssignment::new("m2", "A", "X")).unwrap();

        let m1 = store.for_machine("m1").unwrap();
        assert_eq!(m1.len(), 2);
        assert_eq!(m1[0].product_sku, "X");
        assert_eq!(m1[1].product_sku, "Y");

        store.upsert(ActiveAssignment::new("m1", "A", "Z")).unwrap();
        let m1 = store.for_machine("m1").unwrap();
        assert_eq!(m1[0].product_sku, "Z");
        assert_eq!(store.all().unwrap().len(), 3);
    }

    #[test]
    fn test_assignment_remove() {
        let store = MemoryAssignmentStore::new();
        store.upsert(ActiveAssignment::new("m1", "A", "X")).unwrap();
        let removed = store.remove("m1", "A").unwrap();
        assert_eq!(removed, Some(ActiveAssignment::new("m1", "A", "X")));
        assert!(store.remove("m1", "A").unwrap().is_none());
        assert!(store.for_machine("m1").unwrap().is_empty());
    }
}
