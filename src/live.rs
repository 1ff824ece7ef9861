// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Live machine state
//!
//! [`LiveStateStore`] is the single owner of every [`MachineLiveState`].
//! The aggregator folds pulses into it and the staleness monitor demotes
//! silent machines; both go through its methods so every mutation happens
//! under one lock and is announced to subscribers as a [`StateDelta`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::feed::{Broadcaster, Subscription};
use crate::monitor::is_stale;
use crate::pulse::{LaneId, MachineId, Pulse, PulseId, Sku};

/// Online/offline status, inferred from pulse silence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Offline,
}

impl MachineStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Derived state of one machine for its current local day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineLiveState {
    pub machine_id: MachineId,
    /// Local day `total_count` refers to
    pub day: NaiveDate,
    /// Units produced on `day`
    pub total_count: u64,
    /// Latest pulse timestamp ever folded
    pub last_seen: DateTime<Utc>,
    pub status: MachineStatus,
    /// SKU of the most recent pulse that carried one
    pub current_product: Option<Sku>,
    /// Most recent pulse-reported SKU per lane
    #[serde(default)]
    pub lane_products: BTreeMap<LaneId, Sku>,
}

/// What caused a state delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaCause {
    /// A pulse was folded in
    Pulse,
    /// Staleness sweep demoted the machine
    WentOffline,
    /// Full initialise for the current day
    Reseeded,
    /// Machine moved to a new local day
    DayRollover,
    /// Reconcile corrected drift against the store
    Reconciled,
}

/// Full machine state after a change; applying it twice is harmless
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    pub cause: DeltaCause,
    pub state: MachineLiveState,
}

type Stamp = (DateTime<Utc>, PulseId);

/// Per-machine accumulator: public state plus bookkeeping for idempotent folds
#[derive(Debug, Clone)]
pub(crate) struct Tally {
    pub(crate) state: MachineLiveState,
    seen: HashSet<PulseId>,
    product_at: Option<Stamp>,
    lane_product_at: HashMap<LaneId, Stamp>,
}

impl Tally {
    pub(crate) fn new(machine_id: impl Into<String>, day: NaiveDate, last_seen: DateTime<Utc>) -> Self {
        Self {
            state: MachineLiveState {
                machine_id: machine_id.into(),
                day,
                total_count: 0,
                last_seen,
                status: MachineStatus::Offline,
                current_product: None,
                lane_products: BTreeMap::new(),
            },
            seen: HashSet::new(),
            product_at: None,
            lane_product_at: HashMap::new(),
        }
    }

    /// Build a tally from one machine's pulses for `day`
    pub(crate) fn seed<'a>(
        machine_id: &str,
        day: NaiveDate,
        pulses: impl IntoIterator<Item = &'a Pulse>,
    ) -> Option<Self> {
        let mut tally: Option<Tally> = None;
        for pulse in pulses {
            tally
                .get_or_insert_with(|| Tally::new(machine_id, day, pulse.timestamp))
                .fold(pulse);
        }
        tally
    }

    /// Fold a pulse. Returns `false` if its id was already counted.
    pub(crate) fn fold(&mut self, pulse: &Pulse) -> bool {
        if !self.seen.insert(pulse.id) {
            return false;
        }

        self.state.total_count += pulse.units();
        if pulse.timestamp > self.state.last_seen {
            self.state.last_seen = pulse.timestamp;
        }

        if let Some(sku) = &pulse.product_sku {
            let stamp = (pulse.timestamp, pulse.id);
            if self.product_at.map_or(true, |at| stamp >= at) {
                self.state.current_product = Some(sku.clone());
                self.product_at = Some(stamp);
            }
            if let Some(lane) = &pulse.lane_id {
                let newer = self
                    .lane_product_at
                    .get(lane)
                    .map_or(true, |at| stamp >= *at);
                if newer {
                    self.state.lane_products.insert(lane.clone(), sku.clone());
                    self.lane_product_at.insert(lane.clone(), stamp);
                }
            }
        }
        true
    }

    /// Carry a machine into a new day with nothing produced yet
    pub(crate) fn carried_into(&self, day: NaiveDate) -> Self {
        let mut next = Tally::new(self.state.machine_id.clone(), day, self.state.last_seen);
        next.state.status = self.state.status;
        next.state.current_product = self.state.current_product.clone();
        next.state.lane_products = self.state.lane_products.clone();
        next.product_at = self.product_at;
        next.lane_product_at = self.lane_product_at.clone();
        next
    }

    /// Keep the later product knowledge of `self` and `older`
    pub(crate) fn inherit_products(&mut self, older: &Tally) {
        if let Some(at) = older.product_at {
            if self.product_at.map_or(true, |mine| at > mine) {
                self.product_at = Some(at);
                self.state.current_product = older.state.current_product.clone();
            }
        }
        for (lane, at) in &older.lane_product_at {
            if self.lane_product_at.get(lane).map_or(true, |mine| at > mine) {
                if let Some(sku) = older.state.lane_products.get(lane) {
                    self.lane_product_at.insert(lane.clone(), *at);
                    self.state.lane_products.insert(lane.clone(), sku.clone());
                }
            }
        }
        if older.state.last_seen > self.state.last_seen {
            self.state.last_seen = older.state.last_seen;
        }
    }
}

/// Owner of all live machine state
#[derive(Debug, Default)]
pub struct LiveStateStore {
    tallies: Mutex<HashMap<MachineId, Tally>>,
    deltas: Broadcaster<StateDelta>,
}

impl LiveStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every machine's state
    pub fn snapshot(&self) -> HashMap<MachineId, MachineLiveState> {
        self.lock()
            .iter()
            .map(|(id, tally)| (id.clone(), tally.state.clone()))
            .collect()
    }

    /// State of one machine
    pub fn get(&self, machine_id: &str) -> Option<MachineLiveState> {
        self.lock().get(machine_id).map(|t| t.state.clone())
    }

    /// Number of known machines
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Machines currently online
    pub fn online_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|t| t.state.status.is_online())
            .count()
    }

    /// Subscribe to deltas of every machine
    pub fn subscribe(&self) -> Subscription<StateDelta> {
        self.deltas.subscribe()
    }

    /// Subscribe to deltas of one machine
    pub fn subscribe_machine(&self, machine_id: &str) -> Subscription<StateDelta> {
        self.deltas.subscribe_topic(machine_id)
    }

    /// Demote every online machine silent for at least `timeout`.
    /// Returns the ids demoted by this call.
    pub fn demote_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<MachineId> {
        let mut tallies = self.lock();
        let mut demoted = Vec::new();
        for tally in tallies.values_mut() {
            if tally.state.status.is_online() && is_stale(tally.state.last_seen, now, timeout) {
                tally.state.status = MachineStatus::Offline;
                demoted.push(tally.state.machine_id.clone());
                self.announce(DeltaCause::WentOffline, &tally.state);
            }
        }
        demoted.sort();
        demoted
    }

    pub(crate) fn with_tallies<R>(&self, f: impl FnOnce(&mut HashMap<MachineId, Tally>) -> R) -> R {
        f(&mut self.lock())
    }

    pub(crate) fn announce(&self, cause: DeltaCause, state: &MachineLiveState) {
        let delta = StateDelta {
            cause,
            state: state.clone(),
        };
        self.deltas.publish_topic(&state.machine_id, delta);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MachineId, Tally>> {
        self.tallies.lock().unwrap_or_else(|e| e.into_inner())
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

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    #[test]
    fn test_fold_counts_and_dedups() {
        let p1 = RawPulse::new("m1", at(8, 0)).quantity(3).validate().unwrap();
        let p2 = RawPulse::new("m1", at(8, 5)).validate().unwrap();

        let mut tally = Tally::new("m1", day(), p1.timestamp);
        assert!(tally.fold(&p1));
        assert!(tally.fold(&p2));
        assert!(!tally.fold(&p2));
        assert_eq!(tally.state.total_count, 4);
        assert_eq!(tally.state.last_seen, at(8, 5));
    }

    #[test]
    fn test_fold_keeps_latest_product() {
        let newer = RawPulse::new("m1", at(9, 0)).product("Y").validate().unwrap();
        let older = RawPulse::new("m1", at(8, 0)).product("X").validate().unwrap();
        let bare = RawPulse::new("m1", at(10, 0)).validate().unwrap();

        let mut tally = Tally::new("m1", day(), at(9, 0));
        tally.fold(&newer);
        tally.fold(&older);
        tally.fold(&bare);
        assert_eq!(tally.state.current_product.as_deref(), Some("Y"));
        assert_eq!(tally.state.last_seen, at(10, 0));
    }

    #[test]
    fn test_fold_lane_products() {
        let a = RawPulse::new("m1", at(8, 0)).lane("A").product("X").validate().unwrap();
        let b = RawPulse::new("m1", at(8, 1)).lane("B").product("Y").validate().unwrap();

        let tally = Tally::seed("m1", day(), [&a, &b]).unwrap();
        assert_eq!(tally.state.lane_products.get("A").map(String::as_str), Some("X"));
        assert_eq!(tally.state.lane_products.get("B").map(String::as_str), Some("Y"));
        assert_eq!(tally.state.current_product.as_deref(), Some("Y"));
    }

    #[test]
    fn test_seed_empty() {
        assert!(Tally::seed("m1", day(), Vec::<&Pulse>::new()).is_none());
    }

    #[test]
    fn test_demote_stale_announces() {
        let store = LiveStateStore::new();
        let sub = store.subscribe();
        store.with_tallies(|t| {
            let mut tally = Tally::new("m1", day(), at(10, 0));
            tally.state.status = MachineStatus::Online;
            t.insert("m1".to_string(), tally);
        });

        let timeout = chrono::Duration::minutes(5);
        assert!(store.demote_stale(at(10, 4), timeout).is_empty());
        assert_eq!(store.demote_stale(at(10, 5), timeout), vec!["m1"]);
        assert!(store.demote_stale(at(10, 6), timeout).is_empty());

        let deltas = sub.drain();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].cause, DeltaCause::WentOffline);
        assert_eq!(deltas[0].state.status, MachineStatus::Offline);
    }
}
