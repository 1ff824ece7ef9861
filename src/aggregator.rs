// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry aggregator
//!
//! Folds the pulse stream into per-machine live state for the current local
//! day. A full [`initialize`](TelemetryAggregator::initialize) seeds the
//! state from the pulse store; afterwards every pulse from the feed is
//! applied incrementally. Pulses are de-duplicated by id, so applying a
//! pulse that was already counted by a seed is a no-op.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use linepulse::aggregator::{PulseOutcome, TelemetryAggregator};
//! use linepulse::clock::DayCalendar;
//! use linepulse::pulse::RawPulse;
//! use linepulse::store::MemoryPulseStore;
//!
//! let store = Arc::new(MemoryPulseStore::new());
//! let mut aggregator =
//!     TelemetryAggregator::new(store, DayCalendar::utc(), chrono::Duration::minutes(5));
//!
//! let now = Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap();
//! aggregator.initialize(now.date_naive(), now).unwrap();
//!
//! let pulse = RawPulse::new("press-1", now).quantity(3).validate().unwrap();
//! assert_eq!(aggregator.apply_pulse(pulse), PulseOutcome::Applied);
//! assert_eq!(aggregator.live().get("press-1").unwrap().total_count, 3);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::clock::DayCalendar;
use crate::config::LinepulseConfig;
use crate::error::{PulseError, Result};
use crate::feed::FeedEvent;
use crate::live::{DeltaCause, LiveStateStore, MachineStatus, Tally};
use crate::pulse::{MachineId, Pulse};
use crate::store::PulseStore;

/// What `apply_pulse` did with a pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseOutcome {
    /// Folded into the machine's current day
    Applied,
    /// Pulse id already counted
    Duplicate,
    /// Machine moved to the pulse's (later) day, then the pulse was folded
    RolledOver,
    /// Pulse belongs to a day before the machine's current day
    LateDropped,
}

/// What `handle_feed_event` did with an event
#[derive(Debug, Clone, PartialEq)]
pub enum FeedOutcome {
    Pulse(PulseOutcome),
    /// Malformed record, skipped
    Rejected(PulseError),
    /// Full re-initialise after a reconnect; number of machines loaded
    Reinitialized(usize),
}

/// Live total that disagreed with the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub machine_id: MachineId,
    pub live_total: u64,
    pub store_total: u64,
}

/// Result of a full recompute against the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub day: NaiveDate,
    pub machines_checked: usize,
    pub drift: Vec<Drift>,
}

impl ReconcileReport {
    /// No machine needed correcting
    pub fn is_clean(&self) -> bool {
        self.drift.is_empty()
    }
}

/// Incremental per-machine, per-day aggregation of pulses
pub struct TelemetryAggregator {
    store: Arc<dyn PulseStore>,
    live: Arc<LiveStateStore>,
    calendar: DayCalendar,
    online_threshold: chrono::Duration,
    day: Option<NaiveDate>,
}

impl std::fmt::Debug for TelemetryAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryAggregator")
            .field("calendar", &self.calendar)
            .field("online_threshold", &self.online_threshold)
            .field("day", &self.day)
            .field("machines", &self.live.len())
            .finish()
    }
}

impl TelemetryAggregator {
    /// Create an aggregator with an empty live state
    pub fn new(
        store: Arc<dyn PulseStore>,
        calendar: DayCalendar,
        online_threshold: chrono::Duration,
    ) -> Self {
        Self {
            store,
            live: Arc::new(LiveStateStore::new()),
            calendar,
            online_threshold,
            day: None,
        }
    }

    /// Create an aggregator from configuration
    pub fn from_config(store: Arc<dyn PulseStore>, config: &LinepulseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(store, config.calendar()?, config.online_threshold()))
    }

    /// Shared live state, for the staleness monitor and readers
    pub fn live(&self) -> &Arc<LiveStateStore> {
        &self.live
    }

    /// Local day being aggregated, once known
    pub fn current_day(&self) -> Option<NaiveDate> {
        self.day
    }

    pub fn calendar(&self) -> &DayCalendar {
        &self.calendar
    }

    /// Rebuild the live state for `day` from the store.
    ///
    /// The new map is built completely before it replaces the old one; on a
    /// read failure the error is returned and the previous state stays.
    /// Machines known before but silent on `day` are carried over with a
    /// zero count. Returns the number of machines in the new state.
    pub fn initialize(&mut self, day: NaiveDate, now: DateTime<Utc>) -> Result<usize> {
        let window = self.calendar.window(day);
        let pulses = self.store.range(None, window.start, window.end)?;
        let fresh = seed_all(day, &pulses);
        let threshold = self.online_threshold;
        let live = &self.live;

        let machines = live.with_tallies(|current| {
            let mut next: HashMap<MachineId, Tally> = HashMap::with_capacity(current.len());

            for (machine_id, mut tally) in fresh {
                if let Some(previous) = current.get(&machine_id) {
                    tally.inherit_products(previous);
                }
                next.insert(machine_id, tally);
            }
            for (machine_id, previous) in current.iter() {
                if !next.contains_key(machine_id) {
                    next.insert(machine_id.clone(), previous.carried_into(day));
                }
            }
            for tally in next.values_mut() {
                tally.state.status = status_at(tally.state.last_seen, now, threshold);
            }

            *current = next;
            let mut ids: Vec<&MachineId> = current.keys().collect();
            ids.sort();
            for id in ids {
                live.announce(DeltaCause::Reseeded, &current[id].state);
            }
            current.len()
        });

        self.day = Some(day);
        info!(
            "Initialized live state for {}: {} pulses, {} machines",
            day,
            pulses.len(),
            machines
        );
        Ok(machines)
    }

    /// Fold one pulse into the live state
    pub fn apply_pulse(&mut self, pulse: Pulse) -> PulseOutcome {
        let pulse_day = self.calendar.day_of(pulse.timestamp);
        let current_day = *self.day.get_or_insert(pulse_day);
        let machine_day = self
            .live
            .get(&pulse.machine_id)
            .map(|state| state.day)
            .unwrap_or(current_day);

        if pulse_day < machine_day {
            warn!(
                "Dropping late pulse {} for {}: day {} is before {}",
                pulse.id, pulse.machine_id, pulse_day, machine_day
            );
            return PulseOutcome::LateDropped;
        }

        if pulse_day > machine_day {
            return self.roll_over(pulse, pulse_day);
        }

        let live = &self.live;
        live.with_tallies(|tallies| {
            let tally = tallies
                .entry(pulse.machine_id.clone())
                .or_insert_with(|| Tally::new(pulse.machine_id.clone(), machine_day, pulse.timestamp));
            if !tally.fold(&pulse) {
                debug!("Duplicate pulse {} for {}", pulse.id, pulse.machine_id);
                return PulseOutcome::Duplicate;
            }
            tally.state.status = MachineStatus::Online;
            debug!(
                "Applied pulse {} for {}: total {}",
                pulse.id, pulse.machine_id, tally.state.total_count
            );
            live.announce(DeltaCause::Pulse, &tally.state);
            PulseOutcome::Applied
        })
    }

    fn roll_over(&mut self, pulse: Pulse, day: NaiveDate) -> PulseOutcome {
        let window = self.calendar.window(day);
        let seeded = match self.store.range(Some(&pulse.machine_id), window.start, window.end) {
            Ok(pulses) => Tally::seed(&pulse.machine_id, day, &pulses),
            Err(e) => {
                warn!(
                    "Re-seed of {} for {} failed, starting from this pulse: {}",
                    pulse.machine_id, day, e
                );
                None
            }
        };

        if self.day.map_or(true, |current| day > current) {
            info!("Local day advanced to {}", day);
            self.day = Some(day);
        }

        let live = &self.live;
        live.with_tallies(|tallies| {
            let previous = tallies.remove(&pulse.machine_id);
            let mut tally = seeded
                .unwrap_or_else(|| Tally::new(pulse.machine_id.clone(), day, pulse.timestamp));
            if let Some(previous) = &previous {
                tally.inherit_products(previous);
            }
            tally.fold(&pulse);
            tally.state.status = MachineStatus::Online;
            info!(
                "Machine {} rolled over to {} with total {}",
                pulse.machine_id, day, tally.state.total_count
            );
            live.announce(DeltaCause::DayRollover, &tally.state);
            tallies.insert(pulse.machine_id.clone(), tally);
        });
        PulseOutcome::RolledOver
    }

    /// Move live state onto the wall-clock local day.
    ///
    /// Re-initialises when the aggregated day is behind. When a pulse has
    /// already advanced the aggregated day, every machine still on an
    /// earlier day is carried over on its own. Returns whether any machine
    /// changed day.
    pub fn refresh_day(&mut self, now: DateTime<Utc>) -> Result<bool> {
        let today = self.calendar.day_of(now);
        match self.day {
            Some(day) if day >= today => Ok(self.carry_behind(day, now)? > 0),
            _ => {
                self.initialize(today, now)?;
                Ok(true)
            }
        }
    }

    /// Re-seed every machine whose state is older than `day`
    fn carry_behind(&mut self, day: NaiveDate, now: DateTime<Utc>) -> Result<usize> {
        let behind = self
            .live
            .with_tallies(|tallies| tallies.values().any(|t| t.state.day < day));
        if !behind {
            return Ok(0);
        }

        let window = self.calendar.window(day);
        let pulses = self.store.range(None, window.start, window.end)?;
        let mut fresh = seed_all(day, &pulses);
        let threshold = self.online_threshold;
        let live = &self.live;

        let carried = live.with_tallies(|current| {
            let mut ids: Vec<MachineId> = current
                .iter()
                .filter(|(_, t)| t.state.day < day)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();

            for machine_id in &ids {
                let Some(previous) = current.get(machine_id) else {
                    continue;
                };
                let mut tally = match fresh.remove(machine_id) {
                    Some(mut seeded) => {
                        seeded.inherit_products(previous);
                        seeded
                    }
                    None => previous.carried_into(day),
                };
                tally.state.status = status_at(tally.state.last_seen, now, threshold);
                live.announce(DeltaCause::DayRollover, &tally.state);
                current.insert(machine_id.clone(), tally);
            }
            ids.len()
        });

        info!("Carried {} machines into {}", carried, day);
        Ok(carried)
    }

    /// Recompute the current day from the store and correct any machine
    /// whose live total disagrees.
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let day = self.day.unwrap_or_else(|| self.calendar.day_of(now));
        let window = self.calendar.window(day);
        let pulses = self.store.range(None, window.start, window.end)?;
        let fresh = seed_all(day, &pulses);
        let threshold = self.online_threshold;
        let live = &self.live;

        let report = live.with_tallies(|current| {
            let mut drift = Vec::new();
            let machines_checked = fresh.len();

            for (machine_id, mut tally) in fresh {
                let live_total = match current.get(&machine_id) {
                    Some(existing) if existing.state.day > day => continue,
                    Some(existing)
                        if existing.state.day == day
                            && existing.state.total_count == tally.state.total_count =>
                    {
                        continue
                    }
                    Some(existing) => {
                        let live_total = if existing.state.day == day {
                            existing.state.total_count
                        } else {
                            0
                        };
                        let advanced = tally.state.last_seen > existing.state.last_seen;
                        tally.inherit_products(existing);
                        tally.state.status = if advanced {
                            status_at(tally.state.last_seen, now, threshold)
                        } else {
                            existing.state.status
                        };
                        live_total
                    }
                    None => {
                        tally.state.status = status_at(tally.state.last_seen, now, threshold);
                        0
                    }
                };

                drift.push(Drift {
                    machine_id: machine_id.clone(),
                    live_total,
                    store_total: tally.state.total_count,
                });
                live.announce(DeltaCause::Reconciled, &tally.state);
                current.insert(machine_id, tally);
            }

            // Live counts the store has never seen
            let mut orphaned: Vec<MachineId> = current
                .iter()
                .filter(|(id, t)| {
                    t.state.day == day
                        && t.state.total_count > 0
                        && !drift.iter().any(|d| &d.machine_id == *id)
                        && !pulses.iter().any(|p| &p.machine_id == *id)
                })
                .map(|(id, _)| id.clone())
                .collect();
            orphaned.sort();
            for machine_id in orphaned {
                if let Some(existing) = current.get_mut(&machine_id) {
                    let live_total = existing.state.total_count;
                    let mut reset = existing.carried_into(day);
                    reset.state.status = existing.state.status;
                    *existing = reset;
                    live.announce(DeltaCause::Reconciled, &existing.state);
                    drift.push(Drift {
                        machine_id,
                        live_total,
                        store_total: 0,
                    });
                }
            }

            drift.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
            ReconcileReport {
                day,
                machines_checked,
                drift,
            }
        });

        for d in &report.drift {
            warn!(
                "Reconcile corrected {} on {}: live {} -> store {}",
                d.machine_id, day, d.live_total, d.store_total
            );
        }
        if self.day.is_none() {
            self.day = Some(day);
        }
        Ok(report)
    }

    /// Consume one event from the realtime feed
    pub fn handle_feed_event(&mut self, event: FeedEvent, now: DateTime<Utc>) -> Result<FeedOutcome> {
        match event {
            FeedEvent::Pulse(raw) => match raw.validate() {
                Ok(pulse) => Ok(FeedOutcome::Pulse(self.apply_pulse(pulse))),
                Err(e) => {
                    warn!("Skipping malformed pulse: {}", e);
                    Ok(FeedOutcome::Rejected(e))
                }
            },
            FeedEvent::Reconnected => {
                let today = self.calendar.day_of(now);
                let day = self.day.map_or(today, |day| day.max(today));
                info!("Feed reconnected, re-initializing {}", day);
                let machines = self.initialize(day, now)?;
                Ok(FeedOutcome::Reinitialized(machines))
            }
        }
    }
}

fn status_at(last_seen: DateTime<Utc>, now: DateTime<Utc>, threshold: chrono::Duration) -> MachineStatus {
    if now - last_seen < threshold {
        MachineStatus::Online
    } else {
        MachineStatus::Offline
    }
}

fn seed_all(day: NaiveDate, pulses: &[Pulse]) -> BTreeMap<MachineId, Tally> {
    let mut grouped: BTreeMap<&str, Vec<&Pulse>> = BTreeMap::new();
    for pulse in pulses {
        grouped.entry(pulse.machine_id.as_str()).or_default().push(pulse);
    }
    grouped
        .into_iter()
        .filter_map(|(machine_id, pulses)| {
            Tally::seed(machine_id, day, pulses).map(|t| (machine_id.to_string(), t))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::RawPulse;
    use crate::store::MemoryPulseStore;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, m, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn pulse(machine: &str, ts: DateTime<Utc>) -> Pulse {
        RawPulse::new(machine, ts).validate().unwrap()
    }

    fn aggregator(store: Arc<MemoryPulseStore>) -> TelemetryAggregator {
        TelemetryAggregator::new(store, DayCalendar::utc(), chrono::Duration::minutes(5))
    }

    #[test]
    fn test_initialize_folds_store() {
        let store = Arc::new(MemoryPulseStore::with_pulses(vec![
            RawPulse::new("m1", at(14, 8, 0)).product("X").validate().unwrap(),
            RawPulse::new("m1", at(14, 9, 0)).quantity(4).validate().unwrap(),
            pulse("m2", at(14, 9, 58)),
            pulse("m1", at(13, 23, 59)),
        ]));
        let mut agg = aggregator(store);

        assert_eq!(agg.initialize(day(14), at(14, 10, 0)).unwrap(), 2);

        let m1 = agg.live().get("m1").unwrap();
        assert_eq!(m1.total_count, 5);
        assert_eq!(m1.last_seen, at(14, 9, 0));
        assert_eq!(m1.current_product.as_deref(), Some("X"));
        assert_eq!(m1.status, MachineStatus::Offline);

        let m2 = agg.live().get("m2").unwrap();
        assert_eq!(m2.status, MachineStatus::Online);
        assert_eq!(agg.current_day(), Some(day(14)));
    }

    #[test]
    fn test_initialize_failure_keeps_state() {
        let store = Arc::new(MemoryPulseStore::with_pulses(vec![pulse("m1", at(14, 8, 0))]));
        let mut agg = aggregator(store.clone());
        agg.initialize(day(14), at(14, 8, 1)).unwrap();

        store.set_fail_reads(true);
        assert!(agg.initialize(day(15), at(15, 0, 1)).is_err());
        assert_eq!(agg.live().get("m1").unwrap().total_count, 1);
        assert_eq!(agg.current_day(), Some(day(14)));
    }

    #[test]
    fn test_apply_pulse_dedups() {
        let store = Arc::new(MemoryPulseStore::new());
        let mut agg = aggregator(store);
        let p = pulse("m1", at(14, 8, 0));

        assert_eq!(agg.apply_pulse(p.clone()), PulseOutcome::Applied);
        assert_eq!(agg.apply_pulse(p), PulseOutcome::Duplicate);
        assert_eq!(agg.live().get("m1").unwrap().total_count, 1);
    }

    #[test]
    fn test_seeded_pulse_not_double_counted() {
        let p = pulse("m1", at(14, 8, 0));
        let store = Arc::new(MemoryPulseStore::with_pulses(vec![p.clone()]));
        let mut agg = aggregator(store);
        agg.initialize(day(14), at(14, 8, 1)).unwrap();

        assert_eq!(agg.apply_pulse(p), PulseOutcome::Duplicate);
        assert_eq!(agg.live().get("m1").unwrap().total_count, 1);
    }

    #[test]
    fn test_product_not_cleared_by_bare_pulse() {
        let mut agg = aggregator(Arc::new(MemoryPulseStore::new()));
        agg.apply_pulse(RawPulse::new("m1", at(14, 8, 0)).product("X").validate().unwrap());
        agg.apply_pulse(pulse("m1", at(14, 8, 1)));
        assert_eq!(agg.live().get("m1").unwrap().current_product.as_deref(), Some("X"));
    }

    #[test]
    fn test_late_pulse_dropped() {
        let mut agg = aggregator(Arc::new(MemoryPulseStore::new()));
        agg.initialize(day(14), at(14, 0, 5)).unwrap();
        agg.apply_pulse(pulse("m1", at(14, 0, 1)));

        assert_eq!(agg.apply_pulse(pulse("m1", at(13, 23, 59))), PulseOutcome::LateDropped);
        assert_eq!(agg.apply_pulse(pulse("m2", at(13, 23, 58))), PulseOutcome::LateDropped);
        assert_eq!(agg.live().get("m1").unwrap().total_count, 1);
        assert!(agg.live().get("m2").is_none());
    }

    #[test]
    fn test_rollover_reseeds_machine() {
        let next_day = vec![pulse("m1", at(15, 0, 1)), pulse("m1", at(15, 0, 2))];
        let store = Arc::new(MemoryPulseStore::with_pulses(next_day.clone()));
        let mut agg = aggregator(store);
        agg.apply_pulse(RawPulse::new("m1", at(14, 23, 0)).product("X").validate().unwrap());
        agg.apply_pulse(pulse("m1", at(14, 23, 30)));

        assert_eq!(agg.apply_pulse(next_day[1].clone()), PulseOutcome::RolledOver);
        let m1 = agg.live().get("m1").unwrap();
        assert_eq!(m1.day, day(15));
        assert_eq!(m1.total_count, 2);
        assert_eq!(m1.current_product.as_deref(), Some("X"));
        assert_eq!(agg.current_day(), Some(day(15)));

        assert_eq!(agg.apply_pulse(next_day[0].clone()), PulseOutcome::Duplicate);
    }

    #[test]
    fn test_refresh_day() {
        let mut agg = aggregator(Arc::new(MemoryPulseStore::new()));
        agg.initialize(day(14), at(14, 8, 0)).unwrap();
        agg.apply_pulse(pulse("m1", at(14, 8, 0)));

        assert!(!agg.refresh_day(at(14, 23, 59)).unwrap());
        assert!(agg.refresh_day(at(15, 0, 0)).unwrap());

        let m1 = agg.live().get("m1").unwrap();
        assert_eq!(m1.day, day(15));
        assert_eq!(m1.total_count, 0);
        assert_eq!(m1.status, MachineStatus::Offline);
    }

    #[test]
    fn test_refresh_day_carries_machines_left_behind() {
        let mut agg = aggregator(Arc::new(MemoryPulseStore::new()));
        agg.initialize(day(14), at(14, 6, 0)).unwrap();
        for i in 0..50 {
            agg.apply_pulse(pulse("m2", at(14, 8, 0) + chrono::Duration::seconds(i)));
        }
        agg.apply_pulse(pulse("m1", at(14, 23, 0)));

        // m1 crosses midnight before the refresh tick
        assert_eq!(agg.apply_pulse(pulse("m1", at(15, 0, 0))), PulseOutcome::RolledOver);
        assert_eq!(agg.current_day(), Some(day(15)));
        assert_eq!(agg.live().get("m2").unwrap().day, day(14));

        assert!(agg.refresh_day(at(15, 12, 0)).unwrap());
        let m2 = agg.live().get("m2").unwrap();
        assert_eq!(m2.day, day(15));
        assert_eq!(m2.total_count, 0);
        assert_eq!(m2.status, MachineStatus::Offline);
        assert_eq!(agg.live().get("m1").unwrap().total_count, 1);

        assert!(!agg.refresh_day(at(15, 12, 5)).unwrap());
    }

    #[test]
    fn test_carried_machine_reseeded_from_store() {
        let store = Arc::new(MemoryPulseStore::new());
        let mut agg = aggregator(store.clone());
        agg.initialize(day(14), at(14, 6, 0)).unwrap();
        agg.apply_pulse(pulse("m2", at(14, 8, 0)));
        agg.apply_pulse(pulse("m1", at(15, 0, 0)));

        // stored but not yet seen on the feed
        store.append(pulse("m2", at(15, 11, 58))).unwrap();

        assert!(agg.refresh_day(at(15, 12, 0)).unwrap());
        let m2 = agg.live().get("m2").unwrap();
        assert_eq!(m2.day, day(15));
        assert_eq!(m2.total_count, 1);
        assert_eq!(m2.status, MachineStatus::Online);
    }

    #[test]
    fn test_reconcile_corrects_drift() {
        let store = Arc::new(MemoryPulseStore::new());
        let mut agg = aggregator(store.clone());
        agg.initialize(day(14), at(14, 8, 0)).unwrap();

        let p1 = pulse("m1", at(14, 8, 0));
        store.append(p1.clone()).unwrap();
        agg.apply_pulse(p1);
        // missed by the feed
        store.append(pulse("m1", at(14, 8, 1))).unwrap();
        store.append(pulse("m2", at(14, 8, 2))).unwrap();

        let report = agg.reconcile(at(14, 8, 3)).unwrap();
        assert_eq!(report.machines_checked, 2);
        assert_eq!(
            report.drift,
            vec![
                Drift {
                    machine_id: "m1".to_string(),
                    live_total: 1,
                    store_total: 2
                },
                Drift {
                    machine_id: "m2".to_string(),
                    live_total: 0,
                    store_total: 1
                },
            ]
        );
        assert_eq!(agg.live().get("m1").unwrap().total_count, 2);
        assert!(agg.reconcile(at(14, 8, 4)).unwrap().is_clean());
    }

    #[test]
    fn test_handle_feed_event() {
        let store = Arc::new(MemoryPulseStore::new());
        let mut agg = aggregator(store.clone());
        let now = at(14, 8, 0);

        let outcome = agg
            .handle_feed_event(FeedEvent::Pulse(RawPulse::new("m1", now)), now)
            .unwrap();
        assert_eq!(outcome, FeedOutcome::Pulse(PulseOutcome::Applied));

        let outcome = agg
            .handle_feed_event(FeedEvent::Pulse(RawPulse::default()), now)
            .unwrap();
        assert_eq!(outcome, FeedOutcome::Rejected(PulseError::MissingMachineId));

        store.append(pulse("m2", now)).unwrap();
        let outcome = agg.handle_feed_event(FeedEvent::Reconnected, now).unwrap();
        assert_eq!(outcome, FeedOutcome::Reinitialized(2));
        assert_eq!(agg.live().get("m2").unwrap().total_count, 1);
    }

    #[test]
    fn test_deltas_published() {
        let mut agg = aggregator(Arc::new(MemoryPulseStore::new()));
        let all = agg.live().subscribe();
        let m2 = agg.live().subscribe_machine("m2");

        agg.apply_pulse(pulse("m1", at(14, 8, 0)));
        agg.apply_pulse(pulse("m2", at(14, 8, 0)));

        let deltas = all.drain();
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().all(|d| d.cause == DeltaCause::Pulse));
        let only_m2 = m2.drain();
        assert_eq!(only_m2.len(), 1);
        assert_eq!(only_m2[0].state.machine_id, "m2");
    }
}
