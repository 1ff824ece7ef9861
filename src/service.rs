// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry facade
//!
//! [`Telemetry`] wires the stores, the pulse feed, the aggregator, the
//! assignment tracker and the analyzer together, and is the query surface
//! consumers use. Pulses enter through [`Telemetry::ingest`], which stores
//! them and announces them on the feed; the feed is consumed by
//! [`Telemetry::pump_feed`] or [`Telemetry::run_feed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDate;
use log::{info, warn};

use crate::aggregator::{FeedOutcome, ReconcileReport, TelemetryAggregator};
use crate::analyzer::{DailyRuntimeSummary, GapAnalyzer};
use crate::assignments::{AssignmentChange, AssignmentTracker, ProductView};
use crate::clock::{Clock, DayCalendar};
use crate::config::LinepulseConfig;
use crate::error::Result;
use crate::feed::{Broadcaster, FeedEvent, RecvError, Subscription};
use crate::live::{LiveStateStore, MachineLiveState, StateDelta};
use crate::monitor::StalenessMonitor;
use crate::pulse::{ActiveAssignment, LaneAssignment, MachineId, Pulse, RawPulse};
use crate::store::{AssignmentStore, MemoryAssignmentStore, MemoryPulseStore, PulseStore};

/// Result of ingesting one raw pulse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and announced on the feed
    Stored(Pulse),
    /// Same pulse id already stored; nothing announced
    Duplicate(Pulse),
}

/// Query and ingest surface over the whole pipeline
pub struct Telemetry {
    config: LinepulseConfig,
    calendar: DayCalendar,
    clock: Arc<dyn Clock>,
    pulses: Arc<dyn PulseStore>,
    aggregator: Mutex<TelemetryAggregator>,
    live: Arc<LiveStateStore>,
    tracker: AssignmentTracker,
    analyzer: GapAnalyzer,
    feed: Broadcaster<FeedEvent>,
    feed_sub: Mutex<Subscription<FeedEvent>>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("config", &self.config)
            .field("machines", &self.live.len())
            .field("stored_pulses", &self.pulses.len())
            .finish()
    }
}

impl Telemetry {
    /// Build the pipeline over the given stores
    pub fn new(
        config: LinepulseConfig,
        pulses: Arc<dyn PulseStore>,
        assignments: Arc<dyn AssignmentStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let aggregator = TelemetryAggregator::from_config(pulses.clone(), &config)?;
        let calendar = *aggregator.calendar();
        let live = aggregator.live().clone();
        let feed = Broadcaster::new();
        let feed_sub = feed.subscribe();

        Ok(Self {
            analyzer: GapAnalyzer::new(calendar, config.gap_threshold_minutes),
            config,
            calendar,
            clock,
            pulses,
            aggregator: Mutex::new(aggregator),
            live,
            tracker: AssignmentTracker::new(assignments),
            feed,
            feed_sub: Mutex::new(feed_sub),
        })
    }

    /// Pipeline over empty in-memory stores
    pub fn in_memory(config: LinepulseConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(
            config,
            Arc::new(MemoryPulseStore::new()),
            Arc::new(MemoryAssignmentStore::new()),
            clock,
        )
    }

    /// Load assignments and initialise live state for today
    pub fn start(&self) -> Result<usize> {
        self.tracker.load()?;
        let now = self.clock.now();
        let machines = self.aggregator().initialize(self.calendar.day_of(now), now)?;
        info!("Telemetry started with {} machines", machines);
        Ok(machines)
    }

    pub fn config(&self) -> &LinepulseConfig {
        &self.config
    }

    pub fn calendar(&self) -> &DayCalendar {
        &self.calendar
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn pulse_store(&self) -> &Arc<dyn PulseStore> {
        &self.pulses
    }

    /// Local day at the clock's current time
    pub fn today(&self) -> NaiveDate {
        self.calendar.day_of(self.clock.now())
    }

    // ---- ingest & feed ----

    /// Validate, store and announce a pulse. A record without an id gets a
    /// fresh one from the pulse store; only records carrying an id can be
    /// recognised as redeliveries.
    pub fn ingest(&self, raw: RawPulse) -> Result<IngestOutcome> {
        let raw = match raw.id {
            Some(_) => raw,
            None => raw.id(self.pulses.next_id()?.0),
        };
        let pulse = raw.validate()?;
        if !self.pulses.append(pulse.clone())? {
            return Ok(IngestOutcome::Duplicate(pulse));
        }
        self.feed.publish(FeedEvent::Pulse(pulse.clone().into()));
        Ok(IngestOutcome::Stored(pulse))
    }

    /// Announce that the feed session was re-established
    pub fn feed_reconnected(&self) {
        self.feed.publish(FeedEvent::Reconnected);
    }

    /// Raw access to the pulse feed
    pub fn feed(&self) -> &Broadcaster<FeedEvent> {
        &self.feed
    }

    /// Apply one feed event now
    pub fn handle_feed_event(&self, event: FeedEvent) -> Result<FeedOutcome> {
        let now = self.clock.now();
        self.aggregator().handle_feed_event(event, now)
    }

    /// Apply every queued feed event. Returns how many were handled.
    pub fn pump_feed(&self) -> Result<usize> {
        let events = self.feed_subscription().drain();
        let count = events.len();
        for event in events {
            self.handle_feed_event(event)?;
        }
        Ok(count)
    }

    /// Consume the feed until `stop` is set
    pub fn run_feed(&self, stop: &AtomicBool, poll: Duration) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            let next = self.feed_subscription().recv_timeout(poll);
            match next {
                Ok(event) => {
                    if let Err(e) = self.handle_feed_event(event) {
                        warn!("Feed event failed: {}", e);
                    }
                }
                Err(RecvError::Timeout) => {}
                Err(RecvError::Closed) => break,
            }
        }
        Ok(())
    }

    // ---- periodic maintenance ----

    /// Staleness monitor over this pipeline's live state
    pub fn monitor(&self) -> StalenessMonitor {
        StalenessMonitor::from_config(self.live.clone(), self.clock.clone(), &self.config)
    }

    /// Re-initialise if the local day has changed
    pub fn refresh_day(&self) -> Result<bool> {
        let now = self.clock.now();
        self.aggregator().refresh_day(now)
    }

    /// Full recompute against the store
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let now = self.clock.now();
        self.aggregator().reconcile(now)
    }

    // ---- queries ----

    /// Live state of every machine
    pub fn live_state(&self) -> HashMap<MachineId, MachineLiveState> {
        self.live.snapshot()
    }

    pub fn machine_state(&self, machine_id: &str) -> Option<MachineLiveState> {
        self.live.get(machine_id)
    }

    pub fn online_count(&self) -> usize {
        self.live.online_count()
    }

    /// Deltas for every machine
    pub fn subscribe_live_state(&self) -> Subscription<StateDelta> {
        self.live.subscribe()
    }

    /// Deltas for one machine
    pub fn subscribe_machine_state(&self, machine_id: &str) -> Subscription<StateDelta> {
        self.live.subscribe_machine(machine_id)
    }

    /// Runtime and downtime for a day, one machine or the fleet
    pub fn daily_summary(
        &self,
        date: NaiveDate,
        machine_id: Option<&str>,
    ) -> Result<DailyRuntimeSummary> {
        self.analyzer.daily_summary(self.pulses.as_ref(), date, machine_id)
    }

    pub fn active_assignments(&self, machine_id: &str) -> Vec<LaneAssignment> {
        self.tracker.assignments(machine_id)
    }

    pub fn all_assignments(&self) -> Vec<ActiveAssignment> {
        self.tracker.all()
    }

    pub fn subscribe_assignments(&self, machine_id: &str) -> Subscription<AssignmentChange> {
        self.tracker.subscribe(machine_id)
    }

    pub fn assign(&self, assignment: ActiveAssignment) -> Result<()> {
        self.tracker.assign(assignment)
    }

    pub fn clear_assignment(&self, machine_id: &str, lane_id: &str) -> Result<bool> {
        self.tracker.clear(machine_id, lane_id)
    }

    /// Reload assignments from their store
    pub fn reload_assignments(&self) -> Result<usize> {
        self.tracker.load()
    }

    /// Products to display for a machine
    pub fn product_view(&self, machine_id: &str) -> ProductView {
        let live = self.live.get(machine_id);
        self.tracker.resolve(machine_id, live.as_ref())
    }

    fn aggregator(&self) -> MutexGuard<'_, TelemetryAggregator> {
        self.aggregator.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn feed_subscription(&self) -> MutexGuard<'_, Subscription<FeedEvent>> {
        self.feed_sub.lock().unwrap_or_else(|e| e.into_inner())
    }
}
