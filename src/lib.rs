// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Linepulse - Production-line telemetry
//!
//! Turns a stream of production pulses (one per completed unit, or N units)
//! into live per-machine state and per-day downtime analysis.
//!
//! ## Key Features
//!
//! - **Live output**: daily unit totals per machine, updated per pulse
//! - **Silence detection**: machines go Offline when their pulses stop
//! - **Lane assignments**: operator product bindings with change fan-out
//! - **Gap analysis**: runtime and downtime gaps for any past day
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use linepulse::{LinepulseConfig, ManualClock, RawPulse, Telemetry};
//!
//! let now = Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap();
//! let clock = Arc::new(ManualClock::new(now));
//! let telemetry = Telemetry::in_memory(LinepulseConfig::default(), clock).unwrap();
//! telemetry.start().unwrap();
//!
//! telemetry.ingest(RawPulse::new("press-1", now).quantity(4)).unwrap();
//! telemetry.pump_feed().unwrap();
//!
//! let state = telemetry.machine_state("press-1").unwrap();
//! assert_eq!(state.total_count, 4);
//! ```
//!
//! ## Modules
//!
//! - [`pulse`]: Pulse and assignment records
//! - [`store`]: Pulse and assignment store contracts, in-memory stores
//! - [`journal`]: File-backed pulse store
//! - [`feed`]: In-process publish/subscribe
//! - [`live`]: Live machine state and deltas
//! - [`aggregator`]: Incremental per-day aggregation
//! - [`monitor`]: Staleness sweeps
//! - [`assignments`]: Lane assignment tracking
//! - [`analyzer`]: Downtime gaps and runtime
//! - [`service`]: Facade over the whole pipeline

// Modules
pub mod aggregator;
pub mod analyzer;
pub mod assignments;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod journal;
pub mod live;
pub mod monitor;
pub mod pulse;
pub mod service;
pub mod store;

// Re-exports for convenient access
pub use aggregator::{Drift, FeedOutcome, PulseOutcome, ReconcileReport, TelemetryAggregator};
pub use analyzer::{analyze, daily_summary, DailyRuntimeSummary, DowntimeGap, GapAnalyzer};
pub use assignments::{
    AssignmentChange, AssignmentTracker, ProductConflict, ProductSource, ProductView,
};
pub use clock::{Clock, DayCalendar, DayWindow, ManualClock, SystemClock};
pub use config::LinepulseConfig;
pub use error::{ConfigError, LinepulseError, PulseError, Result, StoreError};
pub use feed::{Broadcaster, FeedEvent, RecvError, Subscription};
pub use journal::{JournalPulseStore, RecoveryStats};
pub use live::{DeltaCause, LiveStateStore, MachineLiveState, MachineStatus, StateDelta};
pub use monitor::{is_stale, MonitorHandle, StalenessMonitor};
pub use pulse::{
    ActiveAssignment, LaneAssignment, LaneId, MachineId, Pulse, PulseId, RawPulse, Sku,
};
pub use service::{IngestOutcome, Telemetry};
pub use store::{AssignmentStore, MemoryAssignmentStore, MemoryPulseStore, PulseStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
