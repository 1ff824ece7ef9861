// Linepulse Server - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for line monitoring.
//!
//! Per-machine gauges are refreshed from live-state snapshots; counters are
//! bumped as pulses are ingested and state deltas are observed.

use std::collections::HashMap;

use lazy_static::lazy_static;
use linepulse::{
    DeltaCause, IngestOutcome, MachineId, MachineLiveState, ReconcileReport, StalenessMonitor,
};
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Encoder, Gauge, GaugeVec, TextEncoder,
};

use crate::error::ApiError;

lazy_static! {
    // ============================================================
    // Fleet
    // ============================================================

    /// Machines with live state for the current day.
    pub static ref MACHINES_TOTAL: Gauge = register_gauge!(
        "linepulse_machines_total",
        "Machines tracked for the current local day"
    ).unwrap();

    /// Machines currently online.
    pub static ref MACHINES_ONLINE: Gauge = register_gauge!(
        "linepulse_machines_online",
        "Machines currently online"
    ).unwrap();

    // ============================================================
    // Per machine
    // ============================================================

    /// 1 = online, 0 = offline.
    pub static ref MACHINE_ONLINE: GaugeVec = register_gauge_vec!(
        "linepulse_machine_online",
        "Machine status (1=online, 0=offline)",
        &["machine"]
    ).unwrap();

    /// Units produced today.
    pub static ref MACHINE_OUTPUT_TODAY: GaugeVec = register_gauge_vec!(
        "linepulse_machine_output_today",
        "Units produced on the current local day",
        &["machine"]
    ).unwrap();

    /// Last pulse, Unix seconds.
    pub static ref MACHINE_LAST_SEEN: GaugeVec = register_gauge_vec!(
        "linepulse_machine_last_seen_timestamp_seconds",
        "Timestamp of the latest pulse (Unix seconds)",
        &["machine"]
    ).unwrap();

    // ============================================================
    // Event counters
    // ============================================================

    /// Ingested pulses by outcome (stored, duplicate, rejected).
    pub static ref PULSES_INGESTED_TOTAL: CounterVec = register_counter_vec!(
        "linepulse_pulses_ingested_total",
        "Pulses received on the ingest path",
        &["outcome"]
    ).unwrap();

    /// Live-state deltas by cause.
    pub static ref STATE_DELTAS_TOTAL: CounterVec = register_counter_vec!(
        "linepulse_state_deltas_total",
        "Live-state changes published",
        &["cause"]
    ).unwrap();

    /// Reconcile passes that found drift.
    pub static ref RECONCILE_DRIFT_TOTAL: Counter = register_counter!(
        "linepulse_reconcile_drift_machines_total",
        "Machines corrected by reconcile"
    ).unwrap();

    /// Staleness sweeps run.
    pub static ref STALENESS_SWEEPS: Gauge = register_gauge!(
        "linepulse_staleness_sweeps",
        "Staleness sweeps completed since start"
    ).unwrap();

    // ============================================================
    // Replay
    // ============================================================

    /// Current replay position (row index).
    pub static ref REPLAY_POSITION: Gauge = register_gauge!(
        "linepulse_replay_position",
        "Current replay position (row index)"
    ).unwrap();

    /// Rows in the replayed log.
    pub static ref REPLAY_TOTAL_ROWS: Gauge = register_gauge!(
        "linepulse_replay_total_rows",
        "Rows in the replayed pulse log"
    ).unwrap();

    /// Replay speed multiplier.
    pub static ref REPLAY_SPEED: Gauge = register_gauge!(
        "linepulse_replay_speed",
        "Replay speed multiplier"
    ).unwrap();
}

/// Label for an ingest result.
pub fn ingest_label(outcome: &IngestOutcome) -> &'static str {
    match outcome {
        IngestOutcome::Stored(_) => "stored",
        IngestOutcome::Duplicate(_) => "duplicate",
    }
}

/// Label for a delta cause.
pub fn cause_label(cause: DeltaCause) -> &'static str {
    match cause {
        DeltaCause::Pulse => "pulse",
        DeltaCause::WentOffline => "went_offline",
        DeltaCause::Reseeded => "reseeded",
        DeltaCause::DayRollover => "day_rollover",
        DeltaCause::Reconciled => "reconciled",
    }
}

/// Refresh fleet and per-machine gauges from a live-state snapshot.
pub fn update_live_metrics(snapshot: &HashMap<MachineId, MachineLiveState>) {
    let online = snapshot.values().filter(|s| s.status.is_online()).count();
    MACHINES_TOTAL.set(snapshot.len() as f64);
    MACHINES_ONLINE.set(online as f64);

    for (machine, state) in snapshot {
        let labels = [machine.as_str()];
        MACHINE_ONLINE
            .with_label_values(&labels)
            .set(if state.status.is_online() { 1.0 } else { 0.0 });
        MACHINE_OUTPUT_TODAY
            .with_label_values(&labels)
            .set(state.total_count as f64);
        MACHINE_LAST_SEEN
            .with_label_values(&labels)
            .set(state.last_seen.timestamp_millis() as f64 / 1000.0);
    }
}

/// Count one ingest call.
pub fn record_ingest(outcome: &str) {
    PULSES_INGESTED_TOTAL.with_label_values(&[outcome]).inc();
}

/// Count one live-state delta.
pub fn record_delta(cause: DeltaCause) {
    STATE_DELTAS_TOTAL
        .with_label_values(&[cause_label(cause)])
        .inc();
}

/// Count machines a reconcile pass corrected.
pub fn record_reconcile(report: &ReconcileReport) {
    RECONCILE_DRIFT_TOTAL.inc_by(report.drift.len() as f64);
}

/// Mirror the monitor's sweep counter.
pub fn update_sweep_metrics(monitor: &StalenessMonitor) {
    STALENESS_SWEEPS.set(monitor.sweep_count() as f64);
}

/// Update replay position metrics.
pub fn update_replay_metrics(position: usize, total: usize, speed: f64) {
    REPLAY_POSITION.set(position as f64);
    REPLAY_TOTAL_ROWS.set(total as f64);
    REPLAY_SPEED.set(speed);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> Result<String, ApiError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::Metrics(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| ApiError::Metrics(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use linepulse::MachineStatus;

    fn state(machine: &str, status: MachineStatus, total: u64) -> MachineLiveState {
        MachineLiveState {
            machine_id: machine.into(),
            day: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            total_count: total,
            last_seen: Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap(),
            status,
            current_product: None,
            lane_products: Default::default(),
        }
    }

    #[test]
    fn test_cause_labels() {
        assert_eq!(cause_label(DeltaCause::WentOffline), "went_offline");
        assert_eq!(cause_label(DeltaCause::DayRollover), "day_rollover");
    }

    #[test]
    fn test_live_gauges() {
        let mut snapshot = HashMap::new();
        snapshot.insert("metrics-a".to_string(), state("metrics-a", MachineStatus::Online, 12));
        snapshot.insert("metrics-b".to_string(), state("metrics-b", MachineStatus::Offline, 3));
        update_live_metrics(&snapshot);

        assert_eq!(MACHINE_OUTPUT_TODAY.with_label_values(&["metrics-a"]).get(), 12.0);
        assert_eq!(MACHINE_ONLINE.with_label_values(&["metrics-b"]).get(), 0.0);
    }

    #[test]
    fn test_encode_metrics() {
        record_ingest("stored");
        record_delta(DeltaCause::Pulse);
        MACHINES_TOTAL.set(1.0);

        let output = encode_metrics().unwrap();
        assert!(output.contains("linepulse_pulses_ingested_total"));
        assert!(output.contains("linepulse_state_deltas_total"));
        assert!(output.contains("linepulse_machines_total"));
    }
}
