// Linepulse Server - Pulse log replay engine
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Replays a recorded or simulated pulse log into the ingest path.
//!
//! Timestamps are rebased onto the service clock so that a log recorded
//! on another day lands in today's live state, and the spacing between
//! pulses is divided by the replay speed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use linepulse::{RawPulse, Telemetry};
use linepulse_testdata::{PulseLog, PulseRow};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::metrics::{ingest_label, record_ingest, update_replay_metrics};

/// Configuration for log replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Replay speed multiplier (1.0 = real-time, 10.0 = 10x faster).
    pub speed: f64,
    /// Whether to loop the log.
    pub loop_replay: bool,
    /// Shift timestamps so the first row lands at the clock's current time.
    pub rebase: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_replay: true,
            rebase: true,
        }
    }
}

/// State of the replay engine.
#[derive(Debug, Default)]
pub struct ReplayState {
    /// Next row to replay.
    pub position: AtomicUsize,
    /// Rows in the log.
    pub total_rows: AtomicUsize,
    /// Completed passes over the log.
    pub loops: AtomicU64,
    pub running: AtomicBool,
    pub paused: AtomicBool,
    pub stored: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected: AtomicU64,
}

impl ReplayState {
    /// Stop the replay loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Pause/resume the replay.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

/// Summary of the loaded log.
#[derive(Debug, Clone)]
pub struct LogInfo {
    pub row_count: usize,
    pub machine_count: usize,
    pub duration_ms: u64,
    pub machines: Vec<String>,
}

/// Feeds a pulse log into [`Telemetry::ingest`].
pub struct ReplayEngine {
    config: ReplayConfig,
    state: Arc<ReplayState>,
    log: PulseLog,
    /// Added to row ids on each loop so replays are not taken for redeliveries.
    id_span: u64,
}

impl ReplayEngine {
    /// Load a pulse log CSV.
    pub fn from_csv(path: impl AsRef<Path>, config: ReplayConfig) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ReplayError::FileNotFound(path.display().to_string()));
        }
        let rows = Self::parse_csv(path)?;
        Self::from_log(PulseLog::new(rows), config)
    }

    /// Replay an in-memory log, e.g. a freshly simulated shift.
    pub fn from_log(mut log: PulseLog, config: ReplayConfig) -> Result<Self, ReplayError> {
        if log.is_empty() {
            return Err(ReplayError::EmptyLog);
        }
        if !(config.speed > 0.0) {
            return Err(ReplayError::InvalidSpeed(config.speed));
        }
        log.rows.sort_by_key(|r| r.timestamp);

        let id_span = log
            .rows
            .iter()
            .filter_map(|r| r.id)
            .max()
            .map_or(0, |max| max + 1);

        let state = Arc::new(ReplayState::default());
        state.total_rows.store(log.len(), Ordering::SeqCst);

        info!(
            "Loaded pulse log: {} machines, {} rows",
            log.machines().len(),
            log.len()
        );

        Ok(Self {
            config,
            state,
            log,
            id_span,
        })
    }

    /// Parse a CSV file into rows.
    fn parse_csv(path: &Path) -> Result<Vec<PulseRow>, ReplayError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

        let headers = reader.headers()?.clone();
        if !headers.iter().any(|h| h == "timestamp") || !headers.iter().any(|h| h == "machine_id") {
            return Err(ReplayError::InvalidFormat(
                "Columns 'timestamp' and 'machine_id' are required".to_string(),
            ));
        }

        let mut rows = Vec::new();
        for result in reader.deserialize::<PulseRow>() {
            rows.push(result?);
        }
        Ok(rows)
    }

    /// Get the replay state.
    pub fn state(&self) -> Arc<ReplayState> {
        Arc::clone(&self.state)
    }

    /// Start the replay loop (runs until stopped or, without looping, until the end).
    pub async fn run(&self, telemetry: Arc<Telemetry>) {
        self.state.running.store(true, Ordering::SeqCst);
        info!(
            "Starting replay: speed={}, loop={}, rebase={}",
            self.config.speed, self.config.loop_replay, self.config.rebase
        );

        let rows = &self.log.rows;
        let mut origin = telemetry.clock().now();

        loop {
            if !self.state.running.load(Ordering::SeqCst) {
                break;
            }
            if self.state.paused.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(100)).await;
                continue;
            }

            let position = self.state.position.load(Ordering::SeqCst);
            if position >= rows.len() {
                if self.config.loop_replay {
                    info!("Pulse log complete, looping...");
                    self.state.loops.fetch_add(1, Ordering::SeqCst);
                    self.state.position.store(0, Ordering::SeqCst);
                    origin = telemetry.clock().now();
                    continue;
                } else {
                    info!("Pulse log complete, stopping");
                    self.state.running.store(false, Ordering::SeqCst);
                    break;
                }
            }

            let row = &rows[position];
            let cycle = self.state.loops.load(Ordering::SeqCst);
            self.ingest(&telemetry, self.prepare(row, origin, cycle));

            self.state.position.fetch_add(1, Ordering::SeqCst);
            update_replay_metrics(position + 1, rows.len(), self.config.speed);

            let base_interval_ms = match rows.get(position + 1) {
                Some(next) => (next.timestamp - row.timestamp).num_milliseconds().max(0) as u64,
                None => 0,
            };
            let sleep_ms = (base_interval_ms as f64 / self.config.speed) as u64;
            if sleep_ms > 0 {
                sleep(Duration::from_millis(sleep_ms)).await;
            }
        }
    }

    /// Raw pulse for `row` on pass `cycle`, with rebasing applied.
    pub(crate) fn prepare(&self, row: &PulseRow, origin: DateTime<Utc>, cycle: u64) -> RawPulse {
        let mut raw = row.to_raw();
        if self.config.rebase {
            let first = self.log.rows[0].timestamp;
            let offset_ms = (row.timestamp - first).num_milliseconds() as f64 / self.config.speed;
            raw.timestamp = Some(origin + chrono::Duration::milliseconds(offset_ms as i64));
        }
        raw.id = row.id.map(|id| id + cycle * self.id_span);
        raw
    }

    fn ingest(&self, telemetry: &Telemetry, raw: RawPulse) {
        match telemetry.ingest(raw) {
            Ok(outcome) => {
                let label = ingest_label(&outcome);
                debug!("Replayed pulse: {}", label);
                record_ingest(label);
                let counter = match label {
                    "stored" => &self.state.stored,
                    _ => &self.state.duplicates,
                };
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!("Replayed pulse rejected: {}", e);
                record_ingest("rejected");
                self.state.rejected.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Get log info.
    pub fn log_info(&self) -> LogInfo {
        let duration_ms = match (self.log.rows.first(), self.log.rows.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_milliseconds() as u64,
            _ => 0,
        };
        let machines = self.log.machines();

        LogInfo {
            row_count: self.log.len(),
            machine_count: machines.len(),
            duration_ms,
            machines,
        }
    }
}

/// Replay errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Replay speed must be positive, got {0}")]
    InvalidSpeed(f64),

    #[error("Empty pulse log")]
    EmptyLog,
}
