// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Staleness monitor
//!
//! Machines report nothing when they stop; a silent machine is only known
//! to be down because its last pulse keeps getting older. The monitor
//! sweeps the live state on a fixed interval and demotes every Online
//! machine whose silence has reached the staleness timeout. It never
//! promotes: a machine comes back Online only through a new pulse.
//!
//! Offline detection latency is bounded by `timeout + check_interval`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::clock::Clock;
use crate::config::LinepulseConfig;
use crate::live::LiveStateStore;
use crate::pulse::MachineId;

/// Whether a machine last seen at `last_seen` is stale at `now`
pub fn is_stale(last_seen: DateTime<Utc>, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
    now - last_seen >= timeout
}

/// Periodic Online -> Offline demotion
#[derive(Clone)]
pub struct StalenessMonitor {
    live: Arc<LiveStateStore>,
    clock: Arc<dyn Clock>,
    timeout: chrono::Duration,
    interval: Duration,
    sweeps: Arc<AtomicU64>,
}

impl std::fmt::Debug for StalenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StalenessMonitor")
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .field("sweeps", &self.sweep_count())
            .finish()
    }
}

impl StalenessMonitor {
    pub fn new(
        live: Arc<LiveStateStore>,
        clock: Arc<dyn Clock>,
        timeout: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            live,
            clock,
            timeout,
            interval,
            sweeps: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Monitor using the configured timeout and interval
    pub fn from_config(live: Arc<LiveStateStore>, clock: Arc<dyn Clock>, config: &LinepulseConfig) -> Self {
        Self::new(live, clock, config.staleness_timeout(), config.check_interval())
    }

    pub fn timeout(&self) -> chrono::Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweeps run so far, across clones
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Sweep at the clock's current time
    pub fn sweep(&self) -> Vec<MachineId> {
        self.sweep_at(self.clock.now())
    }

    /// Demote every Online machine stale at `now`; returns the demoted ids
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<MachineId> {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        let demoted = self.live.demote_stale(now, self.timeout);
        for machine_id in &demoted {
            warn!("Machine {} went offline (silent for >= {}s)", machine_id, self.timeout.num_seconds());
        }
        demoted
    }

    /// Sweep on a background thread every `interval` until stopped
    pub fn spawn(self) -> std::io::Result<MonitorHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.interval;

        let join = std::thread::Builder::new()
            .name("linepulse-staleness".to_string())
            .spawn(move || {
                info!("Staleness monitor started, interval {:?}", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let demoted = self.sweep();
                            debug!("Staleness sweep demoted {} machines", demoted.len());
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Staleness monitor stopped");
            })?;

        Ok(MonitorHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }
}

/// Running background monitor; stops the thread on `stop()` or drop
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Staleness monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
