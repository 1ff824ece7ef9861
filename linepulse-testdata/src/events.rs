// Linepulse Testdata - Stoppages and changeovers
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Events injected into a simulated shift.
//!
//! A [`Stoppage`] silences one machine for a while, which is what the gap
//! analyzer and the staleness monitor are expected to notice. A
//! [`Changeover`] switches the product on one lane.

use rand::prelude::*;
use rand_distr::Exp;
use serde::{Deserialize, Serialize};

/// Why a machine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppageKind {
    /// Scheduled break or maintenance.
    Planned,
    /// Unplanned failure.
    Breakdown,
    /// Short jam cleared by the operator.
    MicroStop,
}

/// Machine produces nothing during `[start_offset_ms, start_offset_ms + duration_ms)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stoppage {
    pub machine_id: String,
    pub kind: StoppageKind,
    /// Offset from shift start.
    pub start_offset_ms: u64,
    pub duration_ms: u64,
}

impl Stoppage {
    /// Create a stoppage, times in minutes from shift start.
    pub fn new(machine_id: &str, kind: StoppageKind, start_minute: u64, minutes: u64) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            kind,
            start_offset_ms: start_minute * 60_000,
            duration_ms: minutes * 60_000,
        }
    }

    /// End offset (exclusive).
    pub fn end_offset_ms(&self) -> u64 {
        self.start_offset_ms + self.duration_ms
    }

    /// Whether the stoppage covers `offset_ms`.
    pub fn covers(&self, offset_ms: u64) -> bool {
        offset_ms >= self.start_offset_ms && offset_ms < self.end_offset_ms()
    }
}

/// Lane switches to `new_sku` at `at_offset_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeover {
    pub machine_id: String,
    pub lane_id: Option<String>,
    pub at_offset_ms: u64,
    pub new_sku: String,
}

impl Changeover {
    /// Changeover of a lane at a minute offset.
    pub fn lane(machine_id: &str, lane_id: &str, at_minute: u64, new_sku: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            lane_id: Some(lane_id.to_string()),
            at_offset_ms: at_minute * 60_000,
            new_sku: new_sku.to_string(),
        }
    }

    /// Changeover of a machine without lanes.
    pub fn machine(machine_id: &str, at_minute: u64, new_sku: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            lane_id: None,
            at_offset_ms: at_minute * 60_000,
            new_sku: new_sku.to_string(),
        }
    }
}

/// Draw random breakdowns for one machine as a Poisson process.
///
/// Time between failures is exponential with mean `mtbf_minutes`; repair
/// time is exponential with mean `mean_repair_minutes`, at least one minute.
pub fn random_breakdowns<R: Rng + ?Sized>(
    rng: &mut R,
    machine_id: &str,
    shift_ms: u64,
    mtbf_minutes: f64,
    mean_repair_minutes: f64,
) -> Vec<Stoppage> {
    let (Ok(between), Ok(repair)) = (
        Exp::new(1.0 / mtbf_minutes.max(f64::MIN_POSITIVE)),
        Exp::new(1.0 / mean_repair_minutes.max(f64::MIN_POSITIVE)),
    ) else {
        return Vec::new();
    };

    let mut stoppages = Vec::new();
    let mut t_ms = 0u64;
    loop {
        let wait_ms = (between.sample(rng) * 60_000.0) as u64;
        t_ms = t_ms.saturating_add(wait_ms);
        if t_ms >= shift_ms {
            break;
        }
        let repair_ms = ((repair.sample(rng) * 60_000.0) as u64).max(60_000);
        stoppages.push(Stoppage {
            machine_id: machine_id.to_string(),
            kind: StoppageKind::Breakdown,
            start_offset_ms: t_ms,
            duration_ms: repair_ms,
        });
        t_ms = t_ms.saturating_add(repair_ms);
    }
    stoppages
}
