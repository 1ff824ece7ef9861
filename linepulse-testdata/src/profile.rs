// Linepulse Testdata - Machine profiles
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Machine profiles and preset production lines.
//!
//! A profile describes how a machine produces when it runs: its nominal
//! cycle time, how much that cycle wanders, how many units one pulse
//! reports, and which lanes (with their starting products) it has.

use serde::{Deserialize, Serialize};

/// One lane and the product it starts the shift with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneProfile {
    pub lane_id: String,
    pub sku: String,
}

/// How a simulated machine produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineProfile {
    /// Machine identifier.
    pub id: String,
    /// Nominal time between pulses in milliseconds.
    pub cycle_time_ms: u64,
    /// Standard deviation of the cycle time in milliseconds.
    pub cycle_jitter_ms: f64,
    /// Units reported per pulse (1 = quantity omitted).
    pub units_per_pulse: u32,
    /// Lanes fed round-robin; empty for a machine that reports no lanes.
    #[serde(default)]
    pub lanes: Vec<LaneProfile>,
    /// Product reported by a machine without lanes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

impl MachineProfile {
    /// Create a profile with a fixed cycle time in seconds.
    pub fn new(id: &str, cycle_time_secs: f64) -> Self {
        Self {
            id: id.to_string(),
            cycle_time_ms: (cycle_time_secs * 1000.0).round() as u64,
            cycle_jitter_ms: 0.0,
            units_per_pulse: 1,
            lanes: Vec::new(),
            sku: None,
        }
    }

    /// Add cycle-time jitter (standard deviation, seconds).
    pub fn with_jitter_secs(mut self, std_secs: f64) -> Self {
        self.cycle_jitter_ms = std_secs * 1000.0;
        self
    }

    /// Report several units per pulse.
    pub fn with_units_per_pulse(mut self, units: u32) -> Self {
        self.units_per_pulse = units.max(1);
        self
    }

    /// Add a lane running `sku`.
    pub fn with_lane(mut self, lane_id: &str, sku: &str) -> Self {
        self.lanes.push(LaneProfile {
            lane_id: lane_id.to_string(),
            sku: sku.to_string(),
        });
        self
    }

    /// Product for a machine without lanes.
    pub fn with_sku(mut self, sku: &str) -> Self {
        self.sku = Some(sku.to_string());
        self
    }

    /// Nominal pulses per hour when running.
    pub fn nominal_rate_per_hour(&self) -> f64 {
        if self.cycle_time_ms == 0 {
            return 0.0;
        }
        3_600_000.0 / self.cycle_time_ms as f64
    }
}

/// Preset production lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineScenario {
    /// Steady shift, no stoppages.
    NormalShift,
    /// Press line with a mid-shift breakdown on one press.
    Breakdown,
    /// Two-lane filler switching lane A to a new product mid-shift.
    Changeover,
    /// Whole line: presses, a filler and a packer, with random breakdowns.
    FullLine,
}

impl LineScenario {
    pub fn name(&self) -> &'static str {
        match self {
            LineScenario::NormalShift => "normal_shift",
            LineScenario::Breakdown => "breakdown",
            LineScenario::Changeover => "changeover",
            LineScenario::FullLine => "full_line",
        }
    }
}

/// Machines of the press line.
pub fn press_line() -> Vec<MachineProfile> {
    vec![
        MachineProfile::new("press-1", 12.0)
            .with_jitter_secs(1.5)
            .with_sku("BRKT-100"),
        MachineProfile::new("press-2", 15.0)
            .with_jitter_secs(2.0)
            .with_sku("BRKT-220"),
    ]
}

/// Two-lane bottle filler.
pub fn filler() -> MachineProfile {
    MachineProfile::new("filler-1", 6.0)
        .with_jitter_secs(0.5)
        .with_lane("A", "WATER-500")
        .with_lane("B", "WATER-1500")
}

/// Case packer reporting six units per pulse.
pub fn packer() -> MachineProfile {
    MachineProfile::new("packer-1", 30.0)
        .with_jitter_secs(4.0)
        .with_units_per_pulse(6)
        .with_sku("CASE-6")
}
