// Linepulse Testdata - Shift simulator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Shift simulation.
//!
//! Each machine cycles at its profile's rate with normally distributed
//! jitter, stays silent through its stoppages, feeds its lanes
//! round-robin and picks up product changeovers as they happen.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::events::{random_breakdowns, Changeover, Stoppage, StoppageKind};
use crate::log::{LogMetadata, PulseLog, PulseRow};
use crate::profile::{self, LineScenario, MachineProfile};

/// Shortest cycle the jitter may produce.
const MIN_CYCLE_MS: u64 = 100;

/// Shift generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftConfig {
    /// Shift start.
    pub start: DateTime<Utc>,
    /// Shift length in milliseconds.
    pub duration_ms: u64,
    /// Random seed for reproducibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Give every pulse a sequential id.
    pub assign_ids: bool,
    /// Fraction of pulses delivered twice.
    pub redelivery_rate: f64,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            start: Utc.with_ymd_and_hms(2025, 3, 14, 6, 0, 0).single().unwrap_or_default(),
            duration_ms: 8 * 3_600_000,
            seed: None,
            assign_ids: true,
            redelivery_rate: 0.0,
        }
    }
}

impl ShiftConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set shift start.
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    /// Set shift length in hours.
    pub fn with_duration_hours(mut self, hours: f64) -> Self {
        self.duration_ms = (hours * 3_600_000.0) as u64;
        self
    }

    /// Set shift length in minutes.
    pub fn with_duration_minutes(mut self, minutes: u64) -> Self {
        self.duration_ms = minutes * 60_000;
        self
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Leave ids off so the pulse store assigns them on ingest.
    pub fn without_ids(mut self) -> Self {
        self.assign_ids = false;
        self
    }

    /// Redeliver a fraction of pulses, clamped to `[0, 1]`.
    pub fn with_redelivery_rate(mut self, rate: f64) -> Self {
        self.redelivery_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Shift end.
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::milliseconds(self.duration_ms as i64)
    }
}

/// Builds a pulse log for a set of machines over one shift.
pub struct ShiftSimulator {
    config: ShiftConfig,
    rng: StdRng,
    machines: Vec<MachineProfile>,
    stoppages: Vec<Stoppage>,
    changeovers: Vec<Changeover>,
}

impl ShiftSimulator {
    pub fn new(config: ShiftConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            machines: Vec::new(),
            stoppages: Vec::new(),
            changeovers: Vec::new(),
        }
    }

    pub fn add_machine(&mut self, profile: MachineProfile) -> &mut Self {
        self.machines.push(profile);
        self
    }

    pub fn add_stoppage(&mut self, stoppage: Stoppage) -> &mut Self {
        self.stoppages.push(stoppage);
        self
    }

    pub fn add_changeover(&mut self, changeover: Changeover) -> &mut Self {
        self.changeovers.push(changeover);
        self
    }

    /// Draw random breakdowns for one machine.
    pub fn add_random_breakdowns(
        &mut self,
        machine_id: &str,
        mtbf_minutes: f64,
        mean_repair_minutes: f64,
    ) -> &mut Self {
        let drawn = random_breakdowns(
            &mut self.rng,
            machine_id,
            self.config.duration_ms,
            mtbf_minutes,
            mean_repair_minutes,
        );
        self.stoppages.extend(drawn);
        self
    }

    pub fn config(&self) -> &ShiftConfig {
        &self.config
    }

    /// Simulate the shift.
    pub fn run(&mut self) -> PulseLog {
        let machines = self.machines.clone();
        let mut rows = Vec::new();
        for machine in &machines {
            self.simulate_machine(machine, &mut rows);
        }
        rows.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.machine_id.cmp(&b.machine_id))
        });

        if self.config.assign_ids {
            for (i, row) in rows.iter_mut().enumerate() {
                row.id = Some(i as u64);
            }
        }
        if self.config.redelivery_rate > 0.0 {
            rows = self.redeliver(rows);
        }

        PulseLog {
            rows,
            metadata: LogMetadata {
                name: None,
                seed: self.config.seed,
                stoppages: self.stoppages.clone(),
                changeovers: self.changeovers.clone(),
            },
        }
    }

    fn simulate_machine(&mut self, machine: &MachineProfile, rows: &mut Vec<PulseRow>) {
        let jitter = Normal::new(machine.cycle_time_ms as f64, machine.cycle_jitter_ms.max(0.0)).ok();
        let quantity = (machine.units_per_pulse > 1).then_some(machine.units_per_pulse);
        let mut lane_cursor = 0usize;
        let mut t_ms = 0u64;

        loop {
            let cycle = match &jitter {
                Some(dist) => dist.sample(&mut self.rng).max(MIN_CYCLE_MS as f64) as u64,
                None => machine.cycle_time_ms.max(MIN_CYCLE_MS),
            };
            t_ms += cycle;
            if t_ms >= self.config.duration_ms {
                break;
            }
            if let Some(stop) = self.stoppage_at(&machine.id, t_ms) {
                t_ms = stop.end_offset_ms();
                continue;
            }

            let (lane_id, product_sku) = if machine.lanes.is_empty() {
                let sku = self
                    .changeover_at(&machine.id, None, t_ms)
                    .or_else(|| machine.sku.clone());
                (None, sku)
            } else {
                let lane = &machine.lanes[lane_cursor % machine.lanes.len()];
                lane_cursor += 1;
                let sku = self
                    .changeover_at(&machine.id, Some(&lane.lane_id), t_ms)
                    .unwrap_or_else(|| lane.sku.clone());
                (Some(lane.lane_id.clone()), Some(sku))
            };

            rows.push(PulseRow {
                timestamp: self.config.start + Duration::milliseconds(t_ms as i64),
                machine_id: machine.id.clone(),
                lane_id,
                product_sku,
                quantity,
                id: None,
            });
        }
    }

    fn stoppage_at(&self, machine_id: &str, offset_ms: u64) -> Option<&Stoppage> {
        self.stoppages
            .iter()
            .find(|s| s.machine_id == machine_id && s.covers(offset_ms))
    }

    /// Latest changeover in effect at `offset_ms`.
    fn changeover_at(&self, machine_id: &str, lane_id: Option<&str>, offset_ms: u64) -> Option<String> {
        self.changeovers
            .iter()
            .filter(|c| {
                c.machine_id == machine_id
                    && c.lane_id.as_deref() == lane_id
                    && c.at_offset_ms <= offset_ms
            })
            .max_by_key(|c| c.at_offset_ms)
            .map(|c| c.new_sku.clone())
    }

    /// Repeat some rows a little later in the stream.
    fn redeliver(&mut self, rows: Vec<PulseRow>) -> Vec<PulseRow> {
        let mut out = Vec::with_capacity(rows.len());
        let mut pending: Vec<(usize, PulseRow)> = Vec::new();
        for (i, row) in rows.into_iter().enumerate() {
            if self.rng.gen_bool(self.config.redelivery_rate) {
                pending.push((i + self.rng.gen_range(1..20), row.clone()));
            }
            out.push(row);
            let (due, later): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(at, _)| *at <= i);
            out.extend(due.into_iter().map(|(_, r)| r));
            pending = later;
        }
        out.extend(pending.into_iter().map(|(_, r)| r));
        out
    }
}

/// Generate a preset line scenario.
pub fn generate_scenario(scenario: LineScenario, config: &ShiftConfig) -> PulseLog {
    let mut sim = ShiftSimulator::new(config.clone());
    let shift_minutes = config.duration_ms / 60_000;

    match scenario {
        LineScenario::NormalShift => {
            for machine in profile::press_line() {
                sim.add_machine(machine);
            }
        }
        LineScenario::Breakdown => {
            for machine in profile::press_line() {
                sim.add_machine(machine);
            }
            sim.add_stoppage(Stoppage::new(
                "press-2",
                StoppageKind::Breakdown,
                shift_minutes / 3,
                45u64.min(shift_minutes / 4).max(1),
            ));
        }
        LineScenario::Changeover => {
            sim.add_machine(profile::filler());
            let at = shift_minutes / 2;
            sim.add_stoppage(Stoppage::new("filler-1", StoppageKind::Planned, at, 20u64.min(at).max(1)));
            sim.add_changeover(Changeover::lane("filler-1", "A", at, "JUICE-330"));
        }
        LineScenario::FullLine => {
            for machine in profile::press_line() {
                sim.add_machine(machine);
            }
            sim.add_machine(profile::filler());
            sim.add_machine(profile::packer());
            for machine in ["press-1", "press-2", "filler-1", "packer-1"] {
                sim.add_random_breakdowns(machine, 120.0, 12.0);
            }
            sim.add_stoppage(Stoppage::new(
                "packer-1",
                StoppageKind::Planned,
                shift_minutes / 2,
                30u64.min(shift_minutes / 4).max(1),
            ));
        }
    }

    sim.run().with_name(scenario.name())
}
