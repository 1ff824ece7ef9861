// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Downtime and gap analysis
//!
//! Retrospective, stateless view of one local day: total output, runtime
//! between the first and last pulse, and every silence between adjacent
//! pulses longer than the gap threshold. The result depends only on the set
//! of pulses, never on the order they were read in.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::clock::DayCalendar;
use crate::error::Result;
use crate::pulse::{MachineId, Pulse};
use crate::store::PulseStore;

const MS_PER_MINUTE: f64 = 60_000.0;

/// Silence between two adjacent pulses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowntimeGap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_minutes: u32,
}

/// Output and downtime for one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRuntimeSummary {
    pub date: NaiveDate,
    /// `None` when summarising the whole fleet
    pub machine_id: Option<MachineId>,
    pub total_output: u64,
    pub pulse_count: usize,
    /// Minutes between the first and last pulse
    pub runtime_minutes: u32,
    pub gaps: Vec<DowntimeGap>,
    /// False when the day has no pulses at all
    pub has_data: bool,
}

impl DailyRuntimeSummary {
    /// Sum of gap durations
    pub fn downtime_minutes(&self) -> u32 {
        self.gaps.iter().map(|g| g.duration_minutes).sum()
    }

    pub fn longest_gap(&self) -> Option<&DowntimeGap> {
        self.gaps.iter().max_by_key(|g| g.duration_minutes)
    }

    /// Share of the runtime not spent in gaps; `None` without runtime
    pub fn uptime_ratio(&self) -> Option<f64> {
        if self.runtime_minutes == 0 {
            return None;
        }
        let runtime = self.runtime_minutes as f64;
        let downtime = self.downtime_minutes().min(self.runtime_minutes) as f64;
        Some((runtime - downtime) / runtime)
    }
}

fn minutes_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u32 {
    ((end - start).num_milliseconds() as f64 / MS_PER_MINUTE).round() as u32
}

/// Analyze the pulses of one day. Order and repeated ids do not matter.
pub fn analyze(date: NaiveDate, pulses: &[Pulse], gap_threshold_minutes: u32) -> DailyRuntimeSummary {
    let mut sorted: Vec<&Pulse> = pulses.iter().collect();
    sorted.sort_by(|a, b| {
        (a.timestamp, a.id, a.units()).cmp(&(b.timestamp, b.id, b.units()))
    });
    let mut seen = HashSet::with_capacity(sorted.len());
    sorted.retain(|p| seen.insert(p.id));

    let total_output = sorted.iter().map(|p| p.units()).sum();
    let mut summary = DailyRuntimeSummary {
        date,
        machine_id: None,
        total_output,
        pulse_count: sorted.len(),
        runtime_minutes: 0,
        gaps: Vec::new(),
        has_data: !sorted.is_empty(),
    };
    if sorted.len() < 2 {
        return summary;
    }

    let first = sorted[0].timestamp;
    let last = sorted[sorted.len() - 1].timestamp;
    summary.runtime_minutes = minutes_between(first, last);

    let threshold_ms = gap_threshold_minutes as i64 * 60_000;
    for pair in sorted.windows(2) {
        let (prev, cur) = (pair[0].timestamp, pair[1].timestamp);
        if (cur - prev).num_milliseconds() > threshold_ms {
            summary.gaps.push(DowntimeGap {
                start: prev,
                end: cur,
                duration_minutes: minutes_between(prev, cur),
            });
        }
    }
    summary
}

/// Stateless analyzer bound to a store, calendar and threshold
#[derive(Clone, Copy, Debug)]
pub struct GapAnalyzer {
    calendar: DayCalendar,
    gap_threshold_minutes: u32,
}

impl GapAnalyzer {
    pub fn new(calendar: DayCalendar, gap_threshold_minutes: u32) -> Self {
        Self {
            calendar,
            gap_threshold_minutes,
        }
    }

    pub fn gap_threshold_minutes(&self) -> u32 {
        self.gap_threshold_minutes
    }

    /// Analyze pulses already loaded for `date`
    pub fn analyze(&self, date: NaiveDate, pulses: &[Pulse]) -> DailyRuntimeSummary {
        analyze(date, pulses, self.gap_threshold_minutes)
    }

    /// Read `date` from the store and analyze it, for one machine or the
    /// whole fleet
    pub fn daily_summary(
        &self,
        store: &dyn PulseStore,
        date: NaiveDate,
        machine_id: Option<&str>,
    ) -> Result<DailyRuntimeSummary> {
        daily_summary(store, &self.calendar, date, machine_id, self.gap_threshold_minutes)
    }
}

/// Read one day's pulses from the store and analyze them
pub fn daily_summary(
    store: &dyn PulseStore,
    calendar: &DayCalendar,
    date: NaiveDate,
    machine_id: Option<&str>,
    gap_threshold_minutes: u32,
) -> Result<DailyRuntimeSummary> {
    let window = calendar.window(date);
    let pulses = store.range(machine_id, window.start, window.end)?;
    let mut summary = analyze(date, &pulses, gap_threshold_minutes);
    summary.machine_id = machine_id.map(str::to_string);
    debug!(
        "Summary for {} {}: {} pulses, {} gaps",
        date,
        machine_id.unwrap_or("fleet"),
        summary.pulse_count,
        summary.gaps.len()
    );
    Ok(summary)
}
