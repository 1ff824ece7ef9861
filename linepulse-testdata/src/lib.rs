// Linepulse Testdata - Synthetic production-line pulse generator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Linepulse Testdata
//!
//! Synthetic pulse streams for exercising Linepulse without a real line.
//!
//! - **Machine profiles**: cycle time, jitter, units per pulse, lanes
//! - **Events**: planned stoppages, breakdowns, product changeovers
//! - **Line presets**: press line, two-lane filler, full line
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linepulse_testdata::{generate_scenario, LineScenario, ShiftConfig};
//!
//! let config = ShiftConfig::new().with_duration_hours(8.0).with_seed(42);
//! let log = generate_scenario(LineScenario::Breakdown, &config);
//!
//! log.to_csv("breakdown_shift.csv").unwrap();
//! ```
//!
//! Logs written here are what `linepulse-server --csv` replays.

pub mod events;
pub mod generator;
pub mod log;
pub mod profile;

pub use events::{random_breakdowns, Changeover, Stoppage, StoppageKind};
pub use generator::{generate_scenario, ShiftConfig, ShiftSimulator};
pub use log::{LogError, LogMetadata, PulseLog, PulseRow};
pub use profile::{LaneProfile, LineScenario, MachineProfile};
