// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Runtime configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clock::DayCalendar;
use crate::error::ConfigError;

/// Configuration shared by the aggregator, staleness monitor and analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinepulseConfig {
    /// Silence after which an online machine is demoted (ms).
    pub staleness_timeout_ms: u64,

    /// Staleness sweep period (ms). Bounds offline detection latency.
    pub check_interval_ms: u64,

    /// At (re)initialisation, a machine seen within this window starts Online (ms).
    pub online_threshold_ms: u64,

    /// Pulse spacing above which a downtime gap is reported (minutes).
    pub gap_threshold_minutes: u32,

    /// Local time offset from UTC (minutes), defines production-day boundaries.
    pub utc_offset_minutes: i32,

    /// Period of full recompute against the pulse store (ms, 0 = never).
    pub reconcile_interval_ms: u64,
}

impl Default for LinepulseConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_ms: 300_000, // 5 minutes
            check_interval_ms: 5_000,
            online_threshold_ms: 300_000,
            gap_threshold_minutes: 15,
            utc_offset_minutes: 0,
            reconcile_interval_ms: 600_000, // 10 minutes
        }
    }
}

impl LinepulseConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the staleness timeout in seconds.
    pub fn with_staleness_timeout_secs(mut self, secs: u64) -> Self {
        self.staleness_timeout_ms = secs.saturating_mul(1000);
        self
    }

    /// Set the sweep interval in milliseconds.
    pub fn with_check_interval_ms(mut self, ms: u64) -> Self {
        self.check_interval_ms = ms;
        self
    }

    /// Set the online threshold used at initialisation, in seconds.
    pub fn with_online_threshold_secs(mut self, secs: u64) -> Self {
        self.online_threshold_ms = secs.saturating_mul(1000);
        self
    }

    /// Set the gap threshold.
    pub fn with_gap_threshold_minutes(mut self, minutes: u32) -> Self {
        self.gap_threshold_minutes = minutes;
        self
    }

    /// Set the local UTC offset.
    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    /// Set the reconcile period in milliseconds.
    pub fn with_reconcile_interval_ms(mut self, ms: u64) -> Self {
        self.reconcile_interval_ms = ms;
        self
    }

    /// Staleness timeout as a chrono duration. Saturates; `validate` rejects
    /// values that do not fit.
    pub fn staleness_timeout(&self) -> chrono::Duration {
        millis("staleness_timeout_ms", self.staleness_timeout_ms)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX))
    }

    /// Online threshold as a chrono duration. Saturates like
    /// [`staleness_timeout`](Self::staleness_timeout).
    pub fn online_threshold(&self) -> chrono::Duration {
        millis("online_threshold_ms", self.online_threshold_ms)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX))
    }

    /// Sweep period.
    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.check_interval_ms)
    }

    /// Reconcile period, if enabled.
    pub fn reconcile_interval(&self) -> Option<std::time::Duration> {
        (self.reconcile_interval_ms > 0)
            .then(|| std::time::Duration::from_millis(self.reconcile_interval_ms))
    }

    /// Calendar for the configured offset.
    pub fn calendar(&self) -> Result<DayCalendar, ConfigError> {
        DayCalendar::with_offset_minutes(self.utc_offset_minutes)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.staleness_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "staleness_timeout_ms",
            });
        }
        if self.check_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "check_interval_ms",
            });
        }
        if self.online_threshold_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "online_threshold_ms",
            });
        }
        if self.gap_threshold_minutes == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "gap_threshold_minutes",
            });
        }
        millis("staleness_timeout_ms", self.staleness_timeout_ms)?;
        millis("online_threshold_ms", self.online_threshold_ms)?;
        if self.check_interval_ms > self.staleness_timeout_ms {
            return Err(ConfigError::IntervalExceedsTimeout {
                interval_ms: self.check_interval_ms,
                timeout_ms: self.staleness_timeout_ms,
            });
        }
        self.calendar()?;
        Ok(())
    }

    /// Load and validate a JSON config file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Load(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn millis(field: &'static str, value: u64) -> Result<chrono::Duration, ConfigError> {
    i64::try_from(value)
        .map(chrono::Duration::milliseconds)
        .map_err(|_| ConfigError::DurationOutOfRange { field, value })
}
