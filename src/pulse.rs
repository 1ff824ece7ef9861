// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Pulse and assignment records
//!
//! A [`Pulse`] is one production event: a machine finished `quantity` units
//! (default 1) at `timestamp`. Pulses are validated from the untrusted
//! [`RawPulse`] form at the ingest boundary; nothing downstream ever sees a
//! pulse without a machine id or a timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::PulseError;

/// Machine identifier
pub type MachineId = String;

/// Lane identifier within a machine
pub type LaneId = String;

/// Product stock-keeping unit
pub type Sku = String;

/// Opaque pulse identity used for de-duplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PulseId(pub u64);

impl std::fmt::Display for PulseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A validated production pulse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pulse {
    /// Pulse identity
    pub id: PulseId,
    /// Machine that produced the units
    pub machine_id: MachineId,
    /// Lane the units came off, if the machine reports lanes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_id: Option<LaneId>,
    /// Product running at the time, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_sku: Option<Sku>,
    /// Units completed (absent means 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    /// Event time
    pub timestamp: DateTime<Utc>,
}

impl Pulse {
    /// Units this pulse contributes to output totals
    pub fn units(&self) -> u64 {
        u64::from(self.quantity.unwrap_or(1))
    }

    /// Whether the pulse names a product
    pub fn has_product(&self) -> bool {
        self.product_sku.is_some()
    }
}

/// Untrusted pulse record as delivered by the ingest boundary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPulse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub lane_id: Option<String>,
    #[serde(default)]
    pub product_sku: Option<String>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawPulse {
    /// Start a raw record for a machine at a given time
    pub fn new(machine_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            machine_id: Some(machine_id.into()),
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    /// Set an explicit pulse id
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the lane
    pub fn lane(mut self, lane_id: impl Into<String>) -> Self {
        self.lane_id = Some(lane_id.into());
        self
    }

    /// Set the product SKU
    pub fn product(mut self, sku: impl Into<String>) -> Self {
        self.product_sku = Some(sku.into());
        self
    }

    /// Set the unit count
    pub fn quantity(mut self, quantity: u32) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Validate into a [`Pulse`]
    ///
    /// Blank lane and product strings are treated as absent. When no id was
    /// supplied a fingerprint of the record's fields is used. Records going
    /// through [`Telemetry::ingest`](crate::service::Telemetry::ingest) get a
    /// store-assigned id before this point instead.
    pub fn validate(self) -> Result<Pulse, PulseError> {
        let machine_id = self
            .machine_id
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .ok_or(PulseError::MissingMachineId)?;
        let timestamp = self.timestamp.ok_or_else(|| PulseError::MissingTimestamp {
            machine_id: machine_id.clone(),
        })?;

        let lane_id = non_blank(self.lane_id);
        let product_sku = non_blank(self.product_sku);

        let id = match self.id {
            Some(id) => PulseId(id),
            None => fingerprint(
                &machine_id,
                lane_id.as_deref(),
                product_sku.as_deref(),
                self.quantity,
                timestamp,
            ),
        };

        Ok(Pulse {
            id,
            machine_id,
            lane_id,
            product_sku,
            quantity: self.quantity,
            timestamp,
        })
    }
}

impl From<Pulse> for RawPulse {
    fn from(pulse: Pulse) -> Self {
        Self {
            id: Some(pulse.id.0),
            machine_id: Some(pulse.machine_id),
            lane_id: pulse.lane_id,
            product_sku: pulse.product_sku,
            quantity: pulse.quantity,
            timestamp: Some(pulse.timestamp),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Content fingerprint for pulses delivered without an id
pub fn fingerprint(
    machine_id: &str,
    lane_id: Option<&str>,
    product_sku: Option<&str>,
    quantity: Option<u32>,
    timestamp: DateTime<Utc>,
) -> PulseId {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(machine_id.as_bytes());
    buf.push(0x1f);
    buf.extend_from_slice(lane_id.unwrap_or("").as_bytes());
    buf.push(0x1f);
    buf.extend_from_slice(product_sku.unwrap_or("").as_bytes());
    buf.push(0x1f);
    match quantity {
        Some(q) => {
            buf.push(1);
            buf.extend_from_slice(&q.to_le_bytes());
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&timestamp.timestamp_micros().to_le_bytes());
    PulseId(xxh64(&buf, 0))
}

/// Product bound to one lane of a machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveAssignment {
    pub machine_id: MachineId,
    pub lane_id: LaneId,
    pub product_sku: Sku,
}

impl ActiveAssignment {
    pub fn new(
        machine_id: impl Into<String>,
        lane_id: impl Into<String>,
        product_sku: impl Into<String>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            lane_id: lane_id.into(),
            product_sku: product_sku.into(),
        }
    }

    /// Lane-level view without the machine id
    pub fn lane_view(&self) -> LaneAssignment {
        LaneAssignment {
            lane_id: self.lane_id.clone(),
            product_sku: self.product_sku.clone(),
        }
    }
}

/// `{lane_id, product_sku}` pair returned to consumers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaneAssignment {
    pub lane_id: LaneId,
    pub product_sku: Sku,
}
