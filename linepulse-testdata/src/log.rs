// Linepulse Testdata - Pulse logs
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Pulse logs and their CSV/JSON forms.
//!
//! CSV layout, one pulse per line:
//!
//! ```text
//! timestamp,machine_id,lane_id,product_sku,quantity,id
//! 2025-03-14T06:00:12+00:00,filler-1,A,WATER-500,,0
//! ```
//!
//! Empty cells are absent optional fields.

use chrono::{DateTime, Utc};
use linepulse::RawPulse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::events::{Changeover, Stoppage};

const CSV_HEADER: &str = "timestamp,machine_id,lane_id,product_sku,quantity,id";

/// Pulse log error types.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parse error at line {line}: {message}")]
    CsvParse { line: usize, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected header: {0}")]
    BadHeader(String),

    #[error("Field contains a comma: {0}")]
    UnencodableField(String),

    #[error("Empty log")]
    Empty,
}

/// One recorded pulse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseRow {
    pub timestamp: DateTime<Utc>,
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl PulseRow {
    /// Unvalidated pulse ready for ingestion.
    pub fn to_raw(&self) -> RawPulse {
        RawPulse {
            id: self.id,
            machine_id: Some(self.machine_id.clone()),
            lane_id: self.lane_id.clone(),
            product_sku: self.product_sku.clone(),
            quantity: self.quantity,
            timestamp: Some(self.timestamp),
        }
    }

    /// Units this row counts for.
    pub fn units(&self) -> u64 {
        u64::from(self.quantity.unwrap_or(1))
    }
}

/// What produced a log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Stoppages injected while generating.
    #[serde(default)]
    pub stoppages: Vec<Stoppage>,
    /// Changeovers injected while generating.
    #[serde(default)]
    pub changeovers: Vec<Changeover>,
}

/// Time-ordered pulses from one or more machines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseLog {
    pub rows: Vec<PulseRow>,
    #[serde(default)]
    pub metadata: LogMetadata,
}

impl PulseLog {
    pub fn new(rows: Vec<PulseRow>) -> Self {
        Self {
            rows,
            metadata: LogMetadata::default(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.metadata.name = Some(name.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct machines in the log.
    pub fn machines(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.machine_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Rows of one machine.
    pub fn for_machine<'a>(&'a self, machine_id: &'a str) -> impl Iterator<Item = &'a PulseRow> {
        self.rows.iter().filter(move |r| r.machine_id == machine_id)
    }

    /// Units across all rows, or one machine's rows.
    pub fn total_units(&self, machine_id: Option<&str>) -> u64 {
        self.rows
            .iter()
            .filter(|r| machine_id.map_or(true, |m| r.machine_id == m))
            .map(PulseRow::units)
            .sum()
    }

    /// Raw pulses in log order.
    pub fn to_raw_pulses(&self) -> Vec<RawPulse> {
        self.rows.iter().map(PulseRow::to_raw).collect()
    }

    /// Write CSV.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), LogError> {
        let mut writer = BufWriter::new(writer);
        writeln!(writer, "{}", CSV_HEADER)?;

        for row in &self.rows {
            for text in [Some(&row.machine_id), row.lane_id.as_ref(), row.product_sku.as_ref()]
                .into_iter()
                .flatten()
            {
                if text.contains(',') {
                    return Err(LogError::UnencodableField(text.clone()));
                }
            }
            writeln!(
                writer,
                "{},{},{},{},{},{}",
                row.timestamp.to_rfc3339(),
                row.machine_id,
                row.lane_id.as_deref().unwrap_or(""),
                row.product_sku.as_deref().unwrap_or(""),
                row.quantity.map(|q| q.to_string()).unwrap_or_default(),
                row.id.map(|i| i.to_string()).unwrap_or_default(),
            )?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Export to a CSV file.
    pub fn to_csv(&self, path: impl AsRef<Path>) -> Result<(), LogError> {
        self.write_csv(File::create(path)?)
    }

    /// Parse CSV.
    pub fn read_csv<R: BufRead>(reader: R) -> Result<Self, LogError> {
        let mut lines = reader.lines();
        let header = lines.next().ok_or(LogError::Empty)??;
        if header.trim() != CSV_HEADER {
            return Err(LogError::BadHeader(header));
        }

        let mut rows = Vec::new();
        for (index, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // header is line 1
            rows.push(parse_row(&line, index + 2)?);
        }
        Ok(Self::new(rows))
    }

    /// Import from a CSV file.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, LogError> {
        Self::read_csv(BufReader::new(File::open(path)?))
    }

    /// Export to a JSON file, metadata included.
    pub fn to_json(&self, path: impl AsRef<Path>) -> Result<(), LogError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Import from a JSON file.
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn parse_row(line: &str, line_no: usize) -> Result<PulseRow, LogError> {
    let bad = |message: String| LogError::CsvParse {
        line: line_no,
        message,
    };

    let cells: Vec<&str> = line.split(',').map(str::trim).collect();
    if cells.len() != 6 {
        return Err(bad(format!("expected 6 columns, found {}", cells.len())));
    }

    let optional = |cell: &str| (!cell.is_empty()).then(|| cell.to_string());

    let timestamp = DateTime::parse_from_rfc3339(cells[0])
        .map_err(|e| bad(format!("timestamp: {}", e)))?
        .with_timezone(&Utc);
    let quantity = match cells[4] {
        "" => None,
        q => Some(q.parse::<u32>().map_err(|e| bad(format!("quantity: {}", e)))?),
    };
    let id = match cells[5] {
        "" => None,
        i => Some(i.parse::<u64>().map_err(|e| bad(format!("id: {}", e)))?),
    };

    Ok(PulseRow {
        timestamp,
        machine_id: cells[1].to_string(),
        lane_id: optional(cells[2]),
        product_sku: optional(cells[3]),
        quantity,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn sample() -> PulseLog {
        let t = Utc.with_ymd_and_hms(2025, 3, 14, 6, 0, 0).unwrap();
        PulseLog::new(vec![
            PulseRow {
                timestamp: t,
                machine_id: "filler-1".into(),
                lane_id: Some("A".into()),
                product_sku: Some("WATER-500".into()),
                quantity: None,
                id: Some(0),
            },
            PulseRow {
                timestamp: t + chrono::Duration::seconds(30),
                machine_id: "packer-1".into(),
                lane_id: None,
                product_sku: None,
                quantity: Some(6),
                id: None,
            },
        ])
    }

    #[test]
    fn test_csv_file_roundtrip() {
        let log = sample();
        let file = NamedTempFile::new().unwrap();
        log.to_csv(file.path()).unwrap();

        let loaded = PulseLog::from_csv(file.path()).unwrap();
        assert_eq!(loaded.rows, log.rows);
    }

    #[test]
    fn test_json_keeps_metadata() {
        let log = sample().with_name("demo");
        let file = NamedTempFile::new().unwrap();
        log.to_json(file.path()).unwrap();

        let loaded = PulseLog::from_json(file.path()).unwrap();
        assert_eq!(loaded.metadata.name.as_deref(), Some("demo"));
        assert_eq!(loaded.rows, log.rows);
    }

    #[test]
    fn test_bad_header() {
        let err = PulseLog::read_csv(Cursor::new("ts,machine\n")).unwrap_err();
        assert!(matches!(err, LogError::BadHeader(_)));
    }

    #[test]
    fn test_parse_error_reports_line() {
        let text = format!("{}\nnot-a-time,m1,,,,\n", CSV_HEADER);
        match PulseLog::read_csv(Cursor::new(text)).unwrap_err() {
            LogError::CsvParse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_comma_in_field_rejected() {
        let mut log = sample();
        log.rows[0].product_sku = Some("A,B".into());
        let err = log.write_csv(Vec::new()).unwrap_err();
        assert!(matches!(err, LogError::UnencodableField(_)));
    }

    #[test]
    fn test_totals_and_machines() {
        let log = sample();
        assert_eq!(log.machines(), vec!["filler-1", "packer-1"]);
        assert_eq!(log.total_units(None), 7);
        assert_eq!(log.total_units(Some("packer-1")), 6);
        assert_eq!(log.for_machine("filler-1").count(), 1);
    }

    #[test]
    fn test_to_raw_validates() {
        let pulse = sample().rows[0].to_raw().validate().unwrap();
        assert_eq!(pulse.machine_id, "filler-1");
        assert_eq!(pulse.product_sku.as_deref(), Some("WATER-500"));
    }
}
