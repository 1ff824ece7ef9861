// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! File-backed pulse journal
//!
//! One pulse per line, `<crc32 hex> <json>`. The journal is only ever
//! appended to. On open the whole file is replayed into an in-memory index;
//! lines whose checksum or JSON does not verify (torn writes after a power
//! loss, manual edits) are skipped and counted.
//!
//! # Example
//!
//! ```rust,no_run
//! use linepulse::journal::JournalPulseStore;
//! use linepulse::store::PulseStore;
//!
//! let journal = JournalPulseStore::open("pulses.journal").unwrap();
//! println!("{} pulses recovered", journal.len());
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{info, warn};

use crate::error::StoreError;
use crate::pulse::{Pulse, PulseId};
use crate::store::{MemoryPulseStore, PulseStore};

static JOURNAL_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// What was found while replaying a journal file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Pulses loaded into the index
    pub loaded: usize,
    /// Lines repeating an already loaded pulse id
    pub duplicates: usize,
    /// Lines skipped for a bad checksum or undecodable payload
    pub corrupt: usize,
}

/// Appends records, keeping a record from landing on a torn line
#[derive(Debug)]
struct RecordWriter<W> {
    out: W,
    torn: bool,
}

impl<W: Write> RecordWriter<W> {
    fn new(out: W) -> Self {
        Self { out, torn: false }
    }

    fn write_record(&mut self, line: &str) -> std::io::Result<()> {
        if self.torn {
            self.out.write_all(b"\n")?;
            self.torn = false;
        }
        let written = self
            .out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.flush());
        if written.is_err() {
            // part of the line may be on disk
            self.torn = true;
        }
        written
    }
}

/// Pulse store persisted to an append-only journal file
#[derive(Debug)]
pub struct JournalPulseStore {
    path: PathBuf,
    file: Mutex<RecordWriter<File>>,
    index: MemoryPulseStore,
    recovery: RecoveryStats,
}

impl JournalPulseStore {
    /// Open (or create) a journal and replay it
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let index = MemoryPulseStore::new();
        let mut recovery = RecoveryStats::default();

        let bytes = std::fs::read(&path)?;
        let content = String::from_utf8_lossy(&bytes);
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match decode_line(line, n + 1) {
                Ok(pulse) => {
                    if index.append(pulse)? {
                        recovery.loaded += 1;
                    } else {
                        recovery.duplicates += 1;
                    }
                }
                Err(e) => {
                    warn!("Skipping journal record in {}: {}", path.display(), e);
                    recovery.corrupt += 1;
                }
            }
        }

        // Terminate a torn trailing record so the next append starts clean
        if !bytes.is_empty() && !bytes.ends_with(b"\n") {
            let mut file = &file;
            file.write_all(b"\n")?;
        }

        info!(
            "Journal {} replayed: {} pulses, {} duplicates, {} corrupt",
            path.display(),
            recovery.loaded,
            recovery.duplicates,
            recovery.corrupt
        );

        Ok(Self {
            path,
            file: Mutex::new(RecordWriter::new(file)),
            index,
            recovery,
        })
    }

    /// Replay statistics from [`open`](Self::open)
    pub fn recovery(&self) -> RecoveryStats {
        self.recovery
    }

    /// Journal file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PulseStore for JournalPulseStore {
    fn append(&self, pulse: Pulse) -> Result<bool, StoreError> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());

        if self.index.contains(pulse.id) {
            return Ok(false);
        }

        let line = encode_line(&pulse)?;
        file.write_record(&line)
            .map_err(|e| StoreError::WriteFailed {
                reason: e.to_string(),
            })?;

        self.index.append(pulse)
    }

    fn next_id(&self) -> Result<PulseId, StoreError> {
        self.index.next_id()
    }

    fn range(
        &self,
        machine_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Pulse>, StoreError> {
        self.index.range(machine_id, start, end)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

fn encode_line(pulse: &Pulse) -> Result<String, StoreError> {
    let json = serde_json::to_string(pulse).map_err(|e| StoreError::WriteFailed {
        reason: e.to_string(),
    })?;
    let crc = JOURNAL_CRC.checksum(json.as_bytes());
    Ok(format!("{:08x} {}\n", crc, json))
}

fn decode_line(line: &str, line_no: usize) -> Result<Pulse, StoreError> {
    let corrupt = |reason: &str| StoreError::CorruptRecord {
        line: line_no,
        reason: reason.to_string(),
    };

    let (crc_hex, json) = line.split_once(' ').ok_or_else(|| corrupt("missing checksum"))?;
    let expected = u32::from_str_radix(crc_hex, 16).map_err(|_| corrupt("bad checksum field"))?;
    let actual = JOURNAL_CRC.checksum(json.as_bytes());
    if expected != actual {
        return Err(corrupt(&format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }
    serde_json::from_str(json).map_err(|e| corrupt(&e.to_string()))
}
