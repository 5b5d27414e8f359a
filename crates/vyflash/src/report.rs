//! Machine-readable operation reports.
//!
//! Every write leaves a report carrying the last successful sector and
//! offset, so a failed run can be resumed or compared against a
//! bench-read image. Reports serialize to JSON into a caller-supplied
//! directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bank::WriteMode;
use crate::error::{Error, Result};

/// How a write operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOutcome {
    Completed,
    Cancelled,
    Failed { error: String },
}

/// Result record of a `write_image` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReport {
    pub mode: WriteMode,
    pub outcome: WriteOutcome,
    /// Data bytes acknowledged by the kernel.
    pub bytes_written: u64,
    /// Sector indices erased, in order.
    pub sectors_erased: Vec<u8>,
    /// Sector indices that passed read-back verification.
    pub sectors_verified: Vec<u8>,
    /// Byte-level reprogram attempts spent during verification.
    pub byte_retries: u32,
    /// Last sector an operation made progress in.
    pub last_sector: Option<u8>,
    /// File offset just past the last acknowledged byte.
    pub last_offset: Option<u32>,
    /// Checksum word embedded in the source image.
    pub image_checksum: u16,
    /// Checksum word the kernel computed on-chip, when it got that far.
    pub chip_checksum: Option<u16>,
    pub elapsed_ms: u64,
}

impl WriteReport {
    pub(crate) fn new(mode: WriteMode, image_checksum: u16) -> Self {
        Self {
            mode,
            outcome: WriteOutcome::Completed,
            bytes_written: 0,
            sectors_erased: Vec::new(),
            sectors_verified: Vec::new(),
            byte_retries: 0,
            last_sector: None,
            last_offset: None,
            image_checksum,
            chip_checksum: None,
            elapsed_ms: 0,
        }
    }

    pub fn completed(&self) -> bool {
        self.outcome == WriteOutcome::Completed
    }

    /// Write the report as JSON into `dir`, named after the mode.
    /// Returns the file path.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let path = dir
            .as_ref()
            .join(format!("write_{}.json", self.mode.to_string().to_lowercase()));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Validation(format!("report serialization: {e}")))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_round_trips_through_json() {
        let mut report = WriteReport::new(WriteMode::Cal, 0x5400);
        report.bytes_written = 16384;
        report.sectors_erased = vec![1];
        report.last_sector = Some(1);
        report.last_offset = Some(0x8000);
        let json = serde_json::to_string(&report).unwrap();
        let back: WriteReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode, WriteMode::Cal);
        assert_eq!(back.image_checksum, 0x5400);
        assert_eq!(back.last_offset, Some(0x8000));
        assert!(back.completed());
    }

    #[test]
    fn save_writes_a_json_file() {
        let dir = std::env::temp_dir().join("vyflash-report-test");
        std::fs::create_dir_all(&dir).unwrap();
        let report = WriteReport::new(WriteMode::Prom, 0x1234);
        let path = report.save(&dir).unwrap();
        assert!(path.ends_with("write_prom.json"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"prom\""));
        std::fs::remove_file(path).ok();
    }
}
