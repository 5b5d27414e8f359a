//! Bank-switched address mapping for the Am29F010 behind the 68HC11.
//!
//! The CPU sees the 128 KiB flash through a banked window: a byte written
//! to the bank register selects which region appears at the CPU
//! addresses. File offsets in the 128 KiB image map as:
//!
//! ```text
//! file [0x00000, 0x10000)  bank 0x48  cpu = file            (sectors 0-3)
//! file [0x10000, 0x18000)  bank 0x58  cpu = file - 0x8000   (sectors 4-5)
//! file [0x18000, 0x20000)  bank 0x50  cpu = file - 0x10000  (sectors 6-7)
//! ```
//!
//! The first 8 KiB of the CPU map is shadowed by RAM and registers, so
//! `[0x0000, 0x2000)` is never written as flash data.

use serde::{Deserialize, Serialize};

/// Bank register value mapping sectors 0-3 one-to-one into the CPU map.
pub const BANK_LOW: u8 = 0x48;
/// Bank register value mapping sectors 4-5 at CPU `0x8000`.
pub const BANK_MID: u8 = 0x58;
/// Bank register value mapping sectors 6-7 at CPU `0x8000`.
pub const BANK_HIGH: u8 = 0x50;

/// File offsets below this are RAM/register-shadowed and never written.
pub const RESERVED_LOW: u32 = 0x2000;

/// A file offset resolved to its bank register value and CPU address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankedAddress {
    pub bank: u8,
    pub cpu: u16,
}

/// Resolve a file offset to (bank, CPU address).
///
/// Returns `None` for offsets outside the 128 KiB image.
pub fn file_to_cpu(offset: u32) -> Option<BankedAddress> {
    match offset {
        0x00000..=0x0FFFF => Some(BankedAddress {
            bank: BANK_LOW,
            cpu: offset as u16,
        }),
        0x10000..=0x17FFF => Some(BankedAddress {
            bank: BANK_MID,
            cpu: (offset - 0x8000) as u16,
        }),
        0x18000..=0x1FFFF => Some(BankedAddress {
            bank: BANK_HIGH,
            cpu: (offset - 0x10000) as u16,
        }),
        _ => None,
    }
}

/// Inverse of [`file_to_cpu`].
///
/// Returns `None` for an unknown bank byte or a CPU address outside the
/// bank's window.
pub fn cpu_to_file(bank: u8, cpu: u16) -> Option<u32> {
    match bank {
        BANK_LOW => Some(cpu as u32),
        BANK_MID if cpu >= 0x8000 => Some(cpu as u32 + 0x8000),
        BANK_HIGH if cpu >= 0x8000 => Some(cpu as u32 + 0x10000),
        _ => None,
    }
}

// =============================================================================
// Sectors
// =============================================================================

/// One 16 KiB erase unit of the Am29F010.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub index: u8,
    /// File offset of the first byte of this sector.
    pub file_start: u32,
    /// Bank register value that maps this sector into the CPU window.
    pub bank: u8,
    /// CPU address of the first byte of this sector in its bank window.
    pub cpu_base: u16,
    /// High byte of the in-window address the erase confirm is issued to.
    /// Sector 0's low 8 KiB is RAM-shadowed, so its confirm goes to 0x2000.
    pub erase_code: u8,
}

impl Sector {
    pub const SIZE: u32 = 0x4000;

    /// File range covered by this sector.
    pub fn file_range(&self) -> std::ops::Range<u32> {
        self.file_start..self.file_start + Self::SIZE
    }

    /// Sector containing the given file offset.
    pub fn containing(offset: u32) -> Option<&'static Sector> {
        SECTORS.get((offset / Self::SIZE) as usize)
    }
}

/// The eight sectors of the 128 KiB part, in file-offset order.
pub const SECTORS: [Sector; 8] = [
    Sector { index: 0, file_start: 0x00000, bank: BANK_LOW, cpu_base: 0x0000, erase_code: 0x20 },
    Sector { index: 1, file_start: 0x04000, bank: BANK_LOW, cpu_base: 0x4000, erase_code: 0x40 },
    Sector { index: 2, file_start: 0x08000, bank: BANK_LOW, cpu_base: 0x8000, erase_code: 0x80 },
    Sector { index: 3, file_start: 0x0C000, bank: BANK_LOW, cpu_base: 0xC000, erase_code: 0xC0 },
    Sector { index: 4, file_start: 0x10000, bank: BANK_MID, cpu_base: 0x8000, erase_code: 0x80 },
    Sector { index: 5, file_start: 0x14000, bank: BANK_MID, cpu_base: 0xC000, erase_code: 0xC0 },
    Sector { index: 6, file_start: 0x18000, bank: BANK_HIGH, cpu_base: 0x8000, erase_code: 0x80 },
    Sector { index: 7, file_start: 0x1C000, bank: BANK_HIGH, cpu_base: 0xC000, erase_code: 0xC0 },
];

// =============================================================================
// Write modes
// =============================================================================

/// What a write operation is allowed to touch.
///
/// Sector 7 is the boot sector; only recovery (`Prom`) mode erases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Calibration only: sector 1, file `[0x4000, 0x8000)`.
    Cal,
    /// OS + calibration: sectors 0-6, file `[0x2000, 0x1C000)`.
    Bin,
    /// Full recovery including the boot sector: sectors 0-7,
    /// file `[0x2000, 0x20000)`.
    Prom,
}

impl WriteMode {
    /// Sector indices erased by this mode, ascending.
    pub fn erase_sectors(&self) -> &'static [u8] {
        match self {
            WriteMode::Cal => &[1],
            WriteMode::Bin => &[0, 1, 2, 3, 4, 5, 6],
            WriteMode::Prom => &[0, 1, 2, 3, 4, 5, 6, 7],
        }
    }

    /// File range written by this mode.
    pub fn write_range(&self) -> std::ops::Range<u32> {
        match self {
            WriteMode::Cal => 0x4000..0x8000,
            WriteMode::Bin => RESERVED_LOW..0x1C000,
            WriteMode::Prom => RESERVED_LOW..0x20000,
        }
    }
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WriteMode::Cal => "CAL",
            WriteMode::Bin => "BIN",
            WriteMode::Prom => "PROM",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_fixture_offsets() {
        assert_eq!(
            file_to_cpu(0x10000),
            Some(BankedAddress { bank: 0x58, cpu: 0x8000 })
        );
        assert_eq!(
            file_to_cpu(0x18000),
            Some(BankedAddress { bank: 0x50, cpu: 0x8000 })
        );
        assert_eq!(
            file_to_cpu(0x00000),
            Some(BankedAddress { bank: 0x48, cpu: 0x0000 })
        );
        assert_eq!(file_to_cpu(0x20000), None);
    }

    #[test]
    fn mapping_is_a_bijection_on_every_bank() {
        for offset in 0..0x20000u32 {
            let a = file_to_cpu(offset).unwrap();
            assert_eq!(cpu_to_file(a.bank, a.cpu), Some(offset), "offset 0x{offset:05X}");
        }
    }

    #[test]
    fn out_of_window_cpu_addresses_reject() {
        assert_eq!(cpu_to_file(BANK_MID, 0x7FFF), None);
        assert_eq!(cpu_to_file(BANK_HIGH, 0x0000), None);
        assert_eq!(cpu_to_file(0x99, 0x8000), None);
    }

    #[test]
    fn sector_table_is_consistent() {
        for (i, s) in SECTORS.iter().enumerate() {
            assert_eq!(s.index as usize, i);
            assert_eq!(s.file_start, i as u32 * Sector::SIZE);
            let mapped = file_to_cpu(s.file_start).unwrap();
            assert_eq!(mapped.bank, s.bank);
            assert_eq!(mapped.cpu, s.cpu_base);
        }
    }

    #[test]
    fn write_modes_cover_their_sectors() {
        assert_eq!(WriteMode::Cal.erase_sectors(), &[1]);
        assert_eq!(WriteMode::Cal.write_range(), 0x4000..0x8000);
        assert_eq!(WriteMode::Bin.erase_sectors().len(), 7);
        assert_eq!(WriteMode::Prom.erase_sectors().len(), 8);
        // Boot sector is only touched in recovery mode.
        assert!(!WriteMode::Bin.erase_sectors().contains(&7));
        assert!(WriteMode::Prom.erase_sectors().contains(&7));
        // Write data always skips the RAM-shadowed first 8 KiB.
        assert!(WriteMode::Bin.write_range().start >= RESERVED_LOW);
        assert!(WriteMode::Prom.write_range().start >= RESERVED_LOW);
    }
}
