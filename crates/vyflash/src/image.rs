//! 128 KiB flash image handling: loading, the embedded calibration
//! checksum, and sector diffing.
//!
//! # Checksum
//!
//! A 16-bit big-endian word at file offsets `0x4006..0x4008` covers the
//! calibration window `[0x4000, 0x8000)` minus the word itself. Each
//! covered byte is accumulated into the big end of a wrapping 16-bit sum
//! and the stored word is the two's complement of that sum, so the
//! weighted total over the window is zero mod 2^16. An all-`0xAA`
//! calibration window therefore stores `0x5400`.

use std::path::Path;

use crate::bank::Sector;
use crate::error::{Error, Result};

/// Size of a full flash image.
pub const IMAGE_SIZE: usize = 0x20000;
/// Size of a calibration-only file.
pub const CAL_SIZE: usize = 0x4000;
/// File offset of the calibration area.
pub const CAL_OFFSET: usize = 0x4000;
/// File offset of the checksum word's high byte.
pub const CHECKSUM_OFFSET: usize = 0x4006;

/// A 128 KiB flash image.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    data: Vec<u8>,
}

impl Image {
    /// An image of blank (erased) flash, all `0xFF`.
    pub fn blank() -> Self {
        Self {
            data: vec![0xFF; IMAGE_SIZE],
        }
    }

    /// Build an image from raw bytes.
    ///
    /// Accepts a full 128 KiB image, or a 16 KiB calibration-only file
    /// which is padded to a full image (`0xFF` fill, calibration at
    /// `0x4000`) the way the OSE flash tool does.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        match bytes.len() {
            IMAGE_SIZE => Ok(Self { data: bytes }),
            CAL_SIZE => {
                let mut data = vec![0xFF; IMAGE_SIZE];
                data[CAL_OFFSET..CAL_OFFSET + CAL_SIZE].copy_from_slice(&bytes);
                tracing::info!("padded 16 KiB calibration file to a full image");
                Ok(Self { data })
            }
            n => Err(Error::Validation(format!(
                "invalid image size: {n} bytes (expected {IMAGE_SIZE} or {CAL_SIZE})"
            ))),
        }
    }

    /// Load a `.bin` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Save the image as a raw `.bin` file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The OS id bytes at `0x2000..0x2002`, formatted like `$060A`.
    pub fn os_id(&self) -> String {
        format!("${:02X}{:02X}", self.data[0x2000], self.data[0x2001])
    }

    // =========================================================================
    // Checksum
    // =========================================================================

    /// Compute the calibration checksum word for this image.
    pub fn compute_checksum(&self) -> u16 {
        compute_window_checksum(&self.data)
    }

    /// The checksum word currently stored at `0x4006..0x4008`.
    pub fn stored_checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[CHECKSUM_OFFSET], self.data[CHECKSUM_OFFSET + 1]])
    }

    /// Whether the stored checksum matches the computed one.
    pub fn verify_checksum(&self) -> bool {
        self.stored_checksum() == self.compute_checksum()
    }

    /// Compute and store the correct checksum word.
    /// Returns `(old, new)`.
    pub fn fix_checksum(&mut self) -> (u16, u16) {
        let old = self.stored_checksum();
        let new = self.compute_checksum();
        self.data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&new.to_be_bytes());
        (old, new)
    }

    /// Sector indices whose contents differ between two images.
    pub fn changed_sectors(&self, other: &Image) -> Vec<u8> {
        (0..8u8)
            .filter(|&i| {
                let r = Sector::SIZE as usize * i as usize..Sector::SIZE as usize * (i as usize + 1);
                self.data[r.clone()] != other.data[r]
            })
            .collect()
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("os_id", &self.os_id())
            .field("checksum", &format_args!("0x{:04X}", self.stored_checksum()))
            .finish()
    }
}

/// Checksum over a raw 128 KiB buffer. Offline pure function; also used
/// by the virtual ECU against its simulated flash contents.
pub fn compute_window_checksum(data: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for (offset, &b) in data[CAL_OFFSET..CAL_OFFSET + CAL_SIZE].iter().enumerate() {
        let abs = CAL_OFFSET + offset;
        if abs == CHECKSUM_OFFSET || abs == CHECKSUM_OFFSET + 1 {
            continue;
        }
        sum = sum.wrapping_add((b as u16) << 8);
    }
    sum.wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_aa_calibration_stores_0x5400() {
        let mut img = Image::blank();
        img.as_bytes_mut()[CAL_OFFSET..CAL_OFFSET + CAL_SIZE].fill(0xAA);
        assert_eq!(img.compute_checksum(), 0x5400);
        img.fix_checksum();
        assert_eq!(img.stored_checksum(), 0x5400);
        assert!(img.verify_checksum());
    }

    #[test]
    fn fix_then_compute_is_idempotent() {
        let mut img = Image::blank();
        for (i, b) in img.as_bytes_mut()[CAL_OFFSET..CAL_OFFSET + CAL_SIZE]
            .iter_mut()
            .enumerate()
        {
            *b = (i as u8).wrapping_mul(31);
        }
        let (_, fixed) = img.fix_checksum();
        assert_eq!(img.compute_checksum(), fixed);
        assert_eq!(img.stored_checksum(), fixed);
        // Fixing again changes nothing.
        let (old, new) = img.fix_checksum();
        assert_eq!(old, new);
    }

    #[test]
    fn checksum_ignores_everything_outside_the_window() {
        let mut img = Image::blank();
        img.fix_checksum();
        let before = img.compute_checksum();
        img.as_bytes_mut()[0x2000] = 0x12;
        img.as_bytes_mut()[0x1FFFF] = 0x34;
        assert_eq!(img.compute_checksum(), before);
    }

    #[test]
    fn cal_file_is_padded() {
        let cal = vec![0xAA; CAL_SIZE];
        let img = Image::from_bytes(cal).unwrap();
        assert_eq!(img.as_bytes().len(), IMAGE_SIZE);
        assert_eq!(img.as_bytes()[0], 0xFF);
        assert_eq!(img.as_bytes()[CAL_OFFSET], 0xAA);
        assert_eq!(img.as_bytes()[CAL_OFFSET + CAL_SIZE], 0xFF);
    }

    #[test]
    fn wrong_size_is_a_validation_error() {
        match Image::from_bytes(vec![0u8; 1234]) {
            Err(Error::Validation(msg)) => assert!(msg.contains("1234")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn changed_sectors_reports_differences() {
        let a = Image::blank();
        let mut b = Image::blank();
        b.as_bytes_mut()[0x4000] = 0;
        b.as_bytes_mut()[0x1C000] = 0;
        assert_eq!(a.changed_sectors(&b), vec![1, 7]);
        assert!(a.changed_sectors(&a.clone()).is_empty());
    }
}
