//! The 68HC11 flash kernel: three RAM-resident machine-code blocks plus
//! the primitive frames (chip id, sector erase, bank write, on-chip
//! checksum, cleanup) the tool sends once the kernel is running.
//!
//! Every template is stored as it goes on the wire minus the trailing
//! checksum byte: `[device_id, length, mode, payload...]`. A template may
//! be shorter than its declared length; the missing payload bytes are
//! zero (OSE builds frames in a zeroed buffer). Patched offsets
//! are indexed in these wire coordinates.
//!
//! The blocks are opaque machine code; their integrity is load-bearing,
//! so [`verify_integrity`] checks the SHA-256 of each unpatched block
//! against a baked-in digest before the first upload.

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// RAM load addresses of kernel blocks 0-2.
pub const BLOCK_LOAD_ADDRS: [u16; 3] = [0x0100, 0x0200, 0x0300];

/// Wire offset of the payload within a template.
const HEADER_LEN: usize = 3;

/// Block 0, main loop + SCI handler, 171 bytes at RAM `0x0100`.
/// Offset 21 is patched: `0x81` = high-speed read, `0x41` = normal.
const EXEC_BLOCK_0: [u8; 171] = [
    0xF7, 0xFE, 0x06, 0x01, 0x32, 0x86, 0xAA, 0x36, 0x18, 0x30, 0x86, 0x06,
    0xC6, 0x01, 0xBD, 0xFF, 0xBD, 0x32, 0x39, 0xCC, 0x02, 0x41, 0x97, 0x34,
    0x9D, 0x24, 0x20, 0x99, 0x36, 0x18, 0x3C, 0x3C, 0x18, 0x38, 0xCE, 0x10,
    0x00, 0x86, 0x08, 0xA7, 0x2D, 0x4F, 0x97, 0x30, 0x86, 0xF7, 0x8D, 0x26,
    0x17, 0x8B, 0x55, 0x8D, 0x21, 0x96, 0x34, 0x8D, 0x1D, 0x5A, 0x27, 0x0A,
    0x18, 0xA6, 0x00, 0x8D, 0x15, 0x18, 0x08, 0x5A, 0x26, 0xF6, 0x96, 0x30,
    0x40, 0x8D, 0x0B, 0x1F, 0x2E, 0x40, 0xFC, 0x1D, 0x2D, 0x08, 0x18, 0x38,
    0x32, 0x39, 0x9D, 0x1E, 0x1F, 0x2E, 0x80, 0xFA, 0xA7, 0x2F, 0x9B, 0x30,
    0x97, 0x30, 0x39, 0x37, 0xC6, 0x55, 0xF7, 0x10, 0x3A, 0x53, 0xF7, 0x10,
    0x3A, 0xC6, 0x50, 0xF7, 0x18, 0x06, 0xC6, 0xA0, 0xF7, 0x18, 0x06, 0x33,
    0x39, 0xDC, 0x35, 0x4D, 0x26, 0x04, 0xC6, 0x48, 0x20, 0x0D, 0xC1, 0x80,
    0x24, 0x07, 0x14, 0x36, 0x80, 0xC6, 0x58, 0x20, 0x02, 0xC6, 0x50, 0xF7,
    0x10, 0x00, 0x39, 0x3C, 0xCE, 0x10, 0x00, 0x1C, 0x03, 0x08, 0x1D, 0x02,
    0x08, 0x38, 0x39, 0x3C, 0xCE, 0x10, 0x00, 0x1C, 0x03, 0x08, 0x1C, 0x02,
    0x08, 0x38, 0x39,
];

/// Block 1, flash read + data streaming, 172 bytes at RAM `0x0200`.
/// Offset 166 is patched: `0x80` = high-speed read, `0x40` = normal.
const EXEC_BLOCK_1: [u8; 172] = [
    0xF7, 0xFF, 0x06, 0x00, 0x99, 0x86, 0xAA, 0x36, 0x18, 0x30, 0x86, 0x06,
    0xC6, 0x01, 0xBD, 0xFF, 0xBD, 0x32, 0x39, 0x32, 0x8D, 0x3F, 0x97, 0x37,
    0x7A, 0x00, 0x32, 0xCE, 0x03, 0x00, 0x20, 0x10, 0x8D, 0x33, 0x97, 0x2E,
    0x7A, 0x00, 0x32, 0x8D, 0x2C, 0x97, 0x2F, 0x7A, 0x00, 0x32, 0xDE, 0x2E,
    0x8C, 0x03, 0xFF, 0x22, 0xA5, 0x8D, 0x1E, 0xA7, 0x00, 0x08, 0x7A, 0x00,
    0x32, 0x26, 0xF1, 0x8D, 0x14, 0x5D, 0x26, 0x96, 0x96, 0x33, 0x81, 0x10,
    0x27, 0x06, 0xDE, 0x2E, 0xAD, 0x00, 0x20, 0x8A, 0xBD, 0x02, 0x18, 0x20,
    0xF9, 0x3C, 0xCE, 0x10, 0x00, 0x18, 0xCE, 0x05, 0x75, 0x7F, 0x00, 0x31,
    0x7A, 0x00, 0x31, 0x26, 0x04, 0x18, 0x09, 0x27, 0x06, 0x9D, 0x1E, 0x1F,
    0x2E, 0x0E, 0x02, 0x20, 0xDD, 0x1F, 0x2E, 0x20, 0xEB, 0xA6, 0x2F, 0x16,
    0xDB, 0x30, 0xD7, 0x30, 0x38, 0x39, 0x81, 0x02, 0x26, 0xCC, 0x8D, 0xD1,
    0x97, 0x35, 0x8D, 0xCD, 0x97, 0x36, 0x8D, 0xC9, 0x97, 0x37, 0x8D, 0xC5,
    0x5D, 0x26, 0xBB, 0xCE, 0x03, 0x20, 0x8D, 0x7A, 0x18, 0xDE, 0x36, 0x5F,
    0x18, 0xA6, 0x00, 0xA7, 0x00, 0x08, 0x18, 0x08, 0x5C, 0xC1, 0x40, 0x25,
    0xF3, 0xCE, 0x03, 0x20,
];

/// Block 2, interrupt vectors + init, 156 bytes at RAM `0x0300`.
/// No runtime patching.
const EXEC_BLOCK_2: [u8; 156] = [
    0xF7, 0xEF, 0x06, 0x00, 0x10, 0x20, 0x3E, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x7E, 0x01, 0xCC, 0x7E, 0x01, 0x90, 0x00, 0x00,
    0x00, 0x7E, 0x01, 0x49, 0x7E, 0x01, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x8E, 0x00, 0x4F,
    0x0F, 0xB6, 0x18, 0x05, 0x8A, 0x08, 0xB7, 0x18, 0x05, 0x9D, 0x27, 0x3C,
    0x30, 0x86, 0x06, 0x97, 0x34, 0xCC, 0xAA, 0x00, 0xED, 0x00, 0xC6, 0x02,
    0x9D, 0x24, 0x38, 0x8E, 0x00, 0x4F, 0xCE, 0x10, 0x00, 0x86, 0x04, 0xA7,
    0x2D, 0xEC, 0x2E, 0x4F, 0x97, 0x30, 0x1C, 0x2D, 0x02, 0x8D, 0x67, 0x81,
    0xF7, 0x26, 0xE8, 0x8D, 0x61, 0x80, 0x56, 0x25, 0xE2, 0x97, 0x32, 0x8D,
    0x59, 0x97, 0x33, 0x81, 0x06, 0x27, 0x1E, 0x81, 0x10, 0x26, 0x78, 0x8D,
    0x4D, 0x97, 0x35, 0x7A, 0x00, 0x32, 0x8D, 0x46, 0x97, 0x36, 0x7A, 0x00,
];

/// Autoselect reader: manufacturer + device id, then per-sector probe.
const FLASH_INFO: [u8; 139] = [
    0xF7, 0xDE, 0x06, 0x02, 0x00, 0xC6, 0x48, 0xF7, 0x10, 0x00, 0x9D, 0x1B,
    0x86, 0xAA, 0xB7, 0x55, 0x55, 0x86, 0x55, 0xB7, 0x2A, 0xAA, 0x86, 0x90,
    0xB7, 0x55, 0x55, 0x9D, 0x27, 0xCE, 0x03, 0x20, 0xB6, 0x20, 0x00, 0xA7,
    0x00, 0x08, 0xB6, 0x20, 0x01, 0xA7, 0x00, 0x08, 0x18, 0xCE, 0x20, 0x02,
    0x8D, 0x52, 0x18, 0xCE, 0x40, 0x02, 0x8D, 0x4C, 0x18, 0xCE, 0x80, 0x02,
    0x8D, 0x46, 0x18, 0xCE, 0xC0, 0x02, 0x8D, 0x40, 0xC6, 0x58, 0xF7, 0x10,
    0x00, 0x18, 0xCE, 0x80, 0x02, 0x8D, 0x35, 0x18, 0xCE, 0xC0, 0x02, 0x8D,
    0x2F, 0xC6, 0x50, 0xF7, 0x10, 0x00, 0x18, 0xCE, 0x80, 0x02, 0x8D, 0x24,
    0x18, 0xCE, 0xC0, 0x02, 0x8D, 0x1E, 0x9D, 0x1B, 0xC6, 0xAA, 0xF7, 0x55,
    0x55, 0xC6, 0x55, 0xF7, 0x2A, 0xAA, 0xC6, 0xF0, 0xF7, 0x55, 0x55, 0x9D,
    0x27, 0xCE, 0x03, 0x20, 0xCC, 0x06, 0x0B, 0x97, 0x34, 0x9D, 0x24, 0x39,
    0x18, 0xA6, 0x00, 0xA7, 0x00, 0x08, 0x39,
];

/// Sector erase. Offsets 105 (bank) and 106 (erase code) are patched.
const ERASE_SECTOR: [u8; 108] = [
    0xF7, 0xBF, 0x06, 0x02, 0x00, 0xF6, 0x02, 0x64, 0xF7, 0x10, 0x00, 0x9D,
    0x1B, 0x86, 0xAA, 0xB7, 0x55, 0x55, 0x86, 0x55, 0xB7, 0x2A, 0xAA, 0x86,
    0x80, 0xB7, 0x55, 0x55, 0x86, 0xAA, 0xB7, 0x55, 0x55, 0x86, 0x55, 0xB7,
    0x2A, 0xAA, 0x86, 0x30, 0xFE, 0x02, 0x65, 0xA7, 0x00, 0x9D, 0x27, 0x9D,
    0x1E, 0xFE, 0x02, 0x65, 0xA6, 0x00, 0x2B, 0x20, 0x85, 0x20, 0x27, 0xF3,
    0x9D, 0x1B, 0xC6, 0xAA, 0xF7, 0x55, 0x55, 0xC6, 0x55, 0xF7, 0x2A, 0xAA,
    0xC6, 0xF0, 0xF7, 0x55, 0x55, 0x9D, 0x27, 0x86, 0x06, 0x97, 0x34, 0xCC,
    0x55, 0x00, 0x20, 0x07, 0x86, 0x06, 0x97, 0x34, 0xCC, 0xAA, 0x00, 0x3C,
    0x30, 0xED, 0x00, 0xC6, 0x02, 0x9D, 0x24, 0x38, 0x39, 0x48, 0x40, 0x00,
];

/// Bank selection + byte-program loop setup. Offset 157 (bank) patched.
const WRITE_BANK: [u8; 158] = [
    0xF7, 0xF1, 0x06, 0x02, 0x00, 0x3C, 0x30, 0x86, 0x06, 0x97, 0x34, 0xCC,
    0xAA, 0x00, 0xED, 0x00, 0xC6, 0x02, 0x9D, 0x24, 0x38, 0x39, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0xCE, 0x03, 0x00, 0x86, 0x20, 0xB7, 0x03,
    0x61, 0x18, 0xFE, 0x00, 0x36, 0x4F, 0xF6, 0x02, 0x98, 0xF7, 0x10, 0x00,
    0x9D, 0x1B, 0xC6, 0xAA, 0xF7, 0x55, 0x55, 0xC6, 0x55, 0xF7, 0x2A, 0xAA,
    0xC6, 0xA0, 0xF7, 0x55, 0x55, 0xE6, 0x00, 0x18, 0xE7, 0x00, 0x9D, 0x1E,
    0x9D, 0x27, 0xE6, 0x00, 0x37, 0x18, 0xE8, 0x00, 0x33, 0x2B, 0x0E, 0x18,
    0xE6, 0x00, 0xE1, 0x00, 0x27, 0x2D, 0x4C, 0x81, 0x0A, 0x23, 0xCB, 0x20,
    0x19, 0xC5, 0x20, 0x27, 0xE5, 0x3C, 0x9D, 0x1B, 0xC6, 0xAA, 0xF7, 0x55,
    0x55, 0xC6, 0x55, 0xF7, 0x2A, 0xAA, 0xC6, 0xF0, 0xF7, 0x55, 0x55, 0x9D,
    0x27, 0x38, 0x86, 0x10, 0x97, 0x34, 0xCC, 0x55, 0x00, 0xED, 0x00, 0xC6,
    0x02, 0x20, 0x13, 0x08, 0x18, 0x08, 0x7A, 0x03, 0x61, 0x26, 0x9A, 0x86,
    0x10, 0x97, 0x34, 0xCC, 0xAA, 0x00, 0xED, 0x00, 0xC6, 0x02, 0x9D, 0x24,
    0x39, 0x48,
];

/// On-chip checksum over all three banks. Declared payload is 139 bytes;
/// the four bytes past the stored template are zero.
const CHECKSUM_BIN: [u8; 138] = [
    0xF7, 0xE1, 0x06, 0x02, 0x00, 0x86, 0x01, 0xB7, 0x03, 0x63, 0x18, 0xCE,
    0x03, 0xE8, 0xCE, 0x20, 0x00, 0xCC, 0x00, 0x00, 0x37, 0xF6, 0x03, 0x63,
    0xC1, 0x04, 0x33, 0x2C, 0x3B, 0x36, 0x37, 0xB6, 0x03, 0x63, 0x81, 0x01,
    0x26, 0x07, 0xC6, 0x48, 0xF7, 0x10, 0x00, 0x20, 0x10, 0x81, 0x02, 0x26,
    0x07, 0xC6, 0x58, 0xF7, 0x10, 0x00, 0x20, 0x05, 0xC6, 0x50, 0xF7, 0x10,
    0x00, 0x33, 0x32, 0xEB, 0x00, 0x89, 0x00, 0x08, 0x26, 0x06, 0x7C, 0x03,
    0x63, 0xCE, 0x80, 0x00, 0x18, 0x09, 0x26, 0x06, 0x9D, 0x1E, 0x18, 0xCE,
    0x03, 0xE8, 0x20, 0xBC, 0x3C, 0xCE, 0x40, 0x00, 0xE0, 0x00, 0x82, 0x00,
    0x08, 0x8C, 0x40, 0x08, 0x25, 0xF6, 0x37, 0x36, 0xFD, 0x03, 0x64, 0xB1,
    0x40, 0x06, 0x26, 0x09, 0xF1, 0x40, 0x07, 0x26, 0x04, 0x86, 0xAA, 0x20,
    0x02, 0x86, 0x55, 0x36, 0x86, 0x06, 0x97, 0x34, 0x30, 0xC6, 0x04, 0x9D,
    0x24, 0x32, 0x32, 0x33, 0x38, 0x39,
];

/// Cleanup: the kernel transmits `0xBB`, clears RAM and spins until the
/// watchdog resets the controller.
const CLEANUP: [u8; 33] = [
    0xF7, 0x74, 0x06, 0x02, 0x00, 0x3C, 0x30, 0x86, 0x06, 0x97, 0x34, 0xCC,
    0xBB, 0x00, 0xED, 0x00, 0xC6, 0x02, 0x9D, 0x24, 0x38, 0xCE, 0x01, 0xFF,
    0x6F, 0x00, 0x09, 0x26, 0xFB, 0x6F, 0x00, 0x20, 0xFE,
];

/// Raw byte the cleanup kernel emits before the controller resets.
pub const CLEANUP_MARKER: u8 = 0xBB;

// Patch offsets, in wire (template) coordinates.
const BLOCK0_SPEED_PATCH: usize = 21;
const BLOCK1_SPEED_PATCH: usize = 166;
const ERASE_BANK_PATCH: usize = 105;
const ERASE_CODE_PATCH: usize = 106;
const WRITE_BANK_PATCH: usize = 157;

// SHA-256 digests of the unpatched blocks, checked before first use.
const BLOCK_DIGESTS: [&str; 3] = [
    "535f1faa078d9f8ce4d719d609912e1003d9e3cf4ef6bc0698244f0d92a72ba1",
    "41c76786b0690b36fe1ac21d53dbe53908b53f7df2833bf764c575d77f2c65f8",
    "b56e287fb9a4d06bd5cef9c93fd06b149c405a37b4249cd3ee0eaa23571eea9c",
];

/// Feature flags applied as byte patches before upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelFeatures {
    /// Stream reads at the fast SCI divisor.
    pub high_speed_read: bool,
}

/// Verify the baked-in digests of the three kernel blocks.
///
/// The result is computed once per process; corrupted machine code must
/// never reach controller RAM.
pub fn verify_integrity() -> Result<(), String> {
    static CHECK: OnceLock<Result<(), String>> = OnceLock::new();
    CHECK
        .get_or_init(|| {
            for (i, (block, expected)) in [
                EXEC_BLOCK_0.as_slice(),
                EXEC_BLOCK_1.as_slice(),
                EXEC_BLOCK_2.as_slice(),
            ]
            .into_iter()
            .zip(BLOCK_DIGESTS)
            .enumerate()
            {
                let digest = hex::encode(Sha256::digest(block));
                if digest != expected {
                    return Err(format!(
                        "kernel block {i} failed its integrity check: {digest}"
                    ));
                }
            }
            Ok(())
        })
        .clone()
}

/// The three upload templates with feature patches applied, in upload
/// order.
pub fn exec_blocks(features: KernelFeatures) -> [Vec<u8>; 3] {
    let mut b0 = EXEC_BLOCK_0.to_vec();
    let mut b1 = EXEC_BLOCK_1.to_vec();
    let b2 = EXEC_BLOCK_2.to_vec();
    if features.high_speed_read {
        b0[BLOCK0_SPEED_PATCH] = 0x81;
        b1[BLOCK1_SPEED_PATCH] = 0x80;
    } else {
        b0[BLOCK0_SPEED_PATCH] = 0x41;
        b1[BLOCK1_SPEED_PATCH] = 0x40;
    }
    [b0, b1, b2]
}

/// The chip-id template.
pub fn flash_info_frame() -> Vec<u8> {
    FLASH_INFO.to_vec()
}

/// The sector-erase template with bank and erase code patched in.
pub fn erase_frame(bank: u8, erase_code: u8) -> Vec<u8> {
    let mut f = ERASE_SECTOR.to_vec();
    f[ERASE_BANK_PATCH] = bank;
    f[ERASE_CODE_PATCH] = erase_code;
    f
}

/// The bank-select/program template with the bank patched in.
pub fn write_bank_frame(bank: u8) -> Vec<u8> {
    let mut f = WRITE_BANK.to_vec();
    f[WRITE_BANK_PATCH] = bank;
    f
}

/// The on-chip checksum template.
pub fn checksum_frame() -> Vec<u8> {
    CHECKSUM_BIN.to_vec()
}

/// The cleanup/reset template.
pub fn cleanup_frame() -> Vec<u8> {
    CLEANUP.to_vec()
}

// =============================================================================
// Template recognition (used by the virtual ECU)
// =============================================================================

/// What a mode-6 upload payload turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// Kernel block 0, 1 or 2.
    Block(usize),
    Primitive(KernelPrimitive),
}

/// A kernel primitive, with its patched parameters extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPrimitive {
    FlashInfo,
    EraseSector { bank: u8, erase_code: u8 },
    WriteBank { bank: u8 },
    Checksum,
    Cleanup,
}

/// Match a mode-6 payload (frame bytes after the mode byte, zero-padded
/// to the declared length) against the known templates, masking the
/// patched offsets.
pub fn match_upload(payload: &[u8]) -> Option<UploadKind> {
    fn matches(payload: &[u8], template: &[u8], declared: usize, masked: &[usize]) -> bool {
        if payload.len() != declared - HEADER_LEN {
            return false;
        }
        payload.iter().enumerate().all(|(i, &b)| {
            let wire = i + HEADER_LEN;
            masked.contains(&wire) || b == template.get(wire).copied().unwrap_or(0)
        })
    }

    let declared_len = |t: &[u8]| (t[1] as usize - 82) - 1; // wire bytes minus checksum

    for (k, block) in [
        EXEC_BLOCK_0.as_slice(),
        EXEC_BLOCK_1.as_slice(),
        EXEC_BLOCK_2.as_slice(),
    ]
    .into_iter()
    .enumerate()
    {
        let masked: &[usize] = match k {
            0 => &[BLOCK0_SPEED_PATCH],
            1 => &[BLOCK1_SPEED_PATCH],
            _ => &[],
        };
        if matches(payload, block, declared_len(block), masked) {
            return Some(UploadKind::Block(k));
        }
    }

    if matches(payload, &FLASH_INFO, declared_len(&FLASH_INFO), &[]) {
        return Some(UploadKind::Primitive(KernelPrimitive::FlashInfo));
    }
    if matches(
        payload,
        &ERASE_SECTOR,
        declared_len(&ERASE_SECTOR),
        &[ERASE_BANK_PATCH, ERASE_CODE_PATCH],
    ) {
        return Some(UploadKind::Primitive(KernelPrimitive::EraseSector {
            bank: payload[ERASE_BANK_PATCH - HEADER_LEN],
            erase_code: payload[ERASE_CODE_PATCH - HEADER_LEN],
        }));
    }
    if matches(payload, &WRITE_BANK, declared_len(&WRITE_BANK), &[WRITE_BANK_PATCH]) {
        return Some(UploadKind::Primitive(KernelPrimitive::WriteBank {
            bank: payload[WRITE_BANK_PATCH - HEADER_LEN],
        }));
    }
    if matches(payload, &CHECKSUM_BIN, declared_len(&CHECKSUM_BIN), &[]) {
        return Some(UploadKind::Primitive(KernelPrimitive::Checksum));
    }
    if matches(payload, &CLEANUP, declared_len(&CLEANUP), &[]) {
        return Some(UploadKind::Primitive(KernelPrimitive::Cleanup));
    }
    None
}
