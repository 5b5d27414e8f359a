//! Error taxonomy for the flash core.
//!
//! Layering follows the transport/protocol/session split: the transport
//! has its own error type, the framer absorbs frame and timeout errors
//! within its retry budget, and everything that escapes to the caller is
//! an [`Error`]. Flash errors are fatal to the running operation but not
//! to the session; transport, protocol and authentication errors are
//! fatal to the session.

use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

/// Frame-level decode/encode failures. Retried by the framer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame checksum mismatch (sum 0x{sum:02X})")]
    Checksum { sum: u8 },

    #[error("unexpected device id 0x{got:02X} (expected 0x{expected:02X})")]
    DeviceId { expected: u8, got: u8 },

    #[error("invalid length byte 0x{0:02X}")]
    Length(u8),

    #[error("frame truncated: declared {declared} wire bytes, got {got}")]
    Truncated { declared: usize, got: usize },

    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
}

/// Failures reported by the NOR flash layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("sector {sector} erase failed")]
    EraseFailed { sector: u8 },

    #[error("program mismatch at 0x{offset:05X}: wrote 0x{expected:02X}, read 0x{found:02X}")]
    ProgramMismatch {
        offset: u32,
        expected: u8,
        found: u8,
    },

    #[error("flash checksum mismatch: expected 0x{expected:04X}, chip reported 0x{found:04X}")]
    ChecksumMismatch { expected: u16, found: u16 },
}

/// Top-level error surfaced by session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure, port gone, device disconnected. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed frame that survived the retry budget.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// No usable reply within the deadline, retry budget exhausted.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unexpected reply, invalid sequence or state violation. Fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Seed/key exchange failed. Fatal.
    #[error("security unlock failed: {0}")]
    Auth(String),

    /// NOR-layer failure. Fatal to the operation, not the session.
    #[error(transparent)]
    Flash(#[from] FlashError),

    /// Image length, image checksum or mode invariant violated.
    /// Reported before any device I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// Cooperative cancellation observed between frames.
    #[error("cancelled at sector {sector}, offset 0x{offset:05X}")]
    Cancelled { sector: u8, offset: u32 },

    /// Another operation already owns this session.
    #[error("session busy: an operation is already in progress")]
    Busy,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error poisons the session (only `close` remains legal).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Frame(_)
                | Error::Timeout(_)
                | Error::Protocol(_)
                | Error::Auth(_)
        )
    }
}
