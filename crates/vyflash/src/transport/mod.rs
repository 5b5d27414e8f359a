//! Byte-stream transports for the ALDL link.
//!
//! Four concrete adapters sit behind one capability set:
//! - [`SerialTransport`] — standard serial port (COM/VCP)
//! - [`SerialTransport`] in direct mode — platform-native port, opened
//!   exclusively for lower latency (the FTDI D2XX-style direct-driver
//!   path)
//! - [`LoopbackTransport`] — in-memory wire that echoes writes
//! - [`VirtualEcuTransport`] — simulated controller wrapping the
//!   Am29F010 model
//!
//! Transports move raw bytes only. The physical link is half-duplex, so
//! every write is followed by a self-echo; discarding it is the framer's
//! job, not the transport's.

mod error;
pub mod loopback;
pub mod serial;
pub mod vecu;

pub use error::TransportError;
pub use loopback::LoopbackTransport;
pub use serial::SerialTransport;
pub use vecu::VirtualEcuTransport;

use std::time::Instant;

use crate::config::TransportConfig;
use crate::image::Image;
use crate::sim::VirtualEcu;

/// Capability set shared by all transports.
pub trait Transport: Send {
    /// Open the underlying channel. Idempotent.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` bytes, failing with
    /// [`TransportError::Timeout`] once `deadline` passes.
    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> Result<(), TransportError>;

    /// Read whatever is pending without blocking.
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Best-effort synchronous write.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Discard pending input.
    fn drain(&mut self) -> Result<(), TransportError>;

    /// Close the channel. Further I/O fails.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Build a transport from configuration.
pub fn create_transport(config: &TransportConfig) -> Result<Box<dyn Transport>, TransportError> {
    match config {
        TransportConfig::Serial(cfg) => Ok(Box::new(SerialTransport::new(cfg.clone(), false))),
        TransportConfig::Direct(cfg) => Ok(Box::new(SerialTransport::new(cfg.clone(), true))),
        TransportConfig::Loopback => Ok(Box::new(LoopbackTransport::new())),
        TransportConfig::VirtualEcu(cfg) => {
            let ecu = match &cfg.image_path {
                Some(path) => {
                    let image = Image::load(path).map_err(|e| {
                        TransportError::InvalidConfig(format!(
                            "virtual ECU image {}: {e}",
                            path.display()
                        ))
                    })?;
                    VirtualEcu::with_image(&image, cfg.seed)
                }
                None => VirtualEcu::new(cfg.seed),
            };
            Ok(Box::new(VirtualEcuTransport::new(ecu)))
        }
    }
}
