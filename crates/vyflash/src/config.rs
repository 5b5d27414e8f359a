//! Session and transport configuration.
//!
//! Timing values default to what the real ALDL link tolerates; tests
//! against the virtual ECU usually zero the delays.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::protocol::DEVICE_ID;

/// Configuration for a flash session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// ALDL device id of the target controller.
    pub device_id: u8,
    /// Transport selection.
    pub transport: TransportConfig,
    /// Per-frame reply deadline in milliseconds.
    pub frame_timeout_ms: u64,
    /// Pause between consecutive transmitted frames.
    pub inter_frame_delay_ms: u64,
    /// Settling window used when waiting for bus silence before TX.
    pub silence_wait_ms: u64,
    /// Per-frame retry budget for the framer's `exchange`.
    pub frame_retries: u32,
    /// Reprogram attempts per mismatched byte before the sector fails.
    pub byte_retry_budget: u32,
    /// Bytes per flash write frame (clamped to 1..=64).
    pub chunk_size: usize,
    /// Patch the kernel for high-speed streaming reads.
    pub high_speed_read: bool,
    /// Rewrite a wrong image checksum instead of rejecting the image.
    pub auto_checksum_fix: bool,
    /// Cadence of mode 1 requests while datalogging.
    pub datalog_interval_ms: u64,
    /// Reply deadline for the sector-erase primitive.
    pub erase_timeout_ms: u64,
    /// Reply deadline for kernel block uploads.
    pub upload_timeout_ms: u64,
    /// Reply deadline for the on-chip checksum primitive.
    pub checksum_timeout_ms: u64,
    /// How long to listen for ECU chatter when connecting.
    pub heartbeat_timeout_ms: u64,
    /// Deadline for the cable echo probe.
    pub echo_probe_timeout_ms: u64,
    /// Settling time after the cleanup primitive resets the ECU.
    pub cleanup_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: DEVICE_ID,
            transport: TransportConfig::default(),
            frame_timeout_ms: 2000,
            inter_frame_delay_ms: 10,
            silence_wait_ms: 50,
            frame_retries: 10,
            byte_retry_budget: 10,
            chunk_size: 32,
            high_speed_read: false,
            auto_checksum_fix: false,
            datalog_interval_ms: 100,
            erase_timeout_ms: 30_000,
            upload_timeout_ms: 10_000,
            checksum_timeout_ms: 30_000,
            heartbeat_timeout_ms: 3000,
            echo_probe_timeout_ms: 500,
            cleanup_delay_ms: 750,
        }
    }
}

impl SessionConfig {
    /// Write frame payload size, clamped to what the kernel accepts.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, 64)
    }
}

// =============================================================================
// Transport configuration
// =============================================================================

/// Transport selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Standard serial port (COM port / VCP).
    Serial(SerialConfig),
    /// Platform-native serial port opened exclusively for lower latency.
    Direct(SerialConfig),
    /// In-memory wire that echoes everything written to it.
    Loopback,
    /// Simulated controller backed by the Am29F010 model.
    VirtualEcu(VirtualEcuConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::VirtualEcu(VirtualEcuConfig::default())
    }
}

/// Serial port configuration (8N1 framing is fixed by the protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name, e.g. `COM3` or `/dev/ttyUSB0`.
    pub port: String,
    /// Baud rate. The ALDL bus runs at 8192 baud.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: default_baud(),
        }
    }
}

fn default_baud() -> u32 {
    8192
}

/// Virtual ECU configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualEcuConfig {
    /// Optional 128 KiB (or 16 KiB calibration) image preloaded as the
    /// simulated flash contents. Blank flash (all `0xFF`) otherwise.
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    /// Seed handed out by the mode 13 handler.
    #[serde(default = "default_seed")]
    pub seed: u16,
}

impl Default for VirtualEcuConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            seed: default_seed(),
        }
    }
}

fn default_seed() -> u16 {
    0x4237
}
