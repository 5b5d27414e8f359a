//! Session state machine.
//!
//! A session owns its transport exclusively and walks a monotonic path:
//!
//! ```text
//! Idle --silence--> Silenced --authenticate--> Authenticated
//!      --enter_programming--> Programming --upload_kernel--> KernelResident
//!      --cleanup--> Idle
//! ```
//!
//! Operations are rejected outside their legal state. Transport,
//! protocol and authentication failures poison the session
//! ([`SessionState::Failed`]); after that only [`Session::close`] is
//! permitted. Flash failures leave the session in `KernelResident` so
//! the caller can retry the operation.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bank::{Sector, SECTORS};
use crate::config::SessionConfig;
use crate::error::{Error, FlashError, Result};
use crate::kernel::{self, KernelFeatures};
use crate::ops::EcuInfo;
use crate::progress::{CancelToken, Progress, ProgressMonitor, Stage};
use crate::protocol::{aldl_mode, seed_key, seed_to_key, Frame, Framer, ACK, NAK, READ_BLOCK_LEN};
use crate::report::WriteReport;
use crate::transport::Transport;

/// High-level session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Silenced,
    Authenticated,
    Programming,
    KernelResident,
    Failed,
}

pub struct Session {
    pub(crate) framer: Framer,
    pub(crate) config: SessionConfig,
    state: SessionState,
    /// Last bank value the kernel was told to program in.
    bank_shadow: Option<u8>,
    pub(crate) monitor: ProgressMonitor,
    pub(crate) cancel: CancelToken,
    pub(crate) busy: bool,
    pub(crate) last_report: Option<WriteReport>,
    pub(crate) cached_info: Option<EcuInfo>,
}

impl Session {
    /// Open a session over an externally constructed transport.
    ///
    /// Runs the heartbeat listen (informational) and the cable echo
    /// probe, which arms echo suppression for the rest of the session.
    pub fn open(config: SessionConfig, mut transport: Box<dyn Transport>) -> Result<Self> {
        transport.open()?;
        let mut framer = Framer::new(&config, transport);

        if !framer.detect_heartbeat(Duration::from_millis(config.heartbeat_timeout_ms))? {
            warn!("controller heartbeat not heard; continuing anyway");
        }
        framer.detect_echo(Duration::from_millis(config.echo_probe_timeout_ms))?;

        info!(echo = framer.echo_detected(), "session opened");
        Ok(Self {
            framer,
            config,
            state: SessionState::Idle,
            bank_shadow: None,
            monitor: ProgressMonitor::new(),
            cancel: CancelToken::new(),
            busy: false,
            last_report: None,
            cached_info: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token observed between frames and sectors; cancelling it stops
    /// the running operation at the next checkpoint.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Lock-free progress snapshot handle for observer threads.
    pub fn progress_monitor(&self) -> ProgressMonitor {
        self.monitor.clone()
    }

    /// Report of the most recent write operation, including failed and
    /// cancelled ones.
    pub fn last_report(&self) -> Option<&WriteReport> {
        self.last_report.as_ref()
    }

    /// Close the session and release the transport.
    pub fn close(mut self) {
        self.framer.close();
        info!("session closed");
    }

    // =========================================================================
    // Guards
    // =========================================================================

    fn expect_state(&self, expected: SessionState, op: &str) -> Result<()> {
        if self.state == SessionState::Failed {
            return Err(Error::Protocol(format!(
                "session failed; {op} not permitted, only close"
            )));
        }
        if self.state != expected {
            return Err(Error::Protocol(format!(
                "{op} not legal in {:?} (requires {:?})",
                self.state, expected
            )));
        }
        Ok(())
    }

    /// Record a fatal error, poisoning the session.
    pub(crate) fn note(&mut self, e: Error) -> Error {
        if e.is_fatal() {
            self.state = SessionState::Failed;
        }
        e
    }

    pub(crate) fn check_cancel(&mut self, sector: u8, offset: u32) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled { sector, offset })
        } else {
            Ok(())
        }
    }

    pub(crate) fn publish(&mut self, stage: Stage, done: u64, total: u64) {
        self.monitor.publish(Progress {
            stage,
            bytes_done: done,
            bytes_total: total,
        });
    }

    fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.config.frame_timeout_ms)
    }

    fn exchange(&mut self, frame: &Frame, timeout: Duration) -> Result<Frame> {
        let mode = frame.mode;
        let retries = self.config.frame_retries;
        match self.framer.exchange(frame, mode, retries, timeout) {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.note(e)),
        }
    }

    fn request(&mut self, mode: u8, payload: Vec<u8>) -> Frame {
        Frame::new(self.config.device_id, mode, payload)
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Mode 8: suppress the controller's normal bus chatter.
    pub fn silence(&mut self) -> Result<()> {
        self.expect_state(SessionState::Idle, "silence")?;
        let frame = self.request(aldl_mode::SILENCE, vec![]);
        self.exchange(&frame, self.frame_timeout())?;
        self.state = SessionState::Silenced;
        info!("bus chatter silenced");
        Ok(())
    }

    /// Mode 13 seed/key unlock. A zero seed means already unlocked.
    pub fn authenticate(&mut self) -> Result<()> {
        self.expect_state(SessionState::Silenced, "authenticate")?;

        let frame = self.request(aldl_mode::SEED_KEY, vec![seed_key::REQUEST_SEED]);
        let reply = self.exchange(&frame, self.frame_timeout())?;
        if reply.payload.len() < 3 || reply.payload[0] != seed_key::REQUEST_SEED {
            return Err(self.note(Error::Auth("malformed seed reply".into())));
        }
        let seed = u16::from_be_bytes([reply.payload[1], reply.payload[2]]);

        if seed == 0 {
            info!("zero seed: controller already unlocked");
            self.state = SessionState::Authenticated;
            return Ok(());
        }

        let key = seed_to_key(seed);
        debug!(seed = %format!("0x{seed:04X}"), key = %format!("0x{key:04X}"), "key derived");
        let [kh, kl] = key.to_be_bytes();
        let frame = self.request(aldl_mode::SEED_KEY, vec![seed_key::SUBMIT_KEY, kh, kl]);
        let reply = self.exchange(&frame, self.frame_timeout())?;
        match reply.payload.as_slice() {
            [seed_key::SUBMIT_KEY, status, ..] if *status == ACK => {
                self.state = SessionState::Authenticated;
                info!("security unlocked");
                Ok(())
            }
            [_, status, ..] => Err(self.note(Error::Auth(format!(
                "key rejected (status 0x{status:02X})"
            )))),
            _ => Err(self.note(Error::Auth("malformed key reply".into()))),
        }
    }

    /// Mode 5: switch the controller into programming mode.
    pub fn enter_programming(&mut self) -> Result<()> {
        self.expect_state(SessionState::Authenticated, "enter_programming")?;
        let frame = self.request(aldl_mode::ENTER_PROGRAMMING, vec![]);
        let reply = self.exchange(&frame, Duration::from_millis(5000))?;
        if reply.payload.first() != Some(&ACK) {
            // Typical cause on a live vehicle: it is moving.
            return Err(self.note(Error::Protocol(
                "programming mode refused by controller".into(),
            )));
        }
        self.state = SessionState::Programming;
        info!("programming mode active");
        Ok(())
    }

    /// Mode 6 x 3: upload the kernel blocks, patched per `features`.
    pub fn upload_kernel(&mut self, features: KernelFeatures) -> Result<()> {
        self.expect_state(SessionState::Programming, "upload_kernel")?;
        kernel::verify_integrity().map_err(Error::Validation)?;

        let blocks = kernel::exec_blocks(features);
        let timeout = Duration::from_millis(self.config.upload_timeout_ms);
        for (i, block) in blocks.iter().enumerate() {
            self.publish(Stage::KernelUpload, i as u64, blocks.len() as u64);
            let frame = Frame::from_template(block)?;
            let reply = self.exchange(&frame, timeout)?;
            if reply.payload.first() != Some(&ACK) {
                return Err(self.note(Error::Protocol(format!(
                    "kernel block {i} rejected"
                ))));
            }
        }
        self.publish(Stage::KernelUpload, 3, 3);
        self.state = SessionState::KernelResident;
        info!(high_speed = features.high_speed_read, "flash kernel resident");
        Ok(())
    }

    // =========================================================================
    // Kernel-mediated operations
    // =========================================================================

    /// Erase one sector through the kernel. One full retry on a
    /// reported erase timeout, then [`FlashError::EraseFailed`].
    pub fn erase_sector(&mut self, index: u8) -> Result<()> {
        self.expect_state(SessionState::KernelResident, "erase_sector")?;
        let sector: &Sector = SECTORS
            .get(index as usize)
            .ok_or_else(|| Error::Validation(format!("no sector {index}")))?;

        let timeout = Duration::from_millis(self.config.erase_timeout_ms);
        for attempt in 1..=2u8 {
            let frame = Frame::from_template(&kernel::erase_frame(sector.bank, sector.erase_code))?;
            let reply = self.exchange(&frame, timeout)?;
            match reply.payload.first() {
                Some(&ACK) => {
                    debug!(sector = index, attempt, "sector erased");
                    return Ok(());
                }
                Some(&NAK) => {
                    warn!(sector = index, attempt, "erase reported timeout");
                }
                _ => {
                    return Err(self.note(Error::Protocol(format!(
                        "unexpected erase reply for sector {index}"
                    ))))
                }
            }
        }
        Err(FlashError::EraseFailed { sector: index }.into())
    }

    /// Point the kernel's program loop at a bank. Sent only on bank
    /// transitions; the shadow tracks the last value.
    pub fn select_bank(&mut self, bank: u8) -> Result<()> {
        self.expect_state(SessionState::KernelResident, "select_bank")?;
        if self.bank_shadow == Some(bank) {
            return Ok(());
        }
        let frame = Frame::from_template(&kernel::write_bank_frame(bank))?;
        let timeout = Duration::from_millis(self.config.upload_timeout_ms);
        let reply = self.exchange(&frame, timeout)?;
        if reply.payload.first() != Some(&ACK) {
            return Err(self.note(Error::Protocol(format!(
                "bank 0x{bank:02X} setup rejected"
            ))));
        }
        self.bank_shadow = Some(bank);
        debug!(bank = %format!("0x{bank:02X}"), "write bank selected");
        Ok(())
    }

    /// Program a chunk at a file offset through a mode 16 frame.
    ///
    /// Returns `false` when the kernel's own post-program verify
    /// reported a mismatch; byte-level recovery is the caller's job.
    pub fn program_chunk(&mut self, file_offset: u32, data: &[u8]) -> Result<bool> {
        self.expect_state(SessionState::KernelResident, "program_chunk")?;
        let banked = crate::bank::file_to_cpu(file_offset).ok_or_else(|| {
            Error::Validation(format!("offset 0x{file_offset:05X} outside the image"))
        })?;
        self.select_bank(banked.bank)?;

        let mut payload = Vec::with_capacity(3 + data.len());
        payload.push(0x00);
        payload.extend_from_slice(&banked.cpu.to_be_bytes());
        payload.extend_from_slice(data);
        let frame = self.request(aldl_mode::FLASH_WRITE, payload);
        let reply = self.exchange(&frame, Duration::from_millis(5000))?;
        match reply.payload.first() {
            Some(&ACK) => Ok(true),
            Some(&NAK) => Ok(false),
            _ => Err(self.note(Error::Protocol(format!(
                "unexpected flash write reply at 0x{file_offset:05X}"
            )))),
        }
    }

    /// Read one 64-byte block at a file offset through the kernel's
    /// mode 9 stream-read.
    pub fn read_block(&mut self, file_offset: u32) -> Result<Vec<u8>> {
        self.expect_state(SessionState::KernelResident, "read_block")?;
        let addr = file_offset.to_be_bytes();
        let frame = self.request(aldl_mode::RAM_READ, vec![addr[1], addr[2], addr[3]]);
        let reply = self.exchange(&frame, self.frame_timeout())?;
        if reply.payload.len() != READ_BLOCK_LEN {
            return Err(self.note(Error::Protocol(format!(
                "short read at 0x{file_offset:05X}: {} bytes",
                reply.payload.len()
            ))));
        }
        Ok(reply.payload)
    }

    /// Run the kernel's on-chip checksum primitive.
    ///
    /// Returns `(matches_stored, computed_word)`.
    pub fn run_checksum(&mut self) -> Result<(bool, u16)> {
        self.expect_state(SessionState::KernelResident, "run_checksum")?;
        let frame = Frame::from_template(&kernel::checksum_frame())?;
        let timeout = Duration::from_millis(self.config.checksum_timeout_ms);
        let reply = self.exchange(&frame, timeout)?;
        match reply.payload.as_slice() {
            [status, hi, lo, ..] => {
                let word = u16::from_be_bytes([*hi, *lo]);
                Ok((*status == ACK, word))
            }
            _ => Err(self.note(Error::Protocol("malformed checksum reply".into()))),
        }
    }

    /// Read the flash chip's manufacturer/device id pair.
    pub fn read_flash_info(&mut self) -> Result<(u8, u8)> {
        self.expect_state(SessionState::KernelResident, "read_flash_info")?;
        let frame = Frame::from_template(&kernel::flash_info_frame())?;
        let timeout = Duration::from_millis(self.config.upload_timeout_ms);
        let reply = self.exchange(&frame, timeout)?;
        match reply.payload.as_slice() {
            [manuf, device, ..] => Ok((*manuf, *device)),
            _ => Err(self.note(Error::Protocol("malformed flash info reply".into()))),
        }
    }

    /// Upload the cleanup routine: the kernel acknowledges with a raw
    /// marker byte, clears RAM and lets the watchdog reset the
    /// controller. Idempotent and best-effort; always lands in `Idle`.
    pub fn cleanup(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle => return Ok(()),
            SessionState::Failed => {
                return Err(Error::Protocol("session failed; only close permitted".into()))
            }
            SessionState::Silenced | SessionState::Authenticated => {
                // No kernel to run; the controller un-silences itself
                // once chatter resumes.
                self.framer.drain()?;
                self.state = SessionState::Idle;
                return Ok(());
            }
            SessionState::Programming | SessionState::KernelResident => {}
        }

        self.publish(Stage::Cleanup, 0, 1);
        let frame = Frame::from_template(&kernel::cleanup_frame())?;
        if let Err(e) = self.framer.send(&frame) {
            warn!(error = %e, "cleanup send failed; controller will watchdog-reset");
        } else {
            let marker = self
                .framer
                .read_raw(2, self.frame_timeout())
                .unwrap_or_default();
            if marker.first() != Some(&kernel::CLEANUP_MARKER) {
                warn!("cleanup marker not observed");
            }
        }
        if self.config.cleanup_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.cleanup_delay_ms));
        }
        self.framer.drain()?;
        self.bank_shadow = None;
        self.state = SessionState::Idle;
        self.publish(Stage::Cleanup, 1, 1);
        info!("controller reset, session idle");
        Ok(())
    }
}
