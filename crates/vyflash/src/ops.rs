//! High-level flash operations: full read, mode-scoped write with
//! per-sector verification, controller identification, and the datalog
//! stream.
//!
//! Every operation starts and ends in `Idle` on success (the cleanup
//! primitive resets the controller). Flash failures and cancellation
//! leave the session in `KernelResident` with a partially programmed
//! chip; the caller can retry the operation or run
//! [`Session::cleanup`]. The write path never rewrites data it cannot
//! first re-verify.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::bank::{Sector, WriteMode, SECTORS};
use crate::chip::CHIP_ID_AM29F010;
use crate::datalog::{DatalogHandle, DatalogRow};
use crate::error::{Error, FlashError, Result};
use crate::image::{Image, IMAGE_SIZE};
use crate::kernel::KernelFeatures;
use crate::progress::{Progress, Stage};
use crate::protocol::{aldl_mode, READ_BLOCK_LEN};
use crate::report::{WriteOutcome, WriteReport};
use crate::session::{Session, SessionState};

/// Identification data gathered from a live controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuInfo {
    pub flash_manufacturer: u8,
    pub flash_device: u8,
    /// Marketing name when the id pair is a known part.
    pub flash_name: Option<&'static str>,
    /// OS id bytes at file `0x2000`, formatted like `$060A`.
    pub os_id: String,
}

/// Name a flash id pair, when known.
pub fn flash_chip_name(manufacturer: u8, device: u8) -> Option<&'static str> {
    match (manufacturer, device) {
        CHIP_ID_AM29F010 => Some("AMD Am29F010 (128 KiB)"),
        (0x01, 0xA4) => Some("AMD Am29F040 (512 KiB)"),
        (0x31, 0xB4) => Some("CAT28F010 (128 KiB)"),
        _ => None,
    }
}

type ProgressFn<'a> = &'a mut dyn FnMut(Progress);

impl Session {
    fn begin_op(&mut self) -> Result<()> {
        if self.busy {
            return Err(Error::Busy);
        }
        self.busy = true;
        self.cancel.reset();
        Ok(())
    }

    fn emit(&mut self, progress: ProgressFn<'_>, stage: Stage, done: u64, total: u64) {
        self.publish(stage, done, total);
        progress(Progress {
            stage,
            bytes_done: done,
            bytes_total: total,
        });
    }

    /// Walk Idle -> KernelResident. A session already holding a resident
    /// kernel (after a flash failure, a cancellation, or a manual
    /// handshake) is reused as-is.
    fn bring_up_kernel(&mut self, progress: ProgressFn<'_>) -> Result<()> {
        match self.state() {
            SessionState::KernelResident => {
                // The kernel may have been brought up through the
                // session's own handshake methods, in which case
                // identification has not run yet.
                if self.cached_info.is_none() {
                    self.identify()?;
                }
                return Ok(());
            }
            SessionState::Idle => {}
            other => {
                return Err(Error::Protocol(format!(
                    "operation must start from Idle, session is {other:?}"
                )))
            }
        }

        self.emit(progress, Stage::Handshake, 0, 3);
        self.silence()?;
        self.emit(progress, Stage::Handshake, 1, 3);
        self.authenticate()?;
        self.emit(progress, Stage::Handshake, 2, 3);
        self.enter_programming()?;
        self.emit(progress, Stage::Handshake, 3, 3);

        self.upload_kernel(KernelFeatures {
            high_speed_read: self.config.high_speed_read,
        })?;

        self.identify()
    }

    /// Query the flash chip id and OS id through the resident kernel
    /// and cache the result.
    fn identify(&mut self) -> Result<()> {
        let (manuf, device) = self.read_flash_info()?;
        let name = flash_chip_name(manuf, device);
        match name {
            Some(name) => info!(name, "flash chip identified"),
            None => warn!(
                manufacturer = %format!("0x{manuf:02X}"),
                device = %format!("0x{device:02X}"),
                "unknown flash chip"
            ),
        }
        let id_block = self.read_block(0x2000)?;
        self.cached_info = Some(EcuInfo {
            flash_manufacturer: manuf,
            flash_device: device,
            flash_name: name,
            os_id: format!("${:02X}{:02X}", id_block[0], id_block[1]),
        });
        Ok(())
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Read the full 128 KiB image, streaming file offsets in ascending
    /// order through the kernel.
    pub fn read_image(&mut self, progress: ProgressFn<'_>) -> Result<Image> {
        self.begin_op()?;
        let result = self.read_image_inner(progress);
        self.busy = false;
        result
    }

    fn read_image_inner(&mut self, progress: ProgressFn<'_>) -> Result<Image> {
        let started = Instant::now();
        self.bring_up_kernel(progress)?;

        let mut image = Image::blank();
        let total = IMAGE_SIZE as u64;
        let mut offset = 0u32;
        while (offset as usize) < IMAGE_SIZE {
            self.check_cancel((offset / Sector::SIZE) as u8, offset)?;
            let block = self.read_block(offset)?;
            image.as_bytes_mut()[offset as usize..offset as usize + READ_BLOCK_LEN]
                .copy_from_slice(&block);
            offset += READ_BLOCK_LEN as u32;
            if offset % 0x1000 == 0 {
                self.emit(progress, Stage::Read, offset as u64, total);
            }
        }
        self.emit(progress, Stage::Read, total, total);

        self.cleanup()?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "full read complete"
        );
        Ok(image)
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Write `image` to the controller within the bounds of `mode`.
    ///
    /// Validation (image checksum) happens before any device I/O. The
    /// resulting report is also retained in [`Session::last_report`],
    /// including for failed and cancelled runs.
    pub fn write_image(
        &mut self,
        mode: WriteMode,
        image: &Image,
        progress: ProgressFn<'_>,
    ) -> Result<WriteReport> {
        self.begin_op()?;

        // Pre-flight validation, before any device I/O.
        let mut work;
        let image = if image.verify_checksum() {
            image
        } else if self.config.auto_checksum_fix {
            work = image.clone();
            let (old, new) = work.fix_checksum();
            warn!(
                old = %format!("0x{old:04X}"),
                new = %format!("0x{new:04X}"),
                "image checksum rewritten"
            );
            &work
        } else {
            self.busy = false;
            return Err(Error::Validation(format!(
                "image checksum 0x{:04X} does not match computed 0x{:04X}",
                image.stored_checksum(),
                image.compute_checksum()
            )));
        };

        let started = Instant::now();
        let mut report = WriteReport::new(mode, image.stored_checksum());
        let result = self.write_image_inner(mode, image, &mut report, progress);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report.outcome = match &result {
            Ok(()) => WriteOutcome::Completed,
            Err(Error::Cancelled { .. }) => WriteOutcome::Cancelled,
            Err(e) => WriteOutcome::Failed {
                error: e.to_string(),
            },
        };
        self.last_report = Some(report.clone());
        self.busy = false;
        result.map(|()| report)
    }

    fn write_image_inner(
        &mut self,
        mode: WriteMode,
        image: &Image,
        report: &mut WriteReport,
        progress: ProgressFn<'_>,
    ) -> Result<()> {
        self.bring_up_kernel(progress)?;

        // Erase phase, ascending.
        let sectors = mode.erase_sectors();
        for (i, &index) in sectors.iter().enumerate() {
            self.check_cancel(index, SECTORS[index as usize].file_start)?;
            self.emit(progress, Stage::Erase, i as u64, sectors.len() as u64);
            self.erase_sector(index)?;
            report.sectors_erased.push(index);
            report.last_sector = Some(index);
        }
        self.emit(progress, Stage::Erase, sectors.len() as u64, sectors.len() as u64);

        // Program + verify, sector by sector. The bank register is set
        // once per bank transition inside program_chunk.
        let range = mode.write_range();
        let chunk_size = self.config.effective_chunk_size();
        let total: u64 = (range.end - range.start) as u64;

        for &index in sectors {
            let sector = &SECTORS[index as usize];
            let start = sector.file_range().start.max(range.start);
            let end = sector.file_range().end.min(range.end);
            if start >= end {
                continue;
            }

            let mut offset = start;
            while offset < end {
                self.check_cancel(index, offset)?;
                let len = chunk_size.min((end - offset) as usize);
                let data = &image.as_bytes()[offset as usize..offset as usize + len];
                if !self.program_chunk(offset, data)? {
                    // The kernel saw a mismatch mid-chunk; the sector
                    // verify pass recovers byte by byte.
                    warn!(
                        offset = %format!("0x{offset:05X}"),
                        "write frame reported mismatch, deferring to verify"
                    );
                }
                offset += len as u32;
                report.bytes_written += len as u64;
                report.last_sector = Some(index);
                report.last_offset = Some(offset);
                self.emit(
                    progress,
                    Stage::Program,
                    report.bytes_written,
                    total,
                );
            }

            self.verify_sector(image, index, start, end, report, progress)?;
            report.sectors_verified.push(index);
        }

        // Final on-chip checksum against the image's embedded word.
        self.emit(progress, Stage::Checksum, 0, 1);
        let (matches, word) = self.run_checksum()?;
        report.chip_checksum = Some(word);
        if !matches || word != image.stored_checksum() {
            return Err(FlashError::ChecksumMismatch {
                expected: image.stored_checksum(),
                found: word,
            }
            .into());
        }
        self.emit(progress, Stage::Checksum, 1, 1);

        self.cleanup()?;
        info!(mode = %mode, bytes = report.bytes_written, "write complete");
        Ok(())
    }

    /// Read back one programmed span and reprogram mismatched bytes,
    /// up to the per-byte retry budget.
    fn verify_sector(
        &mut self,
        image: &Image,
        sector: u8,
        start: u32,
        end: u32,
        report: &mut WriteReport,
        progress: ProgressFn<'_>,
    ) -> Result<()> {
        let mut offset = start;
        while offset < end {
            self.check_cancel(sector, offset)?;
            let block = self.read_block(offset)?;
            let span = READ_BLOCK_LEN.min((end - offset) as usize);
            for i in 0..span {
                let abs = offset + i as u32;
                let want = image.as_bytes()[abs as usize];
                if block[i] != want {
                    self.reprogram_byte(abs, want, block[i], report)?;
                }
            }
            offset += span as u32;
            self.emit(
                progress,
                Stage::Verify,
                (offset - start) as u64,
                (end - start) as u64,
            );
        }
        Ok(())
    }

    fn reprogram_byte(
        &mut self,
        offset: u32,
        want: u8,
        mut found: u8,
        report: &mut WriteReport,
    ) -> Result<()> {
        warn!(
            offset = %format!("0x{offset:05X}"),
            want = %format!("0x{want:02X}"),
            found = %format!("0x{found:02X}"),
            "verify mismatch, reprogramming byte"
        );
        for _ in 0..self.config.byte_retry_budget {
            report.byte_retries += 1;
            let acked = self.program_chunk(offset, &[want])?;
            found = self.read_block(offset)?[0];
            if acked && found == want {
                return Ok(());
            }
        }
        Err(FlashError::ProgramMismatch {
            offset,
            expected: want,
            found,
        }
        .into())
    }

    // =========================================================================
    // Info
    // =========================================================================

    /// Identify the controller: flash chip id pair and OS id.
    ///
    /// Served from cache when a previous operation already gathered it;
    /// otherwise runs a full handshake/kernel/cleanup cycle.
    pub fn info(&mut self, progress: ProgressFn<'_>) -> Result<EcuInfo> {
        if let Some(info) = &self.cached_info {
            return Ok(info.clone());
        }
        self.begin_op()?;
        let result = (|| {
            self.bring_up_kernel(progress)?;
            let info = self.cached_info.clone().ok_or_else(|| {
                Error::Protocol("controller identification missing after kernel bring-up".into())
            })?;
            self.cleanup()?;
            Ok(info)
        })();
        self.busy = false;
        result
    }

    // =========================================================================
    // Datalog
    // =========================================================================

    /// Start the mode 1 datalog stream on a dedicated worker that owns
    /// the session for its lifetime.
    ///
    /// Only available before silence (`Idle`); datalogging and
    /// programming are mutually exclusive. On a state violation the
    /// session is handed back alongside the error.
    pub fn datalog(
        mut self,
        mut sink: Box<dyn FnMut(DatalogRow) + Send>,
    ) -> std::result::Result<DatalogHandle, (Session, Error)> {
        if self.state() != SessionState::Idle {
            let state = self.state();
            return Err((
                self,
                Error::Protocol(format!("datalog requires Idle, session is {state:?}")),
            ));
        }
        if self.busy {
            return Err((self, Error::Busy));
        }

        self.cancel.reset();
        let cancel = self.cancel.clone();
        let handle_token = cancel.clone();
        let interval = Duration::from_millis(self.config.datalog_interval_ms);

        let worker = std::thread::Builder::new()
            .name("vyflash-datalog".into())
            .spawn(move || {
                info!("datalog stream started");
                self.publish(Stage::Datalog, 0, 0);
                let mut samples = 0u64;
                while !cancel.is_cancelled() {
                    match self.poll_datalog() {
                        Ok(Some(row)) => {
                            samples += 1;
                            self.publish(Stage::Datalog, samples, 0);
                            sink(row);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "datalog stream stopping");
                            break;
                        }
                    }
                    if !interval.is_zero() {
                        std::thread::sleep(interval);
                    }
                }
                self.publish(Stage::Idle, 0, 0);
                info!(samples, "datalog stream stopped");
                self
            })
            .expect("spawning the datalog worker");

        Ok(DatalogHandle {
            cancel: handle_token,
            worker,
        })
    }

    fn poll_datalog(&mut self) -> Result<Option<DatalogRow>> {
        let frame = crate::protocol::Frame::new(
            self.config.device_id,
            aldl_mode::DATALOG,
            vec![0x00],
        );
        match self.framer.exchange(
            &frame,
            aldl_mode::DATALOG,
            2,
            Duration::from_millis(self.config.frame_timeout_ms),
        ) {
            Ok(reply) => Ok(DatalogRow::decode(&reply.payload)),
            Err(Error::Timeout(_)) => Ok(None),
            Err(e) => Err(self.note(e)),
        }
    }
}
