//! Virtual ECU: simulates the controller side of every ALDL mode the
//! flash pipeline exercises, with the [`Am29F010`] model as its flash.
//!
//! Mode-6 payloads are matched against the kernel templates. The three
//! kernel blocks accumulate at their declared RAM addresses; primitives
//! (chip id, erase, bank write, checksum, cleanup) execute only once the
//! whole kernel is resident, and drive the chip model through the same
//! unlock/program/poll cycles the real kernel performs, including DQ6
//! status polling and DQ5 timeout handling.
//!
//! Fault-injection knobs (corrupt replies, erase timeout, stuck bits,
//! key rejection) exist for the retry and recovery tests.

use tracing::{debug, trace};

use crate::bank;
use crate::chip::{Am29F010, CHIP_ID_AM29F010};
use crate::datalog::REPLY_LEN;
use crate::image::{self, Image, CHECKSUM_OFFSET};
use crate::kernel::{self, KernelPrimitive, UploadKind, CLEANUP_MARKER};
use crate::protocol::{aldl_mode, seed_key, seed_to_key, Frame, ACK, NAK};

/// Internal RAM size of the 68HC11F1.
const RAM_SIZE: usize = 0x0400;

pub struct VirtualEcu {
    device_id: u8,
    chip: Am29F010,
    ram: Vec<u8>,
    seed: u16,
    silenced: bool,
    unlocked: bool,
    programming: bool,
    blocks_resident: [bool; 3],
    write_bank: Option<u8>,

    // Fault injection
    corrupt_replies: u32,
    reject_key: bool,

    // Counters for tests and diagnostics
    pub frames_received: u64,
    pub flash_write_frames: u64,
    pub bytes_programmed: u64,
    pub sector_erases: u64,
}

impl VirtualEcu {
    /// A controller with blank (erased) flash.
    pub fn new(seed: u16) -> Self {
        Self::build(Am29F010::new(), seed)
    }

    /// A controller whose flash holds `image`.
    pub fn with_image(image: &Image, seed: u16) -> Self {
        Self::build(Am29F010::with_data(image.as_bytes()), seed)
    }

    fn build(chip: Am29F010, seed: u16) -> Self {
        Self {
            device_id: crate::protocol::DEVICE_ID,
            chip,
            ram: vec![0u8; RAM_SIZE],
            seed,
            silenced: false,
            unlocked: false,
            programming: false,
            blocks_resident: [false; 3],
            write_bank: None,
            corrupt_replies: 0,
            reject_key: false,
            frames_received: 0,
            flash_write_frames: 0,
            bytes_programmed: 0,
            sector_erases: 0,
        }
    }

    /// Simulated flash contents.
    pub fn flash(&self) -> &[u8] {
        self.chip.cells()
    }

    /// Direct access to the chip model for fault injection.
    pub fn chip_mut(&mut self) -> &mut Am29F010 {
        &mut self.chip
    }

    pub fn kernel_resident(&self) -> bool {
        self.blocks_resident.iter().all(|&b| b)
    }

    pub fn silenced(&self) -> bool {
        self.silenced
    }

    pub fn unlocked(&self) -> bool {
        self.unlocked
    }

    /// Corrupt the checksum of the next `n` framed replies.
    pub fn corrupt_next_replies(&mut self, n: u32) {
        self.corrupt_replies = n;
    }

    /// Reject the next key submission regardless of its value.
    pub fn reject_next_key(&mut self) {
        self.reject_key = true;
    }

    /// An unsolicited chatter frame, as heard on an idle bus.
    pub fn heartbeat_frame(&self) -> Vec<u8> {
        Frame::new(self.device_id, aldl_mode::DATALOG, self.datalog_record())
            .encode()
            .expect("datalog record fits a frame")
    }

    // =========================================================================
    // Frame dispatch
    // =========================================================================

    /// Process one wire frame; `None` means no reply (noise, foreign
    /// device, or an unframed situation the controller ignores).
    pub fn process_frame(&mut self, wire: &[u8]) -> Option<Vec<u8>> {
        let frame = match Frame::decode(wire) {
            Ok(f) => f,
            Err(e) => {
                trace!(error = %e, "vECU ignoring undecodable bytes");
                return None;
            }
        };
        if frame.device_id != self.device_id {
            return None;
        }
        self.frames_received += 1;

        let reply = match frame.mode {
            aldl_mode::SILENCE => self.on_silence(),
            aldl_mode::DATALOG => self.on_datalog(),
            aldl_mode::PEEK_SHORT => self.on_peek_short(&frame.payload),
            aldl_mode::PEEK_LONG => self.on_peek_long(&frame.payload),
            aldl_mode::ACTUATOR => Some((aldl_mode::ACTUATOR, vec![ACK])),
            aldl_mode::SEED_KEY => self.on_seed_key(&frame.payload),
            aldl_mode::ENTER_PROGRAMMING => self.on_enter_programming(),
            aldl_mode::UPLOAD => return self.on_upload(&frame.payload),
            aldl_mode::RAM_READ => self.on_ram_read(&frame.payload),
            aldl_mode::RAM_WRITE => self.on_ram_write(&frame.payload),
            aldl_mode::FLASH_WRITE => self.on_flash_write(&frame.payload),
            other => {
                debug!(mode = %format!("0x{other:02X}"), "vECU: unhandled mode");
                None
            }
        };

        reply.map(|(mode, payload)| self.encode_reply(mode, payload))
    }

    fn encode_reply(&mut self, mode: u8, payload: Vec<u8>) -> Vec<u8> {
        let mut wire = Frame::new(self.device_id, mode, payload)
            .encode()
            .expect("reply payload fits a frame");
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            *wire.last_mut().unwrap() ^= 0xFF;
        }
        wire
    }

    // =========================================================================
    // Mode handlers
    // =========================================================================

    fn on_silence(&mut self) -> Option<(u8, Vec<u8>)> {
        self.silenced = true;
        Some((aldl_mode::SILENCE, vec![]))
    }

    fn on_datalog(&self) -> Option<(u8, Vec<u8>)> {
        Some((aldl_mode::DATALOG, self.datalog_record()))
    }

    fn datalog_record(&self) -> Vec<u8> {
        let mut d = vec![0u8; REPLY_LEN];
        d[0] = 0x00;
        d[1] = 0x20; // 800 RPM
        d[5] = 120; // ECT 50 degC
        d[13] = 25; // ~10 % throttle
        d[29] = 140; // 14.0 V
        d[36] = self.chip.cells()[0x2000];
        d[37] = self.chip.cells()[0x2001];
        d[42] = 30; // IAC steps
        d
    }

    fn on_peek_short(&mut self, payload: &[u8]) -> Option<(u8, Vec<u8>)> {
        if payload.len() < 2 {
            return None;
        }
        let addr = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let block = (0..crate::protocol::READ_BLOCK_LEN)
            .map(|i| self.ram.get(addr + i).copied().unwrap_or(0))
            .collect();
        Some((aldl_mode::PEEK_SHORT, block))
    }

    fn on_peek_long(&mut self, payload: &[u8]) -> Option<(u8, Vec<u8>)> {
        if payload.len() < 3 {
            return None;
        }
        let addr = u32::from_be_bytes([0, payload[0], payload[1], payload[2]]);
        Some((aldl_mode::PEEK_LONG, self.read_flash_block(addr)))
    }

    fn on_seed_key(&mut self, payload: &[u8]) -> Option<(u8, Vec<u8>)> {
        match payload.first() {
            Some(&seed_key::REQUEST_SEED) => {
                // A zero seed is how the controller reports that
                // security is not engaged; no key is expected.
                if self.seed == 0 {
                    self.unlocked = true;
                }
                let [hi, lo] = self.seed.to_be_bytes();
                Some((aldl_mode::SEED_KEY, vec![seed_key::REQUEST_SEED, hi, lo]))
            }
            Some(&seed_key::SUBMIT_KEY) if payload.len() >= 3 => {
                let key = u16::from_be_bytes([payload[1], payload[2]]);
                let expected = seed_to_key(self.seed);
                let accepted = !std::mem::take(&mut self.reject_key) && key == expected;
                if accepted {
                    self.unlocked = true;
                    debug!("vECU: security unlocked");
                }
                let status = if accepted { ACK } else { 0x00 };
                Some((aldl_mode::SEED_KEY, vec![seed_key::SUBMIT_KEY, status]))
            }
            _ => None,
        }
    }

    fn on_enter_programming(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.silenced && self.unlocked {
            self.programming = true;
            Some((aldl_mode::ENTER_PROGRAMMING, vec![ACK]))
        } else {
            Some((aldl_mode::ENTER_PROGRAMMING, vec![NAK]))
        }
    }

    /// Mode 6: kernel blocks, kernel primitives, or plain RAM uploads.
    ///
    /// Returns the full wire reply because cleanup answers with an
    /// unframed marker byte.
    fn on_upload(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if !self.programming {
            return Some(self.encode_reply(aldl_mode::UPLOAD, vec![NAK]));
        }

        match kernel::match_upload(payload) {
            Some(UploadKind::Block(k)) => {
                let addr = kernel::BLOCK_LOAD_ADDRS[k] as usize;
                let end = (addr + payload.len()).min(self.ram.len());
                self.ram[addr..end].copy_from_slice(&payload[..end - addr]);
                self.blocks_resident[k] = true;
                debug!(block = k, "vECU: kernel block resident");
                Some(self.encode_reply(aldl_mode::UPLOAD, vec![ACK]))
            }
            Some(UploadKind::Primitive(p)) => {
                if !self.kernel_resident() {
                    debug!(?p, "vECU: primitive before kernel resident");
                    return Some(self.encode_reply(aldl_mode::UPLOAD, vec![NAK]));
                }
                self.run_primitive(p)
            }
            None => {
                // Unrecognized uploads land in RAM at their declared
                // address, like any mode 6 write.
                if payload.len() >= 2 {
                    let addr = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                    let data = &payload[2..];
                    if addr < self.ram.len() {
                        let end = (addr + data.len()).min(self.ram.len());
                        self.ram[addr..end].copy_from_slice(&data[..end - addr]);
                    }
                }
                Some(self.encode_reply(aldl_mode::UPLOAD, vec![ACK]))
            }
        }
    }

    fn run_primitive(&mut self, primitive: KernelPrimitive) -> Option<Vec<u8>> {
        match primitive {
            KernelPrimitive::FlashInfo => {
                let (manuf, device) = CHIP_ID_AM29F010;
                Some(self.encode_reply(aldl_mode::UPLOAD, vec![manuf, device]))
            }
            KernelPrimitive::EraseSector { bank, erase_code } => {
                let status = self.erase_sector(bank, erase_code);
                Some(self.encode_reply(aldl_mode::UPLOAD, vec![status]))
            }
            KernelPrimitive::WriteBank { bank } => {
                let status = if bank::cpu_to_file(bank, 0x8000).is_some() {
                    self.write_bank = Some(bank);
                    ACK
                } else {
                    NAK
                };
                Some(self.encode_reply(aldl_mode::UPLOAD, vec![status]))
            }
            KernelPrimitive::Checksum => {
                let computed = image::compute_window_checksum(self.chip.cells());
                let stored = u16::from_be_bytes([
                    self.chip.cells()[CHECKSUM_OFFSET],
                    self.chip.cells()[CHECKSUM_OFFSET + 1],
                ]);
                let status = if computed == stored { ACK } else { NAK };
                let [hi, lo] = computed.to_be_bytes();
                Some(self.encode_reply(aldl_mode::UPLOAD, vec![status, hi, lo]))
            }
            KernelPrimitive::Cleanup => {
                debug!("vECU: cleanup, controller resetting");
                self.programming = false;
                self.unlocked = false;
                self.silenced = false;
                self.blocks_resident = [false; 3];
                self.write_bank = None;
                self.ram.fill(0);
                // The kernel emits the marker raw; no frame structure.
                Some(vec![CLEANUP_MARKER, 0x00])
            }
        }
    }

    fn on_ram_read(&mut self, payload: &[u8]) -> Option<(u8, Vec<u8>)> {
        if payload.len() < 3 {
            return None;
        }
        let addr = u32::from_be_bytes([0, payload[0], payload[1], payload[2]]);
        Some((aldl_mode::RAM_READ, self.read_flash_block(addr)))
    }

    fn read_flash_block(&mut self, addr: u32) -> Vec<u8> {
        (0..crate::protocol::READ_BLOCK_LEN as u32)
            .map(|i| self.chip.read(addr + i))
            .collect()
    }

    fn on_ram_write(&mut self, payload: &[u8]) -> Option<(u8, Vec<u8>)> {
        if payload.len() < 2 {
            return None;
        }
        let addr = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let data = &payload[2..];
        if addr < self.ram.len() {
            let end = (addr + data.len()).min(self.ram.len());
            self.ram[addr..end].copy_from_slice(&data[..end - addr]);
        }
        Some((aldl_mode::RAM_WRITE, vec![ACK]))
    }

    fn on_flash_write(&mut self, payload: &[u8]) -> Option<(u8, Vec<u8>)> {
        if payload.len() < 4 {
            return None;
        }
        let (Some(bank), true) = (self.write_bank, self.kernel_resident()) else {
            return Some((aldl_mode::FLASH_WRITE, vec![NAK]));
        };
        let cpu = u16::from_be_bytes([payload[1], payload[2]]);
        let Some(file) = bank::cpu_to_file(bank, cpu) else {
            return Some((aldl_mode::FLASH_WRITE, vec![NAK]));
        };

        self.flash_write_frames += 1;
        let data = &payload[3..];
        for (i, &b) in data.iter().enumerate() {
            let written = self.chip.program_byte(file + i as u32, b);
            self.bytes_programmed += 1;
            if written != b {
                debug!(
                    offset = %format!("0x{:05X}", file + i as u32),
                    wanted = %format!("0x{b:02X}"),
                    got = %format!("0x{written:02X}"),
                    "vECU: program verify mismatch"
                );
                return Some((aldl_mode::FLASH_WRITE, vec![NAK]));
            }
        }
        Some((aldl_mode::FLASH_WRITE, vec![ACK]))
    }

    fn erase_sector(&mut self, bank: u8, erase_code: u8) -> u8 {
        let cpu = (erase_code as u16) << 8;
        let Some(file) = bank::cpu_to_file(bank, cpu) else {
            return NAK;
        };
        self.sector_erases += 1;
        // erase_sector drives the unlock cycles and polls DQ6/DQ5 to
        // completion; a stuck DQ5 comes back as failure.
        if self.chip.erase_sector(file) {
            ACK
        } else {
            NAK
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelFeatures;

    fn frame(mode: u8, payload: Vec<u8>) -> Vec<u8> {
        Frame::new(crate::protocol::DEVICE_ID, mode, payload)
            .encode()
            .unwrap()
    }

    fn reply(ecu: &mut VirtualEcu, mode: u8, payload: Vec<u8>) -> Frame {
        let wire = ecu.process_frame(&frame(mode, payload)).unwrap();
        Frame::decode(&wire).unwrap()
    }

    fn bring_up_kernel(ecu: &mut VirtualEcu) {
        reply(ecu, aldl_mode::SILENCE, vec![]);
        let r = reply(ecu, aldl_mode::SEED_KEY, vec![0x01]);
        let seed = u16::from_be_bytes([r.payload[1], r.payload[2]]);
        let [kh, kl] = seed_to_key(seed).to_be_bytes();
        let r = reply(ecu, aldl_mode::SEED_KEY, vec![0x02, kh, kl]);
        assert_eq!(r.payload[1], ACK);
        let r = reply(ecu, aldl_mode::ENTER_PROGRAMMING, vec![]);
        assert_eq!(r.payload[0], ACK);
        for block in kernel::exec_blocks(KernelFeatures::default()) {
            let f = Frame::from_template(&block).unwrap();
            let r = reply(ecu, aldl_mode::UPLOAD, f.payload);
            assert_eq!(r.payload[0], ACK);
        }
        assert!(ecu.kernel_resident());
    }

    #[test]
    fn seed_key_handshake() {
        let mut ecu = VirtualEcu::new(0x1234);
        let r = reply(&mut ecu, aldl_mode::SEED_KEY, vec![0x01]);
        assert_eq!(&r.payload, &[0x01, 0x12, 0x34]);
        // Key for seed 0x1234 is 0xA57D.
        let r = reply(&mut ecu, aldl_mode::SEED_KEY, vec![0x02, 0xA5, 0x7D]);
        assert_eq!(&r.payload, &[0x02, ACK]);
        assert!(ecu.unlocked());
    }

    #[test]
    fn zero_seed_reports_already_unlocked() {
        let mut ecu = VirtualEcu::new(0);
        let r = reply(&mut ecu, aldl_mode::SEED_KEY, vec![0x01]);
        assert_eq!(&r.payload, &[0x01, 0x00, 0x00]);
        assert!(ecu.unlocked(), "zero seed means security is not engaged");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let mut ecu = VirtualEcu::new(0x1234);
        reply(&mut ecu, aldl_mode::SEED_KEY, vec![0x01]);
        let r = reply(&mut ecu, aldl_mode::SEED_KEY, vec![0x02, 0x00, 0x01]);
        assert_eq!(&r.payload, &[0x02, 0x00]);
        assert!(!ecu.unlocked());
    }

    #[test]
    fn programming_requires_silence_and_unlock() {
        let mut ecu = VirtualEcu::new(0x1234);
        let r = reply(&mut ecu, aldl_mode::ENTER_PROGRAMMING, vec![]);
        assert_eq!(r.payload[0], NAK);
    }

    #[test]
    fn primitives_require_the_full_kernel() {
        let mut ecu = VirtualEcu::new(0x1234);
        reply(&mut ecu, aldl_mode::SILENCE, vec![]);
        reply(&mut ecu, aldl_mode::SEED_KEY, vec![0x01]);
        reply(&mut ecu, aldl_mode::SEED_KEY, vec![0x02, 0xA5, 0x7D]);
        reply(&mut ecu, aldl_mode::ENTER_PROGRAMMING, vec![]);

        let erase = Frame::from_template(&kernel::erase_frame(0x48, 0x40)).unwrap();
        let r = reply(&mut ecu, aldl_mode::UPLOAD, erase.payload);
        assert_eq!(r.payload[0], NAK, "erase must not run without the kernel");
        assert_eq!(ecu.sector_erases, 0);
    }

    #[test]
    fn erase_and_write_through_the_kernel() {
        let mut ecu = VirtualEcu::new(0x1234);
        bring_up_kernel(&mut ecu);

        // Select the low bank and program two bytes at file 0x4000.
        let wb = Frame::from_template(&kernel::write_bank_frame(0x48)).unwrap();
        assert_eq!(reply(&mut ecu, aldl_mode::UPLOAD, wb.payload).payload[0], ACK);
        let r = reply(
            &mut ecu,
            aldl_mode::FLASH_WRITE,
            vec![0x00, 0x40, 0x00, 0x12, 0x34],
        );
        assert_eq!(r.payload[0], ACK);
        assert_eq!(&ecu.flash()[0x4000..0x4002], &[0x12, 0x34]);

        // Erase sector 1 and see it blank again.
        let erase = Frame::from_template(&kernel::erase_frame(0x48, 0x40)).unwrap();
        assert_eq!(reply(&mut ecu, aldl_mode::UPLOAD, erase.payload).payload[0], ACK);
        assert_eq!(&ecu.flash()[0x4000..0x4002], &[0xFF, 0xFF]);
    }

    #[test]
    fn flash_write_reports_and_mismatches() {
        let mut ecu = VirtualEcu::new(0x1234);
        bring_up_kernel(&mut ecu);
        let wb = Frame::from_template(&kernel::write_bank_frame(0x48)).unwrap();
        reply(&mut ecu, aldl_mode::UPLOAD, wb.payload);

        // 0x00 then 0xFF at the same cell: AND rule forces a mismatch.
        reply(&mut ecu, aldl_mode::FLASH_WRITE, vec![0x00, 0x20, 0x00, 0x00]);
        let r = reply(&mut ecu, aldl_mode::FLASH_WRITE, vec![0x00, 0x20, 0x00, 0xFF]);
        assert_eq!(r.payload[0], NAK);
        assert_eq!(ecu.flash()[0x2000], 0x00);
    }

    #[test]
    fn banked_write_lands_at_the_remapped_offset() {
        let mut ecu = VirtualEcu::new(0x1234);
        bring_up_kernel(&mut ecu);
        let wb = Frame::from_template(&kernel::write_bank_frame(0x58)).unwrap();
        reply(&mut ecu, aldl_mode::UPLOAD, wb.payload);
        // CPU 0x8000 in bank 0x58 is file 0x10000.
        let r = reply(&mut ecu, aldl_mode::FLASH_WRITE, vec![0x00, 0x80, 0x00, 0x42]);
        assert_eq!(r.payload[0], ACK);
        assert_eq!(ecu.flash()[0x10000], 0x42);
    }

    #[test]
    fn checksum_primitive_reports_the_window_word() {
        let mut img = Image::blank();
        img.as_bytes_mut()[0x4000..0x8000].fill(0xAA);
        img.fix_checksum();
        let mut ecu = VirtualEcu::with_image(&img, 0x1234);
        bring_up_kernel(&mut ecu);

        let cs = Frame::from_template(&kernel::checksum_frame()).unwrap();
        let r = reply(&mut ecu, aldl_mode::UPLOAD, cs.payload);
        assert_eq!(r.payload[0], ACK);
        assert_eq!(u16::from_be_bytes([r.payload[1], r.payload[2]]), 0x5400);
    }

    #[test]
    fn cleanup_resets_everything_and_answers_raw() {
        let mut ecu = VirtualEcu::new(0x1234);
        bring_up_kernel(&mut ecu);
        let clean = Frame::from_template(&kernel::cleanup_frame()).unwrap();
        let raw = ecu
            .process_frame(&frame(aldl_mode::UPLOAD, clean.payload))
            .unwrap();
        assert_eq!(raw[0], CLEANUP_MARKER);
        assert!(!ecu.kernel_resident());
        assert!(!ecu.silenced());
        assert!(!ecu.unlocked());
    }

    #[test]
    fn ram_reads_serve_flash_contents() {
        let mut img = Image::blank();
        img.as_bytes_mut()[0x18000] = 0x99;
        let mut ecu = VirtualEcu::with_image(&img, 0x1234);
        let r = reply(&mut ecu, aldl_mode::RAM_READ, vec![0x01, 0x80, 0x00]);
        assert_eq!(r.payload.len(), 64);
        assert_eq!(r.payload[0], 0x99);
    }

    #[test]
    fn foreign_device_ids_are_ignored() {
        let mut ecu = VirtualEcu::new(0x1234);
        let wire = Frame::new(0xF5, aldl_mode::SILENCE, vec![]).encode().unwrap();
        assert!(ecu.process_frame(&wire).is_none());
    }
}
