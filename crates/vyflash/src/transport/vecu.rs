//! Virtual ECU transport.
//!
//! Wraps the [`VirtualEcu`] simulator behind the transport capability
//! set. Half-duplex behavior is reproduced faithfully: every byte
//! written is echoed back ahead of any reply, so the framer's echo
//! suppression runs against the simulator exactly as it does against a
//! real ALDL cable. The read buffer is pre-seeded with one heartbeat
//! frame so cold connect succeeds instantly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::{Transport, TransportError};
use crate::sim::VirtualEcu;

pub struct VirtualEcuTransport {
    ecu: Arc<Mutex<VirtualEcu>>,
    rx: VecDeque<u8>,
    /// Partial frame bytes accumulated across writes.
    pending: Vec<u8>,
    open: bool,
    seeded: bool,
}

impl VirtualEcuTransport {
    pub fn new(ecu: VirtualEcu) -> Self {
        Self {
            ecu: Arc::new(Mutex::new(ecu)),
            rx: VecDeque::new(),
            pending: Vec::new(),
            open: false,
            seeded: false,
        }
    }

    /// Shared handle to the simulator, for inspection and fault
    /// injection from tests.
    pub fn ecu(&self) -> Arc<Mutex<VirtualEcu>> {
        Arc::clone(&self.ecu)
    }

    /// Feed accumulated bytes through the simulator, frame by frame.
    fn pump(&mut self) {
        loop {
            // Resynchronize on a plausible length byte, like a real
            // listener skipping line noise.
            while self.pending.len() >= 2 {
                let wire = self.pending[1] as i32 - 82;
                if (4..=201).contains(&wire) {
                    break;
                }
                self.pending.remove(0);
            }
            if self.pending.len() < 2 {
                // Stray bytes with no frame structure are noise.
                if self.pending.len() == 1 && self.pending[0] as i32 - 82 < 4 {
                    self.pending.clear();
                }
                return;
            }
            let wire = self.pending[1] as usize - 82;
            if self.pending.len() < wire {
                return;
            }
            let frame: Vec<u8> = self.pending.drain(..wire).collect();
            let reply = self.ecu.lock().process_frame(&frame);
            if let Some(reply) = reply {
                self.rx.extend(reply);
            }
        }
    }
}

impl Transport for VirtualEcuTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        if !self.seeded {
            self.seeded = true;
            let heartbeat = self.ecu.lock().heartbeat_frame();
            self.rx.extend(heartbeat);
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], _deadline: Instant) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        // The simulator replies synchronously, so the buffer already
        // holds everything that will ever arrive before the deadline.
        if self.rx.len() < buf.len() {
            let got = self.rx.len();
            for (slot, b) in buf.iter_mut().zip(self.rx.drain(..)) {
                *slot = b;
            }
            return Err(TransportError::Timeout(got, buf.len()));
        }
        for slot in buf.iter_mut() {
            *slot = self.rx.pop_front().unwrap();
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        Ok(self.rx.drain(..).collect())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        // Half-duplex self-echo arrives before the reply.
        self.rx.extend(data);
        self.pending.extend_from_slice(data);
        self.pump();
        Ok(())
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.rx.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.rx.clear();
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{aldl_mode, Frame, DEVICE_ID};

    #[test]
    fn heartbeat_is_preseeded_on_open() {
        let mut t = VirtualEcuTransport::new(VirtualEcu::new(0x1234));
        t.open().unwrap();
        let pending = t.read_available().unwrap();
        assert_eq!(pending.first(), Some(&DEVICE_ID));
        // Re-opening does not seed again.
        t.close();
        t.open().unwrap();
        assert!(t.read_available().unwrap().is_empty());
    }

    #[test]
    fn writes_are_echoed_before_the_reply() {
        let mut t = VirtualEcuTransport::new(VirtualEcu::new(0x1234));
        t.open().unwrap();
        t.drain().unwrap();

        let wire = Frame::new(DEVICE_ID, aldl_mode::SILENCE, vec![])
            .encode()
            .unwrap();
        t.write(&wire).unwrap();

        let bytes = t.read_available().unwrap();
        assert_eq!(&bytes[..wire.len()], wire.as_slice());
        let reply = Frame::decode(&bytes[wire.len()..]).unwrap();
        assert_eq!(reply.mode, aldl_mode::SILENCE);
    }

    #[test]
    fn noise_between_frames_is_skipped() {
        let mut t = VirtualEcuTransport::new(VirtualEcu::new(0x1234));
        t.open().unwrap();
        t.drain().unwrap();

        // Echo-probe junk first, then a valid frame split across writes.
        t.write(&[0xFF, 0x55]).unwrap();
        t.drain().unwrap();
        let wire = Frame::new(DEVICE_ID, aldl_mode::SILENCE, vec![])
            .encode()
            .unwrap();
        t.write(&wire[..2]).unwrap();
        t.write(&wire[2..]).unwrap();

        let bytes = t.read_available().unwrap();
        let reply = Frame::decode(&bytes[bytes.len() - 4..]).unwrap();
        assert_eq!(reply.mode, aldl_mode::SILENCE);
    }
}
