//! In-memory loopback transport.
//!
//! Behaves like an unterminated half-duplex ALDL cable: every byte
//! written appears back on the read side and nothing answers. Used to
//! exercise echo detection/suppression and timeout paths without
//! hardware.

use std::collections::VecDeque;
use std::time::Instant;

use super::{Transport, TransportError};

#[derive(Default)]
pub struct LoopbackTransport {
    rx: VecDeque<u8>,
    open: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject bytes as if a device had transmitted them.
    pub fn inject(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }
}

impl Transport for LoopbackTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], _deadline: Instant) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        // No clock to wait on; what is buffered is all there will be.
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
        self.rx.extend(data);
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
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
