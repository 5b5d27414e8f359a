//! Frame-level I/O over a transport: half-duplex echo suppression,
//! bus-quiet waits, and the retrying request/reply exchange.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::frame::Frame;
use crate::config::SessionConfig;
use crate::error::{Error, FrameError, Result};
use crate::transport::{Transport, TransportError};

/// Probe bytes used to detect a self-echoing cable.
const ECHO_PROBE: [u8; 2] = [0xFF, 0x55];

pub struct Framer {
    transport: Box<dyn Transport>,
    device_id: u8,
    frame_timeout: Duration,
    inter_frame_delay: Duration,
    silence_wait: Duration,
    /// Whether the cable echoes transmitted bytes back (half-duplex).
    echo: bool,
}

impl Framer {
    pub fn new(config: &SessionConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            device_id: config.device_id,
            frame_timeout: Duration::from_millis(config.frame_timeout_ms),
            inter_frame_delay: Duration::from_millis(config.inter_frame_delay_ms),
            silence_wait: Duration::from_millis(config.silence_wait_ms),
            echo: false,
        }
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn echo_detected(&self) -> bool {
        self.echo
    }

    /// Probe whether the cable echoes transmitted bytes.
    pub fn detect_echo(&mut self, timeout: Duration) -> Result<bool> {
        self.transport.drain()?;
        self.transport.write(&ECHO_PROBE)?;
        let mut buf = [0u8; 2];
        match self.transport.read_exact(&mut buf, Instant::now() + timeout) {
            Ok(()) if buf == ECHO_PROBE => {
                self.echo = true;
                info!("echo detected, will discard self-echo after each TX");
            }
            Ok(()) => {
                self.echo = false;
                debug!(got = %hex::encode(buf), "echo probe answered with foreign bytes");
            }
            Err(e) if e.is_timeout() => {
                self.echo = false;
                info!("no echo detected");
            }
            Err(e) => return Err(e.into()),
        }
        self.transport.drain()?;
        Ok(self.echo)
    }

    /// Listen for normal controller chatter to confirm the ECU is alive.
    pub fn detect_heartbeat(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let slice = Duration::from_millis(500).min(timeout);
        loop {
            let mut byte = [0u8; 1];
            let slot = (Instant::now() + slice).min(deadline);
            match self.transport.read_exact(&mut byte, slot) {
                Ok(()) if byte[0] == self.device_id => {
                    debug!("heartbeat detected");
                    self.transport.drain()?;
                    return Ok(true);
                }
                Ok(()) => continue,
                Err(e) if e.is_timeout() => {
                    if Instant::now() >= deadline {
                        warn!("no heartbeat detected, controller may be off");
                        return Ok(false);
                    }
                    // In-memory transports report timeouts without
                    // blocking; pace the poll.
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait for the bus to go quiet, bounded by the frame deadline.
    fn wait_for_quiet(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.frame_timeout;
        loop {
            self.transport.drain()?;
            if !self.silence_wait.is_zero() {
                std::thread::sleep(self.silence_wait);
            }
            if self.transport.read_available()?.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("bus never went quiet before TX".into()));
            }
        }
    }

    /// Transmit one frame, discarding the half-duplex self-echo.
    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        let wire = frame.encode()?;
        self.wait_for_quiet()?;
        if !self.inter_frame_delay.is_zero() {
            std::thread::sleep(self.inter_frame_delay);
        }
        debug!(tx = %hex::encode(&wire), "TX");
        self.transport.write(&wire)?;

        if self.echo {
            let mut echo = vec![0u8; wire.len()];
            match self
                .transport
                .read_exact(&mut echo, Instant::now() + self.frame_timeout)
            {
                Ok(()) => {
                    if echo != wire {
                        warn!(
                            expected = %hex::encode(&wire),
                            got = %hex::encode(&echo),
                            "self-echo differs from transmitted bytes"
                        );
                    }
                }
                Err(e) if e.is_timeout() => warn!("self-echo missing"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Receive one frame within `timeout`.
    pub fn recv(&mut self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;

        let mut header = [0u8; 2];
        self.read_or_timeout(&mut header, deadline)?;
        let length = header[1];
        if length < super::frame::MIN_LENGTH_BYTE {
            return Err(FrameError::Length(length).into());
        }
        let wire_len = length as usize - 82;

        let mut rest = vec![0u8; wire_len - 2];
        self.read_or_timeout(&mut rest, deadline)?;

        let mut wire = Vec::with_capacity(wire_len);
        wire.extend_from_slice(&header);
        wire.extend_from_slice(&rest);

        let frame = Frame::decode(&wire)?;
        if frame.device_id != self.device_id {
            return Err(FrameError::DeviceId {
                expected: self.device_id,
                got: frame.device_id,
            }
            .into());
        }
        debug!(rx = %hex::encode(&wire), "RX");
        Ok(frame)
    }

    fn read_or_timeout(&mut self, buf: &mut [u8], deadline: Instant) -> Result<()> {
        match self.transport.read_exact(buf, deadline) {
            Ok(()) => Ok(()),
            Err(TransportError::Timeout(got, want)) => Err(Error::Timeout(format!(
                "reply incomplete: {got} of {want} bytes"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Transmit `frame` and read a reply whose mode equals
    /// `expected_mode`, retrying on decode failures, timeouts and mode
    /// mismatches up to `retries` attempts.
    ///
    /// Exhausting the budget surfaces a [`Error::Timeout`]; transport
    /// failures abort immediately.
    pub fn exchange(
        &mut self,
        frame: &Frame,
        expected_mode: u8,
        retries: u32,
        timeout: Duration,
    ) -> Result<Frame> {
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            match self.send(frame).and_then(|()| self.recv(timeout)) {
                Ok(reply) if reply.mode == expected_mode => return Ok(reply),
                Ok(reply) => {
                    warn!(
                        attempt,
                        expected = %format!("0x{expected_mode:02X}"),
                        got = %format!("0x{:02X}", reply.mode),
                        "unexpected reply mode"
                    );
                }
                Err(Error::Transport(e)) => return Err(Error::Transport(e)),
                Err(Error::Io(e)) => return Err(Error::Io(e)),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "exchange attempt failed");
                }
            }
            self.transport.drain()?;
        }
        Err(Error::Timeout(format!(
            "no valid mode 0x{expected_mode:02X} reply after {attempts} attempts"
        )))
    }

    /// Raw passthrough used for the cleanup marker, which the kernel
    /// emits unframed.
    pub fn read_raw(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        match self.transport.read_exact(&mut buf, Instant::now() + timeout) {
            Ok(()) => Ok(buf),
            Err(TransportError::Timeout(got, _)) => {
                buf.truncate(got);
                Ok(buf)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn drain(&mut self) -> Result<()> {
        self.transport.drain()?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::protocol::{aldl_mode, DEVICE_ID};
    use crate::sim::VirtualEcu;
    use crate::transport::VirtualEcuTransport;

    fn test_framer(ecu: VirtualEcu) -> Framer {
        let mut config = SessionConfig::default();
        config.inter_frame_delay_ms = 0;
        config.silence_wait_ms = 0;
        config.frame_timeout_ms = 50;
        let mut transport = VirtualEcuTransport::new(ecu);
        transport.open().unwrap();
        Framer::new(&config, Box::new(transport))
    }

    #[test]
    fn echo_probe_detects_the_half_duplex_wire() {
        let mut framer = test_framer(VirtualEcu::new(0x1234));
        assert!(framer.detect_echo(Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn exchange_succeeds_with_echo_suppression_active() {
        let mut framer = test_framer(VirtualEcu::new(0x1234));
        framer.detect_echo(Duration::from_millis(50)).unwrap();
        let reply = framer
            .exchange(
                &Frame::new(DEVICE_ID, aldl_mode::SILENCE, vec![]),
                aldl_mode::SILENCE,
                3,
                Duration::from_millis(50),
            )
            .unwrap();
        assert_eq!(reply.mode, aldl_mode::SILENCE);
        assert!(reply.payload.is_empty());
    }

    #[test]
    fn exchange_retries_through_corrupt_replies() {
        let ecu = VirtualEcu::new(0x1234);
        let transport = VirtualEcuTransport::new(ecu);
        let handle = transport.ecu();
        let mut config = SessionConfig::default();
        config.inter_frame_delay_ms = 0;
        config.silence_wait_ms = 0;
        config.frame_timeout_ms = 50;
        let mut transport = transport;
        transport.open().unwrap();
        let mut framer = Framer::new(&config, Box::new(transport));
        framer.detect_echo(Duration::from_millis(50)).unwrap();

        // Two corrupt replies, then a valid one, within a budget of 3.
        handle.lock().corrupt_next_replies(2);
        let reply = framer
            .exchange(
                &Frame::new(DEVICE_ID, aldl_mode::SILENCE, vec![]),
                aldl_mode::SILENCE,
                3,
                Duration::from_millis(50),
            )
            .unwrap();
        assert_eq!(reply.mode, aldl_mode::SILENCE);

        // Four corrupt replies exhaust a budget of 3.
        handle.lock().corrupt_next_replies(4);
        let err = framer
            .exchange(
                &Frame::new(DEVICE_ID, aldl_mode::SILENCE, vec![]),
                aldl_mode::SILENCE,
                3,
                Duration::from_millis(50),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    }
}
