//! Serial port transport.
//!
//! Two open modes share this adapter: the standard mode goes through
//! `serialport::open`, the direct mode opens the platform-native port
//! type and claims it exclusively, which is what low-latency USB-serial
//! cables want for the tight half-duplex turnaround at 8192 baud.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, info};

use super::{Transport, TransportError};
use crate::config::SerialConfig;

pub struct SerialTransport {
    config: SerialConfig,
    direct: bool,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig, direct: bool) -> Self {
        Self {
            config,
            direct,
            port: None,
        }
    }

    /// List serial port names present on this machine.
    pub fn list_ports() -> Result<Vec<String>, TransportError> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect())
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let builder = serialport::new(&self.config.port, self.config.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(100));

        let port: Box<dyn SerialPort> = if self.direct {
            let mut native = builder.open_native().map_err(|e| {
                TransportError::OpenFailed(format!("{}: {e}", self.config.port))
            })?;
            #[cfg(unix)]
            native
                .set_exclusive(true)
                .map_err(|e| TransportError::OpenFailed(format!("exclusive claim: {e}")))?;
            Box::new(native)
        } else {
            builder.open().map_err(|e| {
                TransportError::OpenFailed(format!("{}: {e}", self.config.port))
            })?
        };

        info!(
            port = %self.config.port,
            baud = self.config.baud,
            direct = self.direct,
            "serial port opened"
        );
        self.port = Some(port);
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> Result<(), TransportError> {
        let want = buf.len();
        let port = self.port_mut()?;
        let mut filled = 0;
        while filled < want {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(filled, want));
            }
            port.set_timeout(deadline - now)?;
            match port.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout(filled, want));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let port = self.port_mut()?;
        let pending = port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        port.set_timeout(Duration::from_millis(1))?;
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        self.port_mut()?
            .clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.config.port, "serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
