//! Transport layer errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open port: {0}")]
    OpenFailed(String),

    #[error("port not open")]
    NotOpen,

    #[error("read timed out after {0} of {1} bytes")]
    Timeout(usize, usize),

    #[error("device disconnected")]
    Disconnected,

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Timeouts are retried by the framer; everything else is fatal.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_, _))
    }
}
