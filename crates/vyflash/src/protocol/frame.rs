//! ALDL frame codec.
//!
//! Wire shape: `[device_id, length, mode, payload…, checksum]`.
//!
//! The length byte follows the OSE tool's convention:
//!
//! ```text
//! length        = 86 + payload_len        (payload excludes the mode byte)
//! wire bytes    = length - 82
//! checksum pos  = length - 83
//! ```
//!
//! The checksum makes the unsigned byte sum over the whole frame zero
//! mod 256.

use crate::error::FrameError;

/// Bias of the length byte relative to the payload length.
pub const LENGTH_BIAS: usize = 86;
/// Smallest legal length byte (empty payload).
pub const MIN_LENGTH_BYTE: u8 = 86;
/// Largest payload that still fits the length encoding.
pub const MAX_PAYLOAD: usize = 0xFF - LENGTH_BIAS;

/// A decoded ALDL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device_id: u8,
    pub mode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(device_id: u8, mode: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            device_id,
            mode,
            payload: payload.into(),
        }
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.payload.len() + 4
    }

    /// Encode to wire bytes, appending the checksum.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let mut out = Vec::with_capacity(self.wire_len());
        out.push(self.device_id);
        out.push((LENGTH_BIAS + self.payload.len()) as u8);
        out.push(self.mode);
        out.extend_from_slice(&self.payload);
        out.push(checksum(&out));
        Ok(out)
    }

    /// Decode wire bytes, validating length and checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 4 {
            return Err(FrameError::Truncated {
                declared: 4,
                got: bytes.len(),
            });
        }
        let length = bytes[1];
        if length < MIN_LENGTH_BYTE {
            return Err(FrameError::Length(length));
        }
        let wire = length as usize - 82;
        if bytes.len() < wire {
            return Err(FrameError::Truncated {
                declared: wire,
                got: bytes.len(),
            });
        }
        let sum = byte_sum(&bytes[..wire]);
        if sum != 0 {
            return Err(FrameError::Checksum { sum });
        }
        Ok(Self {
            device_id: bytes[0],
            mode: bytes[2],
            payload: bytes[3..wire - 1].to_vec(),
        })
    }

    /// Build a frame from a checksum-less template (`[device_id, length,
    /// mode, payload…]`).
    ///
    /// Templates may be stored shorter than their declared length; the
    /// missing payload bytes are zero, matching the OSE tool's
    /// zero-filled frame buffer.
    pub fn from_template(template: &[u8]) -> Result<Self, FrameError> {
        if template.len() < 3 {
            return Err(FrameError::Truncated {
                declared: 3,
                got: template.len(),
            });
        }
        let length = template[1];
        if length < MIN_LENGTH_BYTE {
            return Err(FrameError::Length(length));
        }
        let payload_len = length as usize - LENGTH_BIAS;
        let mut payload = vec![0u8; payload_len];
        let stored = (template.len() - 3).min(payload_len);
        payload[..stored].copy_from_slice(&template[3..3 + stored]);
        Ok(Self {
            device_id: template[0],
            mode: template[2],
            payload,
        })
    }
}

fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Two's-complement checksum over the frame bytes so far.
pub fn checksum(bytes: &[u8]) -> u8 {
    byte_sum(bytes).wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_encoded_frame_sums_to_zero() {
        for (mode, payload) in [
            (0x08u8, vec![]),
            (0x0D, vec![0x01]),
            (0x0D, vec![0x02, 0xA5, 0x7D]),
            (0x09, vec![0x01, 0x23, 0x45]),
            (0x10, (0u8..64).collect::<Vec<_>>()),
        ] {
            let wire = Frame::new(0xF7, mode, payload).encode().unwrap();
            assert_eq!(byte_sum(&wire), 0, "mode 0x{mode:02X}");
        }
    }

    #[test]
    fn length_byte_matches_the_ose_encoding() {
        // Mode 8 silence: F7 56 08 AB
        let wire = Frame::new(0xF7, 0x08, vec![]).encode().unwrap();
        assert_eq!(wire, vec![0xF7, 0x56, 0x08, 0xAB]);
        // Seed request: F7 57 0D 01 + checksum
        let wire = Frame::new(0xF7, 0x0D, vec![0x01]).encode().unwrap();
        assert_eq!(&wire[..4], &[0xF7, 0x57, 0x0D, 0x01]);
        // Extended read uses length byte 0x59.
        let wire = Frame::new(0xF7, 0x09, vec![0x00, 0x40, 0x00]).encode().unwrap();
        assert_eq!(wire[1], 0x59);
    }

    #[test]
    fn decode_round_trips() {
        let frame = Frame::new(0xF7, 0x10, vec![0x00, 0x80, 0x00, 0xDE, 0xAD]);
        let wire = frame.encode().unwrap();
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut wire = Frame::new(0xF7, 0x01, vec![0x00]).encode().unwrap();
        *wire.last_mut().unwrap() ^= 0x01;
        assert!(matches!(
            Frame::decode(&wire),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn bad_length_byte_is_rejected() {
        assert!(matches!(
            Frame::decode(&[0xF7, 0x20, 0x08, 0x00]),
            Err(FrameError::Length(0x20))
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let wire = Frame::new(0xF7, 0x01, vec![1, 2, 3, 4]).encode().unwrap();
        assert!(matches!(
            Frame::decode(&wire[..wire.len() - 2]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let frame = Frame::new(0xF7, 0x06, vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(
            frame.encode(),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn short_template_is_zero_padded() {
        // Declared payload of 6, only 2 stored.
        let frame = Frame::from_template(&[0xF7, 0x5C, 0x06, 0x12, 0x34]).unwrap();
        assert_eq!(frame.payload, vec![0x12, 0x34, 0, 0, 0, 0]);
    }
}
