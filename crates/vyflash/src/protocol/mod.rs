//! ALDL application protocol: frame codec, mode numbers, framer.

pub mod frame;
pub mod framer;

pub use frame::Frame;
pub use framer::Framer;

/// ALDL device id of the VX/VY engine controller.
pub const DEVICE_ID: u8 = 0xF7;

/// Positive acknowledge byte in kernel and mode replies.
pub const ACK: u8 = 0xAA;
/// Failure byte in kernel and mode replies.
pub const NAK: u8 = 0x55;

/// ALDL mode bytes.
pub mod aldl_mode {
    /// 57-byte sensor snapshot (60-byte payload on the wire).
    pub const DATALOG: u8 = 0x01;
    /// Legacy RAM peek, 2-byte address.
    pub const PEEK_SHORT: u8 = 0x02;
    /// Memory read, 3-byte address.
    pub const PEEK_LONG: u8 = 0x03;
    /// Actuator test.
    pub const ACTUATOR: u8 = 0x04;
    /// Switch the controller into programming mode.
    pub const ENTER_PROGRAMMING: u8 = 0x05;
    /// Place bytes at a RAM address (kernel blocks and primitives).
    pub const UPLOAD: u8 = 0x06;
    /// Suppress normal bus chatter.
    pub const SILENCE: u8 = 0x08;
    /// RAM read, 3-byte address, 64-byte replies.
    pub const RAM_READ: u8 = 0x09;
    /// Live RAM shadow write.
    pub const RAM_WRITE: u8 = 0x0A;
    /// Two-step seed/key security access.
    pub const SEED_KEY: u8 = 0x0D;
    /// Flash write frame routed through the resident kernel.
    pub const FLASH_WRITE: u8 = 0x10;
}

/// Mode 13 sub-functions.
pub mod seed_key {
    pub const REQUEST_SEED: u8 = 0x01;
    pub const SUBMIT_KEY: u8 = 0x02;
}

/// Additive constant of the seed/key transform.
pub const SEED_KEY_MAGIC: u16 = 0x9349;

/// Derive the mode 13 key from a seed.
pub fn seed_to_key(seed: u16) -> u16 {
    seed.wrapping_add(SEED_KEY_MAGIC)
}

/// Bytes read by a single mode 2/3/9 reply.
pub const READ_BLOCK_LEN: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_matches_the_known_vector() {
        assert_eq!(seed_to_key(0x1234), 0xA57D);
    }

    #[test]
    fn key_derivation_wraps_for_all_seeds() {
        for seed in 0..=u16::MAX {
            let key = seed_to_key(seed);
            assert_eq!(key, (seed as u32 + 0x9349) as u16);
        }
    }

    #[test]
    fn zero_seed_key() {
        assert_eq!(seed_to_key(0x0000), 0x9349);
        assert_eq!(seed_to_key(0xFFFF), 0x9348);
    }
}
