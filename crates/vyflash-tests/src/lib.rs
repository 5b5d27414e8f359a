//! Shared harness for the end-to-end tests.
//!
//! All tests run against the virtual ECU transport with hardware pacing
//! delays zeroed, so a full read/write/read cycle that takes tens of
//! minutes at 8192 baud completes in well under a second.

use std::sync::Arc;
use std::sync::Once;

use parking_lot::Mutex;

use vyflash::transport::VirtualEcuTransport;
use vyflash::{Image, Session, SessionConfig, VirtualEcu};

/// Seed the virtual ECU hands out; key is seed + 0x9349.
pub const TEST_SEED: u16 = 0x1234;

/// Install a test subscriber once; `RUST_LOG` selects verbosity.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Session configuration with all pacing delays removed.
pub fn fast_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.inter_frame_delay_ms = 0;
    config.silence_wait_ms = 0;
    config.cleanup_delay_ms = 0;
    config.frame_timeout_ms = 200;
    config.erase_timeout_ms = 200;
    config.upload_timeout_ms = 200;
    config.checksum_timeout_ms = 200;
    config.heartbeat_timeout_ms = 200;
    config.echo_probe_timeout_ms = 50;
    config.datalog_interval_ms = 0;
    config.frame_retries = 3;
    config
}

/// A plausible controller image: blank boot window, OS id `$060A`,
/// patterned OS and calibration data, correct checksum.
pub fn stock_image() -> Image {
    let mut img = Image::blank();
    let bytes = img.as_bytes_mut();
    bytes[0x2000] = 0x06;
    bytes[0x2001] = 0x0A;
    for (i, b) in bytes[0x2002..0x20000].iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(37).wrapping_add(11);
    }
    img.fix_checksum();
    img
}

/// Open a session against a virtual ECU preloaded with `image`,
/// returning the simulator handle for inspection and fault injection.
pub fn open_virtual(
    config: &SessionConfig,
    image: Option<&Image>,
) -> (Session, Arc<Mutex<VirtualEcu>>) {
    open_virtual_with_seed(config, image, TEST_SEED)
}

/// [`open_virtual`] with a caller-chosen mode 13 seed (`0` simulates a
/// controller with security not engaged).
pub fn open_virtual_with_seed(
    config: &SessionConfig,
    image: Option<&Image>,
    seed: u16,
) -> (Session, Arc<Mutex<VirtualEcu>>) {
    init_tracing();
    let ecu = match image {
        Some(image) => VirtualEcu::with_image(image, seed),
        None => VirtualEcu::new(seed),
    };
    let transport = VirtualEcuTransport::new(ecu);
    let handle = transport.ecu();
    let session =
        Session::open(config.clone(), Box::new(transport)).expect("session open against vECU");
    (session, handle)
}
