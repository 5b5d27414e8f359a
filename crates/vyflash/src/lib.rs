//! vyflash - in-vehicle flash read/write core for Delco 68HC11F1 ECUs
//!
//! This crate drives the AMD Am29F010 NOR flash of a 68HC11F1 engine
//! controller over its half-duplex ALDL serial link (8192 baud): it
//! silences the bus, performs the seed/key unlock, uploads a small
//! machine-code kernel into controller RAM and then uses that kernel to
//! erase, program, read back and verify the 128 KiB flash in situ.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Session                              │
//! │  state machine: Idle → Silenced → Authenticated →           │
//! │                 Programming → KernelResident → Idle         │
//! │                                                             │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌─────────────┐  │
//! │  │ ops      │  │ kernel   │  │ bank     │  │ progress /  │  │
//! │  │ (read/   │  │ (RAM     │  │ (address │  │ cancel      │  │
//! │  │  write)  │  │  blocks) │  │  map)    │  │             │  │
//! │  └────┬─────┘  └──────────┘  └──────────┘  └─────────────┘  │
//! │       │                                                     │
//! │  ┌────┴─────┐                                               │
//! │  │ Framer   │   ALDL frame codec, checksums, echo           │
//! │  │(protocol)│   suppression, per-frame retries              │
//! │  └────┬─────┘                                               │
//! │       │                                                     │
//! │  ┌────┴──────────┐                                          │
//! │  │ Transport     │   serial / direct / loopback /           │
//! │  │ (adapter)     │   virtual ECU (Am29F010 model)           │
//! │  └───────────────┘                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The graphical front-end, CLI parsing, log formatting, disassembler
//! and calibration viewers are external collaborators; this crate is the
//! programmatic surface they drive.
//!
//! # Example
//!
//! ```no_run
//! use vyflash::{open_session, SessionConfig, TransportConfig, WriteMode, Image};
//!
//! let mut config = SessionConfig::default();
//! config.transport = TransportConfig::Serial(Default::default());
//!
//! let mut session = open_session(&config)?;
//! let image = Image::load("stock.bin")?;
//! let report = session.write_image(WriteMode::Cal, &image, &mut |_| {})?;
//! println!("wrote {} bytes", report.bytes_written);
//! session.close();
//! # Ok::<(), vyflash::Error>(())
//! ```

pub mod bank;
pub mod chip;
pub mod config;
pub mod datalog;
pub mod error;
pub mod image;
pub mod kernel;
pub mod ops;
pub mod progress;
pub mod protocol;
pub mod report;
pub mod session;
pub mod sim;
pub mod transport;

pub use bank::{BankedAddress, Sector, WriteMode, SECTORS};
pub use config::{SerialConfig, SessionConfig, TransportConfig, VirtualEcuConfig};
pub use datalog::{DatalogHandle, DatalogRow};
pub use error::{Error, FlashError, FrameError, Result};
pub use image::{Image, IMAGE_SIZE};
pub use ops::EcuInfo;
pub use progress::{CancelToken, Progress, ProgressMonitor, Stage};
pub use report::WriteReport;
pub use session::{Session, SessionState};
pub use sim::VirtualEcu;
pub use transport::{create_transport, Transport, TransportError};

/// Open a session over the transport described by `config`.
///
/// The transport is opened immediately; the ECU heartbeat and cable echo
/// probes run as part of the open. The returned session is in
/// [`SessionState::Idle`] and owns its transport until [`Session::close`].
pub fn open_session(config: &SessionConfig) -> Result<Session> {
    let transport = create_transport(&config.transport)?;
    Session::open(config.clone(), transport)
}
