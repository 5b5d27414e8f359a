//! Mode 1 datastream decoding.
//!
//! The controller answers mode 1 message 0 with a 60-byte payload whose
//! first [`RECORD_LEN`] bytes form the sensor record. [`PARAMS`] maps
//! that record onto typed engineering values: 47 parameters, ten of them
//! 16-bit, spanning the record exactly. RAM source addresses are those
//! of the VS/VX/VY V6 datastream definition.

use std::thread::JoinHandle;

use crate::error::Error;
use crate::session::Session;

/// Meaningful bytes in a mode 1 message 0 record.
pub const RECORD_LEN: usize = 57;
/// Payload bytes carried by the mode 1 reply on the wire.
pub const REPLY_LEN: usize = 60;

/// One parameter of the datastream record.
#[derive(Debug, Clone, Copy)]
pub struct DatalogParam {
    pub name: &'static str,
    /// RAM address the controller samples this value from.
    pub ram_addr: u16,
    /// Byte offset within the record.
    pub offset: usize,
    /// 1 or 2 bytes, big-endian.
    pub size: usize,
    pub units: &'static str,
    /// physical = raw * scale + bias
    pub scale: f64,
    pub bias: f64,
}

const fn p(
    name: &'static str,
    ram_addr: u16,
    offset: usize,
    size: usize,
    units: &'static str,
    scale: f64,
    bias: f64,
) -> DatalogParam {
    DatalogParam {
        name,
        ram_addr,
        offset,
        size,
        units,
        scale,
        bias,
    }
}

/// The mode 1 message 0 parameter table.
pub const PARAMS: [DatalogParam; 47] = [
    p("RPM", 0x0089, 0, 2, "RPM", 25.0, 0.0),
    p("Desired Idle", 0x1835, 2, 2, "RPM", 25.0, 0.0),
    p("ECT Voltage", 0x1908, 4, 1, "V", 5.0 / 255.0, 0.0),
    p("ECT Temp", 0x190A, 5, 1, "degC", 0.75, -40.0),
    p("IAT Voltage", 0x1901, 6, 1, "V", 5.0 / 255.0, 0.0),
    p("IAT Temp", 0x1904, 7, 1, "degC", 0.75, -40.0),
    p("MAF Freq", 0x014F, 8, 2, "Hz", 1.0, 0.0),
    p("MAF", 0x011C, 10, 2, "g/s", 1.0, 0.0),
    p("TPS Voltage", 0x017A, 12, 1, "V", 5.0 / 255.0, 0.0),
    p("TPS", 0x1B77, 13, 1, "%", 1.0 / 2.55, 0.0),
    p("LH O2", 0x0061, 14, 1, "mV", 4.44, 0.0),
    p("LH O2 Xcount", 0x1827, 15, 1, "", 1.0, 0.0),
    p("RH O2", 0x0060, 16, 1, "mV", 4.44, 0.0),
    p("RH O2 Xcount", 0x1826, 17, 1, "", 1.0, 0.0),
    p("Inj PW", 0x0153, 18, 2, "ms", 0.01526, 0.0),
    p("Inj Voltage", 0x1843, 20, 1, "V", 0.1, 0.0),
    p("LH STFT", 0x0124, 21, 1, "%", 1.0 / 1.28, -100.0),
    p("RH STFT", 0x0123, 22, 1, "%", 1.0 / 1.28, -100.0),
    p("LH LTFT", 0x0077, 23, 1, "%", 1.0 / 1.28, -100.0),
    p("RH LTFT", 0x0072, 24, 1, "%", 1.0 / 1.28, -100.0),
    p("BLM Cell", 0x006F, 25, 1, "", 1.0, 0.0),
    p("STFT Change", 0x0302, 26, 1, "", 1.0, 0.0),
    p("LTFT Var", 0x0303, 27, 1, "", 1.0, 0.0),
    p("AFR", 0x182A, 28, 1, ":1", 0.1, 0.0),
    p("Battery V", 0x006A, 29, 1, "V", 0.1, 0.0),
    p("Ref Voltage", 0x1841, 30, 1, "V", 0.02, 0.0),
    p("Status 32", 0x0030, 31, 1, "", 1.0, 0.0),
    p("Status 33", 0x0031, 32, 1, "", 1.0, 0.0),
    p("Status 34", 0x0032, 33, 1, "", 1.0, 0.0),
    p("Status 35", 0x0033, 34, 1, "", 1.0, 0.0),
    p("Knock Retard", 0x0188, 35, 1, "deg", 0.351, 0.0),
    p("EPROM ID Hi", 0x2000, 36, 1, "", 1.0, 0.0),
    p("EPROM ID Lo", 0x2001, 37, 1, "", 1.0, 0.0),
    p("Cyl Air", 0x0067, 38, 1, "mg/s", 1.0, 0.0),
    p("Wheel Speed", 0x0208, 39, 1, "km/h", 1.0, 0.0),
    p("Idle Var", 0x1A3D, 40, 2, "RPM", 1.0, 0.0),
    p("IAC Steps", 0x001D, 42, 1, "steps", 1.0, 0.0),
    p("Spark Advance", 0x01A7, 43, 2, "deg", 90.0 / 256.0, -35.0),
    p("Eng Perf 100", 0x0352, 45, 1, "%", 1.0 / 2.55, 0.0),
    p("Eng Perf 50", 0x0354, 46, 1, "%", 1.0 / 2.55, 0.0),
    p("EGR Pintle", 0x18F8, 47, 1, "V", 5.0 / 255.0, 0.0),
    p("EGR Feedback", 0x18F2, 48, 1, "V", 5.0 / 255.0, 0.0),
    p("EGR Desired", 0x18F1, 49, 1, "V", 5.0 / 255.0, 0.0),
    p("Canister Purge", 0x189B, 50, 1, "%", 1.0 / 2.55, 0.0),
    p("Fuel Consump", 0x0175, 51, 2, "L/100km", 1.0, 0.0),
    p("Run Time", 0x001E, 53, 2, "s", 1.0, 0.0),
    p("Crank Time", 0x017F, 55, 2, "ms", 1.0, 0.0),
];

/// Look up a parameter by name.
pub fn param(name: &str) -> Option<&'static DatalogParam> {
    PARAMS.iter().find(|p| p.name == name)
}

/// One decoded datastream sample.
#[derive(Debug, Clone)]
pub struct DatalogRow {
    /// Raw record bytes as received.
    pub raw: Vec<u8>,
    /// Engineering values, aligned with [`PARAMS`].
    pub values: Vec<f64>,
}

impl DatalogRow {
    /// Decode a mode 1 reply payload.
    ///
    /// Returns `None` when the payload is too short to hold the record.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < RECORD_LEN {
            return None;
        }
        let raw = payload[..RECORD_LEN].to_vec();
        let values = PARAMS
            .iter()
            .map(|p| {
                let v = match p.size {
                    2 => u16::from_be_bytes([raw[p.offset], raw[p.offset + 1]]) as f64,
                    _ => raw[p.offset] as f64,
                };
                v * p.scale + p.bias
            })
            .collect();
        Some(Self { raw, values })
    }

    /// Value of a named parameter.
    pub fn value(&self, name: &str) -> Option<f64> {
        PARAMS
            .iter()
            .position(|p| p.name == name)
            .map(|i| self.values[i])
    }
}

/// Handle to a running datalog worker.
///
/// The worker owns the session for its lifetime; [`stop`] signals it and
/// gives the session back.
///
/// [`stop`]: DatalogHandle::stop
pub struct DatalogHandle {
    pub(crate) cancel: crate::progress::CancelToken,
    pub(crate) worker: JoinHandle<Session>,
}

impl DatalogHandle {
    /// Ask the worker to stop after the in-flight request and take the
    /// session back.
    pub fn stop(self) -> Result<Session, Error> {
        self.cancel.cancel();
        self.worker
            .join()
            .map_err(|_| Error::Protocol("datalog worker panicked".into()))
    }

    /// Cancellation token shared with the worker.
    pub fn cancel_token(&self) -> crate::progress::CancelToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_tile_the_record_exactly() {
        let mut covered = vec![false; RECORD_LEN];
        for p in PARAMS.iter() {
            for i in p.offset..p.offset + p.size {
                assert!(!covered[i], "{} overlaps at byte {i}", p.name);
                covered[i] = true;
            }
        }
        assert!(covered.iter().all(|&c| c), "record has uncovered bytes");
    }

    #[test]
    fn decode_applies_scale_and_bias() {
        let mut payload = vec![0u8; REPLY_LEN];
        payload[0] = 0x00;
        payload[1] = 0x20; // RPM raw 32 -> 800 RPM
        payload[5] = 120; // ECT 120*0.75-40 = 50 degC
        payload[29] = 140; // battery 14.0 V
        let row = DatalogRow::decode(&payload).unwrap();
        assert_eq!(row.value("RPM"), Some(800.0));
        assert_eq!(row.value("ECT Temp"), Some(50.0));
        assert!((row.value("Battery V").unwrap() - 14.0).abs() < 1e-9);
        assert_eq!(row.value("no such param"), None);
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(DatalogRow::decode(&[0u8; RECORD_LEN - 1]).is_none());
    }
}
