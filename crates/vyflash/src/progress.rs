//! Progress publishing and cooperative cancellation.
//!
//! All mutation happens on the session thread. An observer thread reads
//! the progress state through a lock-free seqlock snapshot: the writer
//! bumps the sequence to odd, stores the fields with relaxed ordering,
//! then bumps to even; readers retry until they see a stable even
//! sequence.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Which phase of an operation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Handshake,
    KernelUpload,
    Erase,
    Program,
    Verify,
    Read,
    Checksum,
    Cleanup,
    Datalog,
}

impl Stage {
    fn from_u8(v: u8) -> Stage {
        match v {
            1 => Stage::Handshake,
            2 => Stage::KernelUpload,
            3 => Stage::Erase,
            4 => Stage::Program,
            5 => Stage::Verify,
            6 => Stage::Read,
            7 => Stage::Checksum,
            8 => Stage::Cleanup,
            9 => Stage::Datalog,
            _ => Stage::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Stage::Idle => 0,
            Stage::Handshake => 1,
            Stage::KernelUpload => 2,
            Stage::Erase => 3,
            Stage::Program => 4,
            Stage::Verify => 5,
            Stage::Read => 6,
            Stage::Checksum => 7,
            Stage::Cleanup => 8,
            Stage::Datalog => 9,
        }
    }
}

/// A progress report: stage plus bytes done/total for that stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Default)]
struct Shared {
    seq: AtomicU64,
    stage: AtomicU8,
    done: AtomicU64,
    total: AtomicU64,
}

/// Lock-free progress snapshot shared between the session thread and
/// observers.
#[derive(Clone, Default)]
pub struct ProgressMonitor {
    shared: Arc<Shared>,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new progress value. Session thread only.
    pub fn publish(&self, p: Progress) {
        let s = &self.shared;
        s.seq.fetch_add(1, Ordering::Release); // odd: write in progress
        s.stage.store(p.stage.as_u8(), Ordering::Relaxed);
        s.done.store(p.bytes_done, Ordering::Relaxed);
        s.total.store(p.bytes_total, Ordering::Relaxed);
        s.seq.fetch_add(1, Ordering::Release); // even: stable
    }

    /// Read a consistent snapshot from any thread.
    pub fn snapshot(&self) -> Progress {
        let s = &self.shared;
        loop {
            let before = s.seq.load(Ordering::Acquire);
            if before % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let p = Progress {
                stage: Stage::from_u8(s.stage.load(Ordering::Relaxed)),
                bytes_done: s.done.load(Ordering::Relaxed),
                bytes_total: s.total.load(Ordering::Relaxed),
            };
            if s.seq.load(Ordering::Acquire) == before {
                return p;
            }
        }
    }
}

/// Cooperative cancellation flag, polled between frames and sectors.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag for the next operation.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_returns_the_last_published_value() {
        let m = ProgressMonitor::new();
        assert_eq!(m.snapshot().stage, Stage::Idle);
        m.publish(Progress {
            stage: Stage::Program,
            bytes_done: 512,
            bytes_total: 1024,
        });
        let p = m.snapshot();
        assert_eq!(p.stage, Stage::Program);
        assert_eq!(p.bytes_done, 512);
        assert_eq!(p.bytes_total, 1024);
    }

    #[test]
    fn observer_thread_sees_consistent_snapshots() {
        let m = ProgressMonitor::new();
        let observer = m.clone();
        let reader = std::thread::spawn(move || {
            for _ in 0..10_000 {
                let p = observer.snapshot();
                // done/total are always published together.
                assert!(p.bytes_done <= p.bytes_total);
            }
        });
        for i in 0..10_000u64 {
            m.publish(Progress {
                stage: Stage::Read,
                bytes_done: i,
                bytes_total: 10_000,
            });
        }
        reader.join().unwrap();
    }

    #[test]
    fn cancel_token_is_shared() {
        let t = CancelToken::new();
        let t2 = t.clone();
        assert!(!t.is_cancelled());
        t2.cancel();
        assert!(t.is_cancelled());
        t.reset();
        assert!(!t2.is_cancelled());
    }
}
