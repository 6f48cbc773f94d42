//! Single-broker election over a shared owner word.
//!
//! A named 8-byte segment holds the PID of the current broker (zero when
//! none). The shared rings carry no broker identity, so exactly one process
//! may consume the client→server ring at a time; this word is the election.
//! A crashed broker leaves its PID behind, which the next broker detects via
//! a liveness probe and takes over with a compare-exchange.

use crate::error::{Error, Result};
use crate::process;
use crate::shm::SharedSegment;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Grace before probing a freshly observed owner, in case it is still
/// mid-startup.
const PROBE_DELAY: Duration = Duration::from_millis(500);

/// The mapped owner word. Dropping a guard that won the election stores
/// zero back, releasing ownership for the next broker.
#[derive(Debug)]
pub struct OwnerWord {
    seg: SharedSegment,
    owns: bool,
}

impl OwnerWord {
    /// Run the arbitration protocol for `self_pid`.
    ///
    /// Creating the segment wins outright. Attaching probes the recorded
    /// owner: a live one means [`Error::OwnerContended`]; a dead one is
    /// replaced by compare-exchange, which fails only if some other broker
    /// installed itself first.
    pub fn acquire(name: &str, self_pid: u64) -> Result<Self> {
        Self::acquire_with_probe(name, self_pid, &process::is_alive)
    }

    /// As [`acquire`](Self::acquire), with the liveness probe supplied by
    /// the caller.
    pub fn acquire_with_probe(
        name: &str,
        self_pid: u64,
        probe: &dyn Fn(u64) -> bool,
    ) -> Result<Self> {
        let (seg, created) = SharedSegment::create_or_attach(name, 8)?;
        let mut this = Self { seg, owns: false };
        if created {
            this.word().store(self_pid, Ordering::Release);
            this.owns = true;
            info!(pid = self_pid, "owner word created");
            return Ok(this);
        }

        let mut observed = this.word().load(Ordering::Acquire);
        if observed != 0 {
            info!(owner = observed, "owner word held; probing");
            std::thread::sleep(PROBE_DELAY);
            if probe(observed) {
                return Err(Error::OwnerContended(observed));
            }
        }

        loop {
            match this.word().compare_exchange(
                observed,
                self_pid,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    this.owns = true;
                    if observed != 0 {
                        info!(dead = observed, pid = self_pid, "took over from dead owner");
                    }
                    return Ok(this);
                }
                Err(current) if current == 0 => {
                    // The previous owner released cleanly mid-race; claim
                    // the empty word.
                    observed = 0;
                }
                Err(current) => {
                    // Another broker won the takeover.
                    return Err(Error::OwnerContended(current));
                }
            }
        }
    }

    /// Current owner PID, zero when unowned.
    pub fn current(&self) -> u64 {
        self.word().load(Ordering::Acquire)
    }

    /// Read the owner word without claiming it. Clients use this to decide
    /// whether a live broker is behind the rings or a fresh one must be
    /// spawned. [`Error::SegmentMissing`] means no broker ever ran here.
    pub fn read(name: &str) -> Result<u64> {
        let seg = SharedSegment::attach(name, 8)?;
        let word = unsafe { &*(seg.as_ptr() as *const AtomicU64) };
        Ok(word.load(Ordering::Acquire))
    }

    fn word(&self) -> &AtomicU64 {
        unsafe { &*(self.seg.as_ptr() as *const AtomicU64) }
    }
}

impl Drop for OwnerWord {
    fn drop(&mut self) {
        if self.owns {
            self.word().store(0, Ordering::Release);
        }
    }
}
