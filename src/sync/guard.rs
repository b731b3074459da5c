//! Pass-level concurrency primitives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Binary in-flight flag. Acquire returns an RAII guard that clears the flag
/// on drop, so every exit path of a pass (including `?` and panics) releases it.
#[derive(Debug, Default)]
pub struct InFlight {
    busy: AtomicBool,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when another pass holds the flag.
    pub fn try_acquire(&self) -> Option<InFlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                owner: self,
                owned: true,
            })
    }

    /// Forced passes run regardless; the guard only clears the flag if this
    /// pass was the one that set it.
    pub fn acquire_forced(&self) -> InFlightGuard<'_> {
        let was_busy = self.busy.swap(true, Ordering::AcqRel);
        InFlightGuard {
            owner: self,
            owned: !was_busy,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
    owned: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.owner.busy.store(false, Ordering::Release);
        }
    }
}

/// Request fencing: each pass takes a ticket at issue time and may only
/// publish if no later ticket has published first.
#[derive(Debug, Default)]
pub struct PassFence {
    issued: AtomicU64,
    applied: AtomicU64,
}

impl PassFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True when `seq` is the newest completion so far; records it.
    pub fn try_commit(&self, seq: u64) -> bool {
        self.applied.fetch_max(seq, Ordering::AcqRel) < seq
    }

    pub fn last_applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }
}
