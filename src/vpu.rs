//! C1 — VPU Budget: a global counting semaphore over the SoC's shared hardware
//! encode/decode sessions. See spec §4.1: hardware encoders on the reference SoC
//! panic or RCU-stall past a platform-specific concurrency bound, so placement
//! decisions are centralized here rather than left to each worker.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VpuKind {
    Encode,
    Decode,
}

struct Counters {
    max_encode: u32,
    max_decode: u32,
    in_use_encode: u32,
    in_use_decode: u32,
}

/// Process-wide singleton. All mutable state is reached through the mutex;
/// acquires never hold it across an `.await`.
pub struct VpuBudget {
    counters: Mutex<Counters>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VpuSnapshot {
    pub max_encode: u32,
    pub max_decode: u32,
    pub in_use_encode: u32,
    pub in_use_decode: u32,
}

impl VpuBudget {
    pub fn new(max_encode: u32, max_decode: u32) -> Arc<Self> {
        Arc::new(Self {
            counters: Mutex::new(Counters {
                max_encode,
                max_decode,
                in_use_encode: 0,
                in_use_decode: 0,
            }),
        })
    }

    /// Atomically checks `in_use + n <= max` and, on success, increments and
    /// returns an RAII guard that releases on drop. On failure returns `None`;
    /// the caller MUST fall back to a software encoder/decoder.
    pub fn try_acquire(self: &Arc<Self>, kind: VpuKind, n: u32) -> Option<VpuGuard> {
        let mut c = self.counters.lock();
        let (in_use, max) = match kind {
            VpuKind::Encode => (&mut c.in_use_encode, c.max_encode),
            VpuKind::Decode => (&mut c.in_use_decode, c.max_decode),
        };
        if *in_use + n > max {
            debug!(?kind, requested = n, in_use = *in_use, max, "VPU budget exhausted");
            return None;
        }
        *in_use += n;
        debug!(?kind, requested = n, in_use = *in_use, max, "VPU slots acquired");
        Some(VpuGuard {
            budget: Arc::clone(self),
            kind,
            n,
            released: false,
        })
    }

    pub fn snapshot(&self) -> VpuSnapshot {
        let c = self.counters.lock();
        VpuSnapshot {
            max_encode: c.max_encode,
            max_decode: c.max_decode,
            in_use_encode: c.in_use_encode,
            in_use_decode: c.in_use_decode,
        }
    }

    fn release(&self, kind: VpuKind, n: u32) {
        let mut c = self.counters.lock();
        let in_use = match kind {
            VpuKind::Encode => &mut c.in_use_encode,
            VpuKind::Decode => &mut c.in_use_decode,
        };
        *in_use = in_use.saturating_sub(n);
        debug!(?kind, released = n, in_use = *in_use, "VPU slots released");
    }
}

/// Holds `n` slots of `kind` for as long as it lives. Dropping releases them —
/// the only way slots are given back, including on early-return error paths.
pub struct VpuGuard {
    budget: Arc<VpuBudget>,
    kind: VpuKind,
    n: u32,
    released: bool,
}

impl VpuGuard {
    pub fn kind(&self) -> VpuKind {
        self.kind
    }
}

impl Drop for VpuGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.budget.release(self.kind, self.n);
        } else {
            warn!("VpuGuard dropped twice, ignoring second release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_respects_max() {
        let budget = VpuBudget::new(2, 4);
        let g1 = budget.try_acquire(VpuKind::Encode, 1).unwrap();
        let g2 = budget.try_acquire(VpuKind::Encode, 1).unwrap();
        assert!(budget.try_acquire(VpuKind::Encode, 1).is_none());
        assert_eq!(budget.snapshot().in_use_encode, 2);
        drop(g1);
        assert_eq!(budget.snapshot().in_use_encode, 1);
        drop(g2);
        assert_eq!(budget.snapshot().in_use_encode, 0);
    }

    #[test]
    fn encode_and_decode_are_independent_pools() {
        let budget = VpuBudget::new(1, 1);
        let _enc = budget.try_acquire(VpuKind::Encode, 1).unwrap();
        let _dec = budget.try_acquire(VpuKind::Decode, 1).unwrap();
        assert!(budget.try_acquire(VpuKind::Encode, 1).is_none());
        assert!(budget.try_acquire(VpuKind::Decode, 1).is_none());
    }

    #[test]
    fn invariant_never_exceeds_max_under_concurrent_release() {
        let budget = VpuBudget::new(4, 4);
        let guards: Vec<_> = (0..4)
            .map(|_| budget.try_acquire(VpuKind::Encode, 1).unwrap())
            .collect();
        assert!(budget.try_acquire(VpuKind::Encode, 1).is_none());
        drop(guards);
        let snap = budget.snapshot();
        assert_eq!(snap.in_use_encode, 0);
        assert!(snap.in_use_encode <= snap.max_encode);
    }
}
