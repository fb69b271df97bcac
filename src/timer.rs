//! One-shot timer wheel with typed dispatch.
//!
//! Cache entries borrow timers; the wheel owns them.  Instead of bare
//! function pointers, each timer carries a [`TimerKind`] discriminant and
//! a `key` naming the resource it belongs to (a cache entry key).  The
//! dispatch `match` on `TimerKind` is exhaustive, so adding a kind forces
//! every dispatcher to handle it.
//!
//! # Concurrency
//!
//! Internal state sits behind a lock.  Expired entries are collected
//! under the lock and dispatched **after** it is released, so handlers
//! are free to schedule or cancel timers without deadlocking.  The wheel
//! may be called under the cache lock (schedule/cancel); the converse
//! never happens.
//!
//! # Bounds
//!
//! The number of outstanding timers is capped so that `schedule` can
//! fail; callers that cannot arm a timer free the entry that needed it.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// Number of slots in the wheel.
const NUM_SLOTS: usize = 256;

/// Maximum outstanding (non-cancelled) timers.
pub const MAX_PENDING_TIMERS: usize = 4096;

// =============================================================================
// TimerKind
// =============================================================================

/// Which resolution flavor and which per-entry timer a wheel entry drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// ARP request retry (Pending and Renew states).
    ArpRetry,
    /// ARP resolved-entry renew period elapsed.
    ArpRenew,
    /// Neighbor-discovery solicitation retry.  The cache layer arms it;
    /// dispatch belongs to the companion NDP engine.
    NdpRetry,
    /// Neighbor-discovery reachable-time expiry.
    NdpRenew,
}

// =============================================================================
// TimerToken
// =============================================================================

/// Opaque cancellation handle.  Tokens are unique for the life of the
/// wheel and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerToken(u64);

impl TimerToken {
    /// Sentinel matching no scheduled timer.
    pub const INVALID: Self = Self(0);
}

// =============================================================================
// Wheel internals
// =============================================================================

struct WheelEntry {
    /// Absolute tick at which the entry fires.
    deadline: u64,
    kind: TimerKind,
    /// Resource key (cache entry slot + generation).
    key: u32,
    token: TimerToken,
    cancelled: bool,
}

/// An expired timer handed to the dispatcher.
///
/// The receiving subsystem must validate `key` against a live resource:
/// the resource may have been freed and its slot reused between the
/// firing and the dispatch.
#[derive(Clone, Copy, Debug)]
pub struct FiredTimer {
    pub kind: TimerKind,
    pub key: u32,
}

struct WheelInner {
    slots: [Vec<WheelEntry>; NUM_SLOTS],
    /// Last processed tick.
    current_tick: u64,
    /// Outstanding non-cancelled entries.
    pending: usize,
}

// =============================================================================
// TimerWheel
// =============================================================================

/// 256-slot one-shot timer wheel.
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    /// Token generator; starts at 1 so that 0 stays the invalid sentinel.
    next_token: AtomicU64,
}

impl TimerWheel {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(WheelInner {
                slots: [const { Vec::new() }; NUM_SLOTS],
                current_tick: 0,
                pending: 0,
            }),
            next_token: AtomicU64::new(1),
        }
    }

    /// Schedule a one-shot timer `delay_ticks` from now.  A zero delay
    /// fires on the next advance.
    ///
    /// Returns `None` when the wheel is at capacity; the caller treats
    /// this like any other resource exhaustion.
    pub fn schedule(&self, delay_ticks: u64, kind: TimerKind, key: u32) -> Option<TimerToken> {
        let mut inner = self.inner.lock();
        if inner.pending >= MAX_PENDING_TIMERS {
            return None;
        }
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let deadline = inner.current_tick.wrapping_add(delay_ticks.max(1));
        let slot = (deadline % NUM_SLOTS as u64) as usize;
        inner.slots[slot].push(WheelEntry {
            deadline,
            kind,
            key,
            token,
            cancelled: false,
        });
        inner.pending += 1;
        Some(token)
    }

    /// Cancel a scheduled timer.  Returns `true` if it had not yet fired.
    ///
    /// O(n) over the wheel; slots are short in practice and cancellation
    /// is far rarer than firing.
    pub fn cancel(&self, token: TimerToken) -> bool {
        if token == TimerToken::INVALID {
            return false;
        }
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        for slot in inner.slots.iter_mut() {
            for entry in slot.iter_mut() {
                if entry.token == token && !entry.cancelled {
                    entry.cancelled = true;
                    inner.pending -= 1;
                    return true;
                }
            }
        }
        false
    }

    /// Advance the wheel to `target_tick`, collecting every expired entry
    /// on the way.  Entries are returned in firing order; the caller
    /// dispatches them with no wheel lock held.
    pub fn advance_to(&self, target_tick: u64) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock();
        while inner.current_tick < target_tick {
            inner.current_tick += 1;
            let now = inner.current_tick;
            let slot_idx = (now % NUM_SLOTS as u64) as usize;
            let mut removed = 0usize;
            let slot = &mut inner.slots[slot_idx];
            let mut i = 0;
            while i < slot.len() {
                if slot[i].cancelled {
                    slot.swap_remove(i);
                    continue;
                }
                // Entries with a later deadline share the slot via
                // modular wraparound; leave them.
                if slot[i].deadline <= now {
                    let entry = slot.swap_remove(i);
                    fired.push(FiredTimer {
                        kind: entry.kind,
                        key: entry.key,
                    });
                    removed += 1;
                    continue;
                }
                i += 1;
            }
            inner.pending -= removed;
        }
        fired
    }

    /// Last processed tick.
    pub fn current_tick(&self) -> u64 {
        self.inner.lock().current_tick
    }

    /// Outstanding non-cancelled timers (diagnostic).
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
