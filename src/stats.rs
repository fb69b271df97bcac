//! Statistics and error counter containers.
//!
//! Counters are monotonically increasing atomics bumped from any context
//! with a single instruction; snapshots are plain values.  Each receive
//! validation failure has its own counter so field rejections can be told
//! apart in the field.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Counter
// =============================================================================

/// A single monotonically increasing event counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

// =============================================================================
// ArpCounters
// =============================================================================

/// ARP receive/transmit counters, one per validation step plus traffic
/// totals.
#[derive(Default)]
pub struct ArpCounters {
    /// Hardware type not Ethernet.
    pub rx_inv_hw_type: Counter,
    /// Hardware address length not 6.
    pub rx_inv_hw_len: Counter,
    /// Sender hardware address rejected by interface policy.
    pub rx_inv_hw_addr: Counter,
    /// Protocol type not IPv4.
    pub rx_inv_proto_type: Counter,
    /// Protocol address length not 4.
    pub rx_inv_proto_len: Counter,
    /// Sender protocol address not a plausible unicast source.
    pub rx_inv_proto_addr: Counter,
    /// Operation code neither request nor reply.
    pub rx_inv_op_code: Counter,
    /// Operation/address mismatch: misdirected unicast request or
    /// broadcast reply.
    pub rx_inv_op_addr: Counter,
    /// Message shorter than the fixed header.
    pub rx_inv_msg_len: Counter,
    /// Message not targeted at this host (address filter enabled).
    pub rx_not_target: Counter,
    /// Reply with no pending entry (late reply, filter enabled).
    pub rx_late_reply: Counter,
    /// Protocol-address conflicts observed (RFC 3927 §2.5).
    pub conflicts: Counter,

    /// Requests received and accepted.
    pub rx_req: Counter,
    /// Replies received and accepted.
    pub rx_reply: Counter,
    /// Requests transmitted (including renew confirmations).
    pub tx_req: Counter,
    /// Gratuitous requests transmitted.
    pub tx_req_gratuitous: Counter,
    /// Replies transmitted.
    pub tx_reply: Counter,
    /// Transmit attempts the device refused.
    pub tx_err: Counter,
}

impl ArpCounters {
    pub const fn new() -> Self {
        Self {
            rx_inv_hw_type: Counter::new(),
            rx_inv_hw_len: Counter::new(),
            rx_inv_hw_addr: Counter::new(),
            rx_inv_proto_type: Counter::new(),
            rx_inv_proto_len: Counter::new(),
            rx_inv_proto_addr: Counter::new(),
            rx_inv_op_code: Counter::new(),
            rx_inv_op_addr: Counter::new(),
            rx_inv_msg_len: Counter::new(),
            rx_not_target: Counter::new(),
            rx_late_reply: Counter::new(),
            conflicts: Counter::new(),
            rx_req: Counter::new(),
            rx_reply: Counter::new(),
            tx_req: Counter::new(),
            tx_req_gratuitous: Counter::new(),
            tx_reply: Counter::new(),
            tx_err: Counter::new(),
        }
    }

    /// Sum of all receive validation rejections.
    pub fn rx_discards(&self) -> u64 {
        self.rx_inv_hw_type.get()
            + self.rx_inv_hw_len.get()
            + self.rx_inv_hw_addr.get()
            + self.rx_inv_proto_type.get()
            + self.rx_inv_proto_len.get()
            + self.rx_inv_proto_addr.get()
            + self.rx_inv_op_code.get()
            + self.rx_inv_op_addr.get()
            + self.rx_inv_msg_len.get()
            + self.rx_not_target.get()
            + self.rx_late_reply.get()
    }
}

// =============================================================================
// CacheCounters
// =============================================================================

/// Counters maintained by the generic address cache.
#[derive(Default)]
pub struct CacheCounters {
    /// Allocation requests that found neither a free nor an evictable entry.
    pub none_avail: Counter,
    /// Resolved entries recycled to satisfy an allocation.
    pub evicted: Counter,
    /// Release attempted on an entry whose in-use bit was clear.
    pub not_used: Counter,
    /// Queued transmit buffers discarded when their entry was freed.
    pub tx_discarded: Counter,
    /// Internal inconsistencies detected and refused.
    pub corruption: Counter,
}

impl CacheCounters {
    pub const fn new() -> Self {
        Self {
            none_avail: Counter::new(),
            evicted: Counter::new(),
            not_used: Counter::new(),
            tx_discarded: Counter::new(),
            corruption: Counter::new(),
        }
    }
}

// =============================================================================
// CachePoolStats
// =============================================================================

/// Snapshot of the cache entry pool, in the shape the application API
/// exposes: totals, current usage, and a high-water mark that can be
/// reset independently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CachePoolStats {
    /// Configured number of entries.
    pub total: u16,
    /// Entries currently on the free stack.
    pub avail: u16,
    /// Entries currently in use.
    pub used: u16,
    /// Highest `used` observed since the last reset.
    pub used_max: u16,
    /// Entries refused back into the pool after corruption.
    pub lost: u16,
}

impl CachePoolStats {
    /// Pool utilization as an integer percentage (0–100).
    pub fn usage_pct(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.used as u32 * 100) / self.total as u32) as u8
    }
}

impl fmt::Display for CachePoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} used (max {}, lost {})",
            self.used, self.total, self.used_max, self.lost
        )
    }
}
