//! Address cache shared by ARP and the neighbor-discovery flavor.
//!
//! A fixed pool of per-destination records, each binding a protocol
//! address to a hardware address and owning a FIFO of frames waiting on
//! resolution.  Live records sit on a doubly-linked MRU list: frequently
//! matched entries are promoted to the head, and when the free stack runs
//! dry the oldest *resolved* entry near the tail is recycled.  A record
//! still pending holds an unbroken promise to its queued frames and is
//! never evicted.
//!
//! The cache is generic over a [`CacheKind`]: ARP (IPv4, 4-byte) and NDP
//! (IPv6, 16-byte) differ only in address width, multicast mapping, and
//! which timer kinds drive them.  Everything here is kind-independent;
//! the wire engines live elsewhere.
//!
//! # Concurrency
//!
//! All mutable state sits behind one lock per cache.  Operations collect
//! any work that needs I/O (frames to flush, requests to emit) and return
//! it for the caller to perform after the lock is released.  The timer
//! wheel may be called *under* the cache lock; the dispatch direction
//! (wheel → cache) always runs with the wheel lock already dropped.
//!
//! # Timer keys
//!
//! Entries borrow timers from the wheel and carry a generation counter;
//! a timer key packs `(generation << 16) | slot`.  A fired timer whose
//! generation no longer matches is stale (the entry was freed and the
//! slot reused) and is ignored.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use crate::iface::IfaceTable;
use crate::packetbuf::PacketBuf;
use crate::stats::{CacheCounters, CachePoolStats};
use crate::timer::{TimerKind, TimerToken, TimerWheel};
use crate::types::{
    IfIndex, Ipv4Addr, Ipv6Addr, MacAddr, NetError, ipv4_multicast_hw, ipv6_multicast_hw,
};

// =============================================================================
// CacheKind
// =============================================================================

/// Parameterizes the cache over one resolution flavor.
pub trait CacheKind {
    /// Protocol address carried by this flavor, in wire byte order.
    type Addr: Copy + PartialEq + Eq + fmt::Display + fmt::Debug;

    /// Short name used in log messages.
    const NAME: &'static str;

    /// All-zero address used to scrub freed entries.
    const ADDR_ZERO: Self::Addr;

    /// Timer kind for the request retry timer.
    const RETRY_TIMER: TimerKind;

    /// Timer kind for the resolved-entry renew timer.
    const RENEW_TIMER: TimerKind;

    /// `true` if `addr` is a multicast group address.
    fn is_multicast(addr: &Self::Addr) -> bool;

    /// Well-known hardware mapping of a multicast protocol address.
    fn multicast_hw(addr: &Self::Addr) -> MacAddr;
}

/// ARP: IPv4 over Ethernet.
pub enum ArpKind {}

impl CacheKind for ArpKind {
    type Addr = Ipv4Addr;
    const NAME: &'static str = "arp";
    const ADDR_ZERO: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
    const RETRY_TIMER: TimerKind = TimerKind::ArpRetry;
    const RENEW_TIMER: TimerKind = TimerKind::ArpRenew;

    fn is_multicast(addr: &Ipv4Addr) -> bool {
        addr.is_multicast()
    }

    fn multicast_hw(addr: &Ipv4Addr) -> MacAddr {
        ipv4_multicast_hw(*addr)
    }
}

/// NDP: IPv6 over Ethernet.  Cache layer only; the solicitation engine is
/// the companion neighbor-discovery module's concern.
pub enum NdpKind {}

impl CacheKind for NdpKind {
    type Addr = Ipv6Addr;
    const NAME: &'static str = "ndp";
    const ADDR_ZERO: Ipv6Addr = Ipv6Addr::UNSPECIFIED;
    const RETRY_TIMER: TimerKind = TimerKind::NdpRetry;
    const RENEW_TIMER: TimerKind = TimerKind::NdpRenew;

    fn is_multicast(addr: &Ipv6Addr) -> bool {
        addr.is_multicast()
    }

    fn multicast_hw(addr: &Ipv6Addr) -> MacAddr {
        ipv6_multicast_hw(*addr)
    }
}

// =============================================================================
// Entry
// =============================================================================

/// Resolution state of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// On the free stack.
    Free,
    /// Request in flight; frames queue on the entry.
    Pending,
    /// Hardware address known and fresh.
    Resolved,
    /// Hardware address known but being re-confirmed by unicast request.
    Renew,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Renew => write!(f, "renew"),
        }
    }
}

bitflags! {
    /// Per-entry flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        /// Entry is allocated (on the active list, not the free stack).
        const IN_USE = 1 << 0;
        /// Entry was created by an address probe; an empty FIFO is normal.
        const PROBE  = 1 << 1;
        /// Entry records a synthesized multicast mapping; releasing it
        /// drops the interface's hash-bucket reference.
        const MCAST  = 1 << 2;
    }
}

/// One cache record.  Control state and address bytes live in the same
/// struct; the per-kind differences ride on `K`.
struct Entry<K: CacheKind> {
    state: EntryState,
    flags: EntryFlags,
    /// Bumped on every release so stale timer keys can be recognized.
    generation: u16,
    iface: IfIndex,
    proto_addr: K::Addr,
    proto_valid: bool,
    hw_addr: MacAddr,
    hw_valid: bool,
    /// Source protocol address used when emitting requests for this
    /// entry.  Entries learned passively leave it unset and expire
    /// instead of renewing.
    sender_proto: Option<K::Addr>,
    /// Frames accepted for delivery once the entry resolves, in order.
    txq: Vec<PacketBuf>,
    /// Successful lookups since the last MRU promotion.
    accessed: u16,
    /// Requests emitted in the current resolution episode.
    attempts: u8,
    /// Borrowed handle into the timer wheel.
    timer: Option<TimerToken>,
    /// Active-list links; `next` doubles as the free-stack link.
    prev: Option<u16>,
    next: Option<u16>,
}

impl<K: CacheKind> Entry<K> {
    fn new() -> Self {
        Self {
            state: EntryState::Free,
            flags: EntryFlags::empty(),
            generation: 0,
            iface: IfIndex(0),
            proto_addr: K::ADDR_ZERO,
            proto_valid: false,
            hw_addr: MacAddr::ZERO,
            hw_valid: false,
            sender_proto: None,
            txq: Vec::new(),
            accessed: 0,
            attempts: 0,
            timer: None,
            prev: None,
            next: None,
        }
    }
}

/// Pack a slot index and its generation into a timer key.
#[inline]
fn pack_key(slot: u16, generation: u16) -> u32 {
    ((generation as u32) << 16) | slot as u32
}

#[inline]
fn key_slot(key: u32) -> u16 {
    (key & 0xffff) as u16
}

#[inline]
fn key_generation(key: u32) -> u16 {
    (key >> 16) as u16
}

// =============================================================================
// Operation inputs and outcomes
// =============================================================================

/// External collaborators and current tunables, threaded into every cache
/// operation by the owning core.
pub struct CacheParams<'a> {
    pub wheel: &'a TimerWheel,
    pub counters: &'a CacheCounters,
    pub ifaces: &'a IfaceTable,
    /// Lookups before MRU promotion.
    pub accessed_th: u16,
    /// Per-entry pending FIFO threshold.
    pub txq_th: u16,
    /// Request retry interval, ticks.
    pub retry_ticks: u64,
    /// Resolved-entry renew period, ticks.
    pub renew_ticks: u64,
    /// Maximum request attempts while Pending.
    pub max_attempts_pend: u8,
    /// Maximum request attempts while Renew.
    pub max_attempts_renew: u8,
}

/// Result of a plain lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupStatus {
    NotFound,
    /// Entry exists and its hardware address is usable.
    Resolved,
    /// Entry exists but resolution is still in flight.
    Pending,
}

/// Everything the wire engine needs to emit one request.
#[derive(Clone, Copy, Debug)]
pub struct RequestTemplate<K: CacheKind> {
    pub iface: IfIndex,
    pub target: K::Addr,
    /// Sender protocol address; `None` transmits the all-zero address.
    pub sender: Option<K::Addr>,
    /// Confirm an existing binding by unicast instead of broadcasting.
    pub unicast_to: Option<MacAddr>,
}

/// Outcome of [`AddrCache::resolve`].
pub enum ResolveOutcome<K: CacheKind> {
    /// Hardware address written into the frame; the caller transmits it.
    Resolved { pkt: PacketBuf },
    /// Frame queued on an entry whose request is already in flight.
    Queued,
    /// New pending entry created and the frame queued; the caller must
    /// emit the returned request.
    Pending { req: RequestTemplate<K> },
    /// The entry's FIFO is at threshold; the frame is handed back.
    Unresolved { pkt: PacketBuf },
    /// The queue threshold exceeds the interface's transmit capacity.
    NoBuffer { pkt: PacketBuf },
    /// No free entry and nothing evictable.
    NoCache { pkt: PacketBuf },
    /// The timer wheel had no free slot for the retry timer.
    NoTimer { pkt: PacketBuf },
}

/// Outcome of [`AddrCache::update_sender`].
pub enum SenderUpdate {
    /// A pending entry resolved; deliver these frames (in order) with the
    /// given hardware address.
    Flush {
        pkts: Vec<PacketBuf>,
        hw: MacAddr,
        iface: IfIndex,
    },
    /// An existing resolved entry was refreshed.
    Refreshed,
    /// No entry for this sender.
    NotFound,
}

/// Read-only view of one entry, for diagnostics and tests.
#[derive(Clone, Copy, Debug)]
pub struct EntrySnapshot<A> {
    pub state: EntryState,
    pub flags: EntryFlags,
    pub iface: IfIndex,
    pub proto_addr: A,
    pub hw_addr: MacAddr,
    pub hw_valid: bool,
    pub sender_proto: Option<A>,
    pub txq_len: usize,
    pub accessed: u16,
    pub attempts: u8,
    pub has_timer: bool,
    pub key: u32,
}

// =============================================================================
// AddrCache
// =============================================================================

struct CacheInner<K: CacheKind> {
    entries: Vec<Entry<K>>,
    /// Singly-linked stack of free slots, threaded through `next`.
    free_head: Option<u16>,
    /// MRU-first active list.
    head: Option<u16>,
    tail: Option<u16>,
    used: u16,
    used_max: u16,
    lost: u16,
}

/// Fixed-capacity address cache for one [`CacheKind`].
pub struct AddrCache<K: CacheKind> {
    inner: Mutex<CacheInner<K>>,
    capacity: u16,
}

impl<K: CacheKind> AddrCache<K> {
    /// Create a cache with `capacity` entries (1..=65535).
    pub fn new(capacity: u16) -> Result<Self, NetError> {
        if capacity == 0 {
            return Err(NetError::InvalidArgument);
        }
        let mut entries = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            let mut e = Entry::new();
            e.next = if i + 1 < capacity { Some(i + 1) } else { None };
            entries.push(e);
        }
        Ok(Self {
            inner: Mutex::new(CacheInner {
                entries,
                free_head: Some(0),
                head: None,
                tail: None,
                used: 0,
                used_max: 0,
                lost: 0,
            }),
            capacity,
        })
    }

    /// Configured entry count.
    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Look up `(iface, addr)` on the active list, promoting on threshold.
    pub fn lookup(&self, iface: IfIndex, addr: K::Addr, accessed_th: u16) -> LookupStatus {
        let mut inner = self.inner.lock();
        match search_locked(&mut inner, iface, addr, accessed_th) {
            Some(slot) => {
                if inner.entries[slot as usize].hw_valid {
                    LookupStatus::Resolved
                } else {
                    LookupStatus::Pending
                }
            }
            None => LookupStatus::NotFound,
        }
    }

    /// Hardware address of a resolved binding, if present.
    pub fn cached_hw(&self, iface: IfIndex, addr: K::Addr, accessed_th: u16) -> Option<MacAddr> {
        let mut inner = self.inner.lock();
        let slot = search_locked(&mut inner, iface, addr, accessed_th)?;
        let e = &inner.entries[slot as usize];
        if e.hw_valid { Some(e.hw_addr) } else { None }
    }

    // =========================================================================
    // Outbound resolution
    // =========================================================================

    /// Map `dst` for an outbound frame: copy the hardware address in, or
    /// queue the frame on a pending entry, or create one and ask the
    /// caller to emit a request.
    ///
    /// `sender_hint` seeds the new entry's sender protocol address;
    /// `tx_capacity` is the owning interface's transmit-buffer total,
    /// which the queue threshold may not exceed.
    pub fn resolve(
        &self,
        iface: IfIndex,
        dst: K::Addr,
        sender_hint: Option<K::Addr>,
        tx_capacity: u16,
        mut pkt: PacketBuf,
        p: &CacheParams<'_>,
    ) -> ResolveOutcome<K> {
        let mut inner = self.inner.lock();

        if let Some(slot) = search_locked(&mut inner, iface, dst, p.accessed_th) {
            let idx = slot as usize;
            match inner.entries[idx].state {
                EntryState::Resolved | EntryState::Renew => {
                    pkt.set_eth_dst(inner.entries[idx].hw_addr);
                    return ResolveOutcome::Resolved { pkt };
                }
                EntryState::Pending => {
                    if p.txq_th > tx_capacity {
                        return ResolveOutcome::NoBuffer { pkt };
                    }
                    if inner.entries[idx].txq.len() >= p.txq_th as usize {
                        return ResolveOutcome::Unresolved { pkt };
                    }
                    let key = pack_key(slot, inner.entries[idx].generation);
                    pkt.set_pending_key(Some(key));
                    inner.entries[idx].txq.push(pkt);
                    return ResolveOutcome::Queued;
                }
                EntryState::Free => {
                    // A free entry on the active list is an inconsistency;
                    // reclaim the slot and fall through to the miss path.
                    p.counters.corruption.inc();
                    unlink_locked(&mut inner, slot);
                    release_locked(&mut inner, slot, true, p);
                }
            }
        }

        // Miss.  Multicast destinations have a synthesized mapping and
        // never need a request on the wire.
        if K::is_multicast(&dst) {
            let hw = K::multicast_hw(&dst);
            pkt.set_eth_dst(hw);
            let _ = add_resolved_locked(&mut inner, iface, dst, hw, true, p);
            return ResolveOutcome::Resolved { pkt };
        }

        let slot = match allocate_locked(&mut inner, p) {
            Ok(slot) => slot,
            Err(_) => return ResolveOutcome::NoCache { pkt },
        };
        let idx = slot as usize;
        let key = pack_key(slot, inner.entries[idx].generation);
        match p.wheel.schedule(p.retry_ticks, K::RETRY_TIMER, key) {
            Some(tok) => inner.entries[idx].timer = Some(tok),
            None => {
                release_locked(&mut inner, slot, false, p);
                return ResolveOutcome::NoTimer { pkt };
            }
        }

        let e = &mut inner.entries[idx];
        e.state = EntryState::Pending;
        e.iface = iface;
        e.proto_addr = dst;
        e.proto_valid = true;
        e.sender_proto = sender_hint;
        e.attempts = 1;
        pkt.set_pending_key(Some(key));
        e.txq.push(pkt);
        insert_head_locked(&mut inner, slot);

        log::debug!("{}: new pending entry for {} on if {}", K::NAME, dst, iface);

        ResolveOutcome::Pending {
            req: RequestTemplate {
                iface,
                target: dst,
                sender: sender_hint,
                unicast_to: None,
            },
        }
    }

    // =========================================================================
    // Inbound update
    // =========================================================================

    /// Merge a received message's sender binding into the cache.
    ///
    /// Implements the "already in the table" half of the RFC 826 reception
    /// algorithm; adding entries for unknown senders is policy and stays
    /// with the wire engine (see [`add_resolved`](Self::add_resolved)).
    pub fn update_sender(
        &self,
        iface: IfIndex,
        sender_proto: K::Addr,
        sender_hw: MacAddr,
        p: &CacheParams<'_>,
    ) -> SenderUpdate {
        let mut inner = self.inner.lock();
        let Some(slot) = search_locked(&mut inner, iface, sender_proto, p.accessed_th) else {
            return SenderUpdate::NotFound;
        };
        let idx = slot as usize;
        let key = pack_key(slot, inner.entries[idx].generation);

        match inner.entries[idx].state {
            EntryState::Pending => {
                let e = &mut inner.entries[idx];
                e.hw_addr = sender_hw;
                e.hw_valid = true;
                e.attempts = 0;
                if let Some(tok) = e.timer.take() {
                    p.wheel.cancel(tok);
                }
                let mut pkts: Vec<PacketBuf> = e.txq.drain(..).collect();
                for q in pkts.iter_mut() {
                    q.set_pending_key(None);
                }
                match p.wheel.schedule(p.renew_ticks, K::RENEW_TIMER, key) {
                    Some(tok) => {
                        inner.entries[idx].state = EntryState::Resolved;
                        inner.entries[idx].timer = Some(tok);
                    }
                    None => {
                        // No timer for the resolved state: give the entry
                        // up but still deliver the frames we drained.
                        unlink_locked(&mut inner, slot);
                        release_locked(&mut inner, slot, false, p);
                    }
                }
                log::debug!(
                    "{}: {} resolved to {} on if {}, flushing {} queued",
                    K::NAME,
                    sender_proto,
                    sender_hw,
                    iface,
                    pkts.len()
                );
                SenderUpdate::Flush {
                    pkts,
                    hw: sender_hw,
                    iface,
                }
            }
            EntryState::Resolved | EntryState::Renew => {
                let e = &mut inner.entries[idx];
                e.hw_addr = sender_hw;
                if e.state == EntryState::Renew {
                    e.state = EntryState::Resolved;
                    e.attempts = 0;
                }
                if let Some(tok) = e.timer.take() {
                    p.wheel.cancel(tok);
                }
                match p.wheel.schedule(p.renew_ticks, K::RENEW_TIMER, key) {
                    Some(tok) => inner.entries[idx].timer = Some(tok),
                    None => {
                        unlink_locked(&mut inner, slot);
                        release_locked(&mut inner, slot, false, p);
                    }
                }
                SenderUpdate::Refreshed
            }
            EntryState::Free => {
                p.counters.corruption.inc();
                unlink_locked(&mut inner, slot);
                release_locked(&mut inner, slot, true, p);
                SenderUpdate::NotFound
            }
        }
    }

    /// Record a resolved binding for a sender with no existing entry, or
    /// refresh one that appeared meanwhile.  Entries created here carry no
    /// sender protocol address and therefore expire instead of renewing.
    pub fn add_resolved(
        &self,
        iface: IfIndex,
        proto: K::Addr,
        hw: MacAddr,
        p: &CacheParams<'_>,
    ) -> Result<(), NetError> {
        let mut inner = self.inner.lock();
        add_resolved_locked(&mut inner, iface, proto, hw, false, p)
    }

    // =========================================================================
    // Probe
    // =========================================================================

    /// Start a fresh resolution episode for `target`, discarding any
    /// existing entry first.  Used to probe whether an address is claimed
    /// on the network; the caller emits the returned request and observes
    /// the result with a later [`lookup`](Self::lookup).
    pub fn probe(
        &self,
        iface: IfIndex,
        sender: K::Addr,
        target: K::Addr,
        p: &CacheParams<'_>,
    ) -> Result<RequestTemplate<K>, NetError> {
        let mut inner = self.inner.lock();

        if let Some(slot) = find_locked(&inner, iface, target) {
            unlink_locked(&mut inner, slot);
            release_locked(&mut inner, slot, true, p);
        }

        let slot = allocate_locked(&mut inner, p)?;
        let idx = slot as usize;
        let key = pack_key(slot, inner.entries[idx].generation);
        match p.wheel.schedule(p.retry_ticks, K::RETRY_TIMER, key) {
            Some(tok) => inner.entries[idx].timer = Some(tok),
            None => {
                release_locked(&mut inner, slot, false, p);
                return Err(NetError::NoTimerAvailable);
            }
        }

        let e = &mut inner.entries[idx];
        e.state = EntryState::Pending;
        e.flags.insert(EntryFlags::PROBE);
        e.iface = iface;
        e.proto_addr = target;
        e.proto_valid = true;
        e.sender_proto = Some(sender);
        e.attempts = 1;
        insert_head_locked(&mut inner, slot);

        Ok(RequestTemplate {
            iface,
            target,
            sender: Some(sender),
            unicast_to: None,
        })
    }

    /// Remove the entry for `(iface, addr)`, if any.
    pub fn remove(&self, iface: IfIndex, addr: K::Addr, p: &CacheParams<'_>) -> bool {
        let mut inner = self.inner.lock();
        match find_locked(&inner, iface, addr) {
            Some(slot) => {
                unlink_locked(&mut inner, slot);
                release_locked(&mut inner, slot, true, p);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Timer callbacks
    // =========================================================================

    /// Request-retry timer fired for `key`.
    ///
    /// Returns the request to re-emit, or `None` when the entry was freed
    /// (retries exhausted, no timer slot) or the key was stale.
    pub fn on_retry_timer(&self, key: u32, p: &CacheParams<'_>) -> Option<RequestTemplate<K>> {
        let mut inner = self.inner.lock();
        let slot = validate_key(&inner, key)?;
        let idx = slot as usize;

        // The fired timer is gone; the handle must be cleared before any
        // decision, and never handed back to the wheel.
        inner.entries[idx].timer = None;

        let (max, state) = {
            let e = &inner.entries[idx];
            let max = match e.state {
                EntryState::Renew => p.max_attempts_renew,
                _ => p.max_attempts_pend,
            };
            (max, e.state)
        };

        if inner.entries[idx].attempts >= max {
            log::debug!(
                "{}: {} retries exhausted in {} state, freeing entry",
                K::NAME,
                inner.entries[idx].proto_addr,
                state
            );
            unlink_locked(&mut inner, slot);
            release_locked(&mut inner, slot, false, p);
            return None;
        }

        match p.wheel.schedule(p.retry_ticks, K::RETRY_TIMER, key) {
            Some(tok) => inner.entries[idx].timer = Some(tok),
            None => {
                unlink_locked(&mut inner, slot);
                release_locked(&mut inner, slot, false, p);
                return None;
            }
        }

        let e = &mut inner.entries[idx];
        e.attempts += 1;
        Some(RequestTemplate {
            iface: e.iface,
            target: e.proto_addr,
            sender: e.sender_proto,
            unicast_to: if e.state == EntryState::Renew {
                Some(e.hw_addr)
            } else {
                None
            },
        })
    }

    /// Renew timer fired for `key`.
    ///
    /// Returns the unicast confirmation request to emit, or `None` when
    /// the entry was freed or re-armed for removal.
    pub fn on_renew_timer(&self, key: u32, p: &CacheParams<'_>) -> Option<RequestTemplate<K>> {
        let mut inner = self.inner.lock();
        let slot = validate_key(&inner, key)?;
        let idx = slot as usize;

        inner.entries[idx].timer = None;

        let Some(sender) = inner.entries[idx].sender_proto else {
            // Passively learned binding: expire instead of renewing.
            unlink_locked(&mut inner, slot);
            release_locked(&mut inner, slot, false, p);
            return None;
        };

        // Normally re-arm the renew callback on the short retry interval
        // and confirm by unicast; once renewal attempts are exhausted,
        // hand the entry to an immediate retry expiry, which frees it.
        let exhausted = inner.entries[idx].state == EntryState::Renew
            && inner.entries[idx].attempts >= p.max_attempts_renew;
        let (kind, ticks) = if exhausted {
            (K::RETRY_TIMER, 0)
        } else {
            (K::RENEW_TIMER, p.retry_ticks)
        };

        match p.wheel.schedule(ticks, kind, key) {
            Some(tok) => inner.entries[idx].timer = Some(tok),
            None => {
                unlink_locked(&mut inner, slot);
                release_locked(&mut inner, slot, false, p);
                return None;
            }
        }

        let e = &mut inner.entries[idx];
        e.state = EntryState::Renew;
        if exhausted {
            return None;
        }
        e.attempts += 1;
        Some(RequestTemplate {
            iface: e.iface,
            target: e.proto_addr,
            sender: Some(sender),
            unicast_to: Some(e.hw_addr),
        })
    }

    // =========================================================================
    // Pool statistics and diagnostics
    // =========================================================================

    /// Snapshot of pool usage.
    pub fn pool_stats(&self) -> CachePoolStats {
        let inner = self.inner.lock();
        CachePoolStats {
            total: self.capacity,
            avail: self.capacity - inner.used - inner.lost,
            used: inner.used,
            used_max: inner.used_max,
            lost: inner.lost,
        }
    }

    /// Reset the used high-water mark to the current usage.
    pub fn reset_used_max(&self) {
        let mut inner = self.inner.lock();
        inner.used_max = inner.used;
    }

    /// Number of entries on the active list.
    pub fn active_len(&self) -> usize {
        self.inner.lock().used as usize
    }

    /// Protocol address at the head of the active list, if any.
    pub fn head_addr(&self) -> Option<K::Addr> {
        let inner = self.inner.lock();
        inner.head.map(|h| inner.entries[h as usize].proto_addr)
    }

    /// Read-only view of an entry.
    pub fn snapshot(&self, iface: IfIndex, addr: K::Addr) -> Option<EntrySnapshot<K::Addr>> {
        let inner = self.inner.lock();
        let slot = find_locked(&inner, iface, addr)?;
        let e = &inner.entries[slot as usize];
        Some(EntrySnapshot {
            state: e.state,
            flags: e.flags,
            iface: e.iface,
            proto_addr: e.proto_addr,
            hw_addr: e.hw_addr,
            hw_valid: e.hw_valid,
            sender_proto: e.sender_proto,
            txq_len: e.txq.len(),
            accessed: e.accessed,
            attempts: e.attempts,
            has_timer: e.timer.is_some(),
            key: pack_key(slot, e.generation),
        })
    }

    /// Verify the structural invariants; returns the first violation.
    ///
    /// Walks both lists, so this is for tests and debug dumps only.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        let inner = self.inner.lock();

        let mut active = 0u32;
        let mut cursor = inner.head;
        let mut prev: Option<u16> = None;
        while let Some(slot) = cursor {
            let e = &inner.entries[slot as usize];
            if !e.flags.contains(EntryFlags::IN_USE) {
                return Err("active entry without in-use bit");
            }
            if e.state == EntryState::Free {
                return Err("free entry on active list");
            }
            if matches!(e.state, EntryState::Resolved | EntryState::Renew) && !e.hw_valid {
                return Err("resolved entry without valid hardware address");
            }
            if e.prev != prev {
                return Err("broken prev link");
            }
            for q in e.txq.iter() {
                if q.pending_key() != Some(pack_key(slot, e.generation)) {
                    return Err("queued frame not tagged with its entry");
                }
            }
            // No duplicate (iface, addr) further down the list.
            let mut rest = e.next;
            while let Some(other) = rest {
                let o = &inner.entries[other as usize];
                if o.iface == e.iface && o.proto_addr == e.proto_addr {
                    return Err("duplicate (iface, address) pair");
                }
                rest = o.next;
            }
            prev = cursor;
            cursor = e.next;
            active += 1;
        }
        if inner.tail != prev {
            return Err("tail does not match last active entry");
        }

        let mut free = 0u32;
        let mut cursor = inner.free_head;
        while let Some(slot) = cursor {
            let e = &inner.entries[slot as usize];
            if e.flags.contains(EntryFlags::IN_USE) {
                return Err("free entry with in-use bit");
            }
            cursor = e.next;
            free += 1;
        }

        if active + free + inner.lost as u32 != self.capacity as u32 {
            return Err("free + active != capacity");
        }
        if active != inner.used as u32 {
            return Err("used count does not match active list");
        }
        Ok(())
    }

    /// Log every active entry.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        let mut cursor = inner.head;
        while let Some(slot) = cursor {
            let e = &inner.entries[slot as usize];
            log::debug!(
                "{}: [{}] {} -> {} {} q={} att={} acc={}",
                K::NAME,
                slot,
                e.proto_addr,
                e.hw_addr,
                e.state,
                e.txq.len(),
                e.attempts,
                e.accessed
            );
            cursor = e.next;
        }
    }
}

// =============================================================================
// Locked helpers
// =============================================================================

/// Find `(iface, addr)` without touching the accessed counter.
fn find_locked<K: CacheKind>(
    inner: &CacheInner<K>,
    iface: IfIndex,
    addr: K::Addr,
) -> Option<u16> {
    let mut cursor = inner.head;
    while let Some(slot) = cursor {
        let e = &inner.entries[slot as usize];
        if e.proto_valid && e.iface == iface && e.proto_addr == addr {
            return Some(slot);
        }
        cursor = e.next;
    }
    None
}

/// Find `(iface, addr)`, bump the accessed counter, and promote the entry
/// to the list head once the counter passes the threshold.
fn search_locked<K: CacheKind>(
    inner: &mut CacheInner<K>,
    iface: IfIndex,
    addr: K::Addr,
    accessed_th: u16,
) -> Option<u16> {
    let slot = find_locked(inner, iface, addr)?;
    let idx = slot as usize;
    inner.entries[idx].accessed = inner.entries[idx].accessed.saturating_add(1);
    if inner.entries[idx].accessed > accessed_th {
        inner.entries[idx].accessed = 0;
        if inner.head != Some(slot) {
            unlink_locked(inner, slot);
            insert_head_locked(inner, slot);
        }
    }
    Some(slot)
}

/// Link `slot` at the head of the active list.
fn insert_head_locked<K: CacheKind>(inner: &mut CacheInner<K>, slot: u16) {
    let old_head = inner.head;
    {
        let e = &mut inner.entries[slot as usize];
        e.prev = None;
        e.next = old_head;
    }
    match old_head {
        Some(h) => inner.entries[h as usize].prev = Some(slot),
        None => inner.tail = Some(slot),
    }
    inner.head = Some(slot);
}

/// Unlink `slot` from the active list.
fn unlink_locked<K: CacheKind>(inner: &mut CacheInner<K>, slot: u16) {
    let idx = slot as usize;
    let (prev, next) = (inner.entries[idx].prev, inner.entries[idx].next);
    match prev {
        Some(p) => inner.entries[p as usize].next = next,
        None => inner.head = next,
    }
    match next {
        Some(n) => inner.entries[n as usize].prev = prev,
        None => inner.tail = prev,
    }
    inner.entries[idx].prev = None;
    inner.entries[idx].next = None;
}

/// Draw an entry: pop the free stack, or recycle the oldest resolved
/// entry from the tail of the active list.  Pending entries are never
/// recycled; that would silently break their queued frames' promise.
fn allocate_locked<K: CacheKind>(
    inner: &mut CacheInner<K>,
    p: &CacheParams<'_>,
) -> Result<u16, NetError> {
    if inner.free_head.is_none() {
        let mut cursor = inner.tail;
        let mut victim = None;
        while let Some(slot) = cursor {
            let e = &inner.entries[slot as usize];
            if e.hw_valid {
                victim = Some(slot);
                break;
            }
            cursor = e.prev;
        }
        match victim {
            Some(slot) => {
                p.counters.evicted.inc();
                log::debug!(
                    "{}: evicting {} to satisfy allocation",
                    K::NAME,
                    inner.entries[slot as usize].proto_addr
                );
                unlink_locked(inner, slot);
                release_locked(inner, slot, true, p);
            }
            None => {
                p.counters.none_avail.inc();
                return Err(NetError::NoCacheAvailable);
            }
        }
    }

    let Some(slot) = inner.free_head else {
        // Eviction above always refills the stack; refuse rather than
        // propagate a broken pool.
        p.counters.corruption.inc();
        return Err(NetError::NoCacheAvailable);
    };
    let idx = slot as usize;
    inner.free_head = inner.entries[idx].next;
    let e = &mut inner.entries[idx];
    e.next = None;
    e.flags = EntryFlags::IN_USE;
    inner.used += 1;
    if inner.used > inner.used_max {
        inner.used_max = inner.used;
    }
    Ok(slot)
}

/// Return `slot` to the free stack: cancel its timer (if asked), discard
/// its queue through the buffer-free path, scrub it, and bump its
/// generation so stale timer keys die.
///
/// `free_timer` is `false` when the caller *is* the timer callback: the
/// fired timer is owned by the wheel and must not be cancelled again.
fn release_locked<K: CacheKind>(
    inner: &mut CacheInner<K>,
    slot: u16,
    free_timer: bool,
    p: &CacheParams<'_>,
) {
    let idx = slot as usize;

    if !inner.entries[idx].flags.contains(EntryFlags::IN_USE) {
        // Double-free guard.
        p.counters.not_used.inc();
        return;
    }

    if let Some(tok) = inner.entries[idx].timer.take() {
        if free_timer {
            p.wheel.cancel(tok);
        }
    }

    let (iface, hw, hw_valid, mcast) = {
        let e = &inner.entries[idx];
        (
            e.iface,
            e.hw_addr,
            e.hw_valid,
            e.flags.contains(EntryFlags::MCAST),
        )
    };
    if mcast && hw_valid {
        p.ifaces.mcast_hw_unref(iface, hw);
    }

    let free_head = inner.free_head;
    let e = &mut inner.entries[idx];
    for pkt in e.txq.drain(..) {
        pkt.free(Some(&p.counters.tx_discarded));
    }
    e.state = EntryState::Free;
    e.flags = EntryFlags::empty();
    e.proto_addr = K::ADDR_ZERO;
    e.proto_valid = false;
    e.hw_addr = MacAddr::ZERO;
    e.hw_valid = false;
    e.sender_proto = None;
    e.accessed = 0;
    e.attempts = 0;
    e.prev = None;
    e.generation = e.generation.wrapping_add(1);
    e.next = free_head;

    inner.free_head = Some(slot);
    inner.used -= 1;
}

/// Upsert a resolved binding.  `mcast` marks a synthesized multicast
/// mapping, which also takes a hash-bucket reference on the interface.
fn add_resolved_locked<K: CacheKind>(
    inner: &mut CacheInner<K>,
    iface: IfIndex,
    proto: K::Addr,
    hw: MacAddr,
    mcast: bool,
    p: &CacheParams<'_>,
) -> Result<(), NetError> {
    if let Some(slot) = find_locked(inner, iface, proto) {
        // Appeared meanwhile; just refresh the binding and its timer.
        let idx = slot as usize;
        let key = pack_key(slot, inner.entries[idx].generation);
        if inner.entries[idx].hw_valid {
            inner.entries[idx].hw_addr = hw;
            if let Some(tok) = inner.entries[idx].timer.take() {
                p.wheel.cancel(tok);
            }
            match p.wheel.schedule(p.renew_ticks, K::RENEW_TIMER, key) {
                Some(tok) => inner.entries[idx].timer = Some(tok),
                None => {
                    unlink_locked(inner, slot);
                    release_locked(inner, slot, false, p);
                }
            }
        }
        return Ok(());
    }

    let slot = allocate_locked(inner, p)?;
    let idx = slot as usize;
    let key = pack_key(slot, inner.entries[idx].generation);
    match p.wheel.schedule(p.renew_ticks, K::RENEW_TIMER, key) {
        Some(tok) => inner.entries[idx].timer = Some(tok),
        None => {
            release_locked(inner, slot, false, p);
            return Err(NetError::NoTimerAvailable);
        }
    }

    let e = &mut inner.entries[idx];
    e.state = EntryState::Resolved;
    e.iface = iface;
    e.proto_addr = proto;
    e.proto_valid = true;
    e.hw_addr = hw;
    e.hw_valid = true;
    if mcast {
        e.flags.insert(EntryFlags::MCAST);
    }
    insert_head_locked(inner, slot);
    if mcast {
        p.ifaces.mcast_hw_ref(iface, hw);
    }

    log::debug!("{}: learned {} -> {} on if {}", K::NAME, proto, hw, iface);
    Ok(())
}

/// Resolve a timer key to a live slot, or `None` if the generation is
/// stale or the slot is free.
fn validate_key<K: CacheKind>(inner: &CacheInner<K>, key: u32) -> Option<u16> {
    let slot = key_slot(key);
    let e = inner.entries.get(slot as usize)?;
    if e.generation != key_generation(key) || !e.flags.contains(EntryFlags::IN_USE) {
        return None;
    }
    Some(slot)
}
