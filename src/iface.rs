//! Per-interface protocol state.
//!
//! The single source of truth for "our address" questions: which IPv4
//! addresses an interface owns, whether an address claim is still being
//! probed, whether another host was caught using one of our addresses,
//! and, for devices that filter multicast receive by hash, the
//! per-bucket reference counts.
//!
//! All mutable state sits behind one lock, held only briefly; no I/O
//! happens under it.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::types::{IfIndex, Ipv4Addr, MacAddr, NetError};

/// Maximum configured IPv4 addresses per interface.
pub const IF_MAX_ADDRS: usize = 2;

/// Number of multicast hash buckets (6-bit hash).
pub const MCAST_HASH_BUCKETS: usize = 64;

// =============================================================================
// IfaceState
// =============================================================================

/// Protocol-layer state of one interface.
struct IfaceState {
    iface: IfIndex,
    /// Configured IPv4 addresses; unused slots are `None`.
    addrs: [Option<Ipv4Addr>; IF_MAX_ADDRS],
    /// Address currently being claimed (duplicate-address probing).  A
    /// resolution message targeting it is treated as addressed to us.
    probe_addr: Option<Ipv4Addr>,
    /// Latched when another station was seen using one of our addresses.
    conflict: bool,
    /// Multicast hash bookkeeping is live for this interface.
    hash_filter: bool,
    /// Reference count per hash bucket.
    mcast_refs: [u8; MCAST_HASH_BUCKETS],
}

impl IfaceState {
    fn new(iface: IfIndex, hash_filter: bool) -> Self {
        Self {
            iface,
            addrs: [None; IF_MAX_ADDRS],
            probe_addr: None,
            conflict: false,
            hash_filter,
            mcast_refs: [0; MCAST_HASH_BUCKETS],
        }
    }

    fn holds(&self, addr: Ipv4Addr) -> bool {
        self.addrs.iter().any(|a| *a == Some(addr))
    }
}

// =============================================================================
// IfaceTable
// =============================================================================

/// Table of per-interface protocol state.
pub struct IfaceTable {
    inner: Mutex<Vec<IfaceState>>,
}

impl IfaceTable {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Create state for an interface.  Idempotent.
    pub fn attach(&self, iface: IfIndex, hash_filter: bool) {
        let mut inner = self.inner.lock();
        if inner.iter().any(|s| s.iface == iface) {
            return;
        }
        inner.push(IfaceState::new(iface, hash_filter));
    }

    /// Drop an interface's state.
    pub fn detach(&self, iface: IfIndex) {
        self.inner.lock().retain(|s| s.iface != iface);
    }

    // -- addresses ------------------------------------------------------------

    /// Add a configured IPv4 address to `iface`.
    ///
    /// Rejects non-unicast addresses and fails with
    /// [`NoBufferSpace`](NetError::NoBufferSpace) when all address slots
    /// are taken.
    pub fn add_addr(&self, iface: IfIndex, addr: Ipv4Addr) -> Result<(), NetError> {
        if !addr.is_valid_unicast_src() {
            return Err(NetError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let state = inner
            .iter_mut()
            .find(|s| s.iface == iface)
            .ok_or(NetError::NotFound)?;
        if state.holds(addr) {
            return Ok(());
        }
        for slot in state.addrs.iter_mut() {
            if slot.is_none() {
                *slot = Some(addr);
                log::debug!("iface: added {} on if {}", addr, iface);
                return Ok(());
            }
        }
        Err(NetError::NoBufferSpace)
    }

    /// Remove a configured address.
    pub fn remove_addr(&self, iface: IfIndex, addr: Ipv4Addr) -> Result<(), NetError> {
        let mut inner = self.inner.lock();
        let state = inner
            .iter_mut()
            .find(|s| s.iface == iface)
            .ok_or(NetError::NotFound)?;
        for slot in state.addrs.iter_mut() {
            if *slot == Some(addr) {
                *slot = None;
                return Ok(());
            }
        }
        Err(NetError::NotFound)
    }

    /// `true` if `addr` is configured on `iface`.
    pub fn is_host_addr(&self, iface: IfIndex, addr: Ipv4Addr) -> bool {
        let inner = self.inner.lock();
        inner
            .iter()
            .find(|s| s.iface == iface)
            .is_some_and(|s| s.holds(addr))
    }

    /// First configured address of `iface`, used as the sender protocol
    /// address of emitted requests.
    pub fn primary_addr(&self, iface: IfIndex) -> Option<Ipv4Addr> {
        let inner = self.inner.lock();
        inner
            .iter()
            .find(|s| s.iface == iface)?
            .addrs
            .iter()
            .flatten()
            .next()
            .copied()
    }

    /// Interface that owns `addr`, if any.
    pub fn iface_for_addr(&self, addr: Ipv4Addr) -> Option<IfIndex> {
        let inner = self.inner.lock();
        inner.iter().find(|s| s.holds(addr)).map(|s| s.iface)
    }

    // -- address-initialization probe -----------------------------------------

    /// Mark `addr` as being claimed on `iface`.
    pub fn set_probe_addr(&self, iface: IfIndex, addr: Ipv4Addr) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.iter_mut().find(|s| s.iface == iface) {
            state.probe_addr = Some(addr);
        }
    }

    /// Clear the in-progress claim on `iface`.
    pub fn clear_probe_addr(&self, iface: IfIndex) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.iter_mut().find(|s| s.iface == iface) {
            state.probe_addr = None;
        }
    }

    /// Address currently being claimed on `iface`, if any.
    pub fn probe_addr(&self, iface: IfIndex) -> Option<Ipv4Addr> {
        let inner = self.inner.lock();
        inner.iter().find(|s| s.iface == iface)?.probe_addr
    }

    // -- conflict latch -------------------------------------------------------

    /// Latch a protocol-address conflict on `iface`.
    pub fn record_conflict(&self, iface: IfIndex) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.iter_mut().find(|s| s.iface == iface) {
            if !state.conflict {
                log::warn!("iface: address conflict detected on if {}", iface);
            }
            state.conflict = true;
        }
    }

    /// Read and clear the conflict latch.
    pub fn take_conflict(&self, iface: IfIndex) -> bool {
        let mut inner = self.inner.lock();
        match inner.iter_mut().find(|s| s.iface == iface) {
            Some(state) => core::mem::replace(&mut state.conflict, false),
            None => false,
        }
    }

    // -- multicast hash bookkeeping -------------------------------------------

    /// Take a reference on the hash bucket of a multicast hardware
    /// address.  Returns `true` if the bucket went from unused to used
    /// (the driver should set the corresponding filter bit).
    ///
    /// No-op (returns `false`) on interfaces without hash filtering.
    pub fn mcast_hw_ref(&self, iface: IfIndex, hw: MacAddr) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.iter_mut().find(|s| s.iface == iface) else {
            return false;
        };
        if !state.hash_filter {
            return false;
        }
        let bucket = mcast_hash_bucket(hw);
        let refs = &mut state.mcast_refs[bucket];
        *refs = refs.saturating_add(1);
        *refs == 1
    }

    /// Drop a reference on the hash bucket of a multicast hardware
    /// address.  Returns `true` if the bucket became unused.
    pub fn mcast_hw_unref(&self, iface: IfIndex, hw: MacAddr) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.iter_mut().find(|s| s.iface == iface) else {
            return false;
        };
        if !state.hash_filter {
            return false;
        }
        let bucket = mcast_hash_bucket(hw);
        let refs = &mut state.mcast_refs[bucket];
        if *refs == 0 {
            return false;
        }
        *refs -= 1;
        *refs == 0
    }

    /// Reference count of a hash bucket (diagnostic).
    pub fn mcast_bucket_refs(&self, iface: IfIndex, hw: MacAddr) -> u8 {
        let inner = self.inner.lock();
        inner
            .iter()
            .find(|s| s.iface == iface)
            .map(|s| s.mcast_refs[mcast_hash_bucket(hw)])
            .unwrap_or(0)
    }
}

impl Default for IfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IfaceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IfaceTable({} interfaces)", self.inner.lock().len())
    }
}

// =============================================================================
// Policy helpers
// =============================================================================

/// Sender hardware address policy: a resolution message's source must be
/// a real station address: not zero, not a group address, and not this
/// host talking to itself.
pub fn is_valid_sender_hw(our_mac: MacAddr, sender: MacAddr) -> bool {
    !sender.is_zero() && !sender.is_multicast() && sender != our_mac
}

/// Hash bucket of a multicast hardware address: top six bits of the
/// frame CRC, as sampled by hash-filtering Ethernet MACs.
fn mcast_hash_bucket(hw: MacAddr) -> usize {
    (crc32_le(&hw.0) >> 26) as usize
}

/// CRC-32 (IEEE 802.3 polynomial, reflected), bitwise.
fn crc32_le(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let lsb = crc & 1;
            crc >>= 1;
            if lsb != 0 {
                crc ^= 0xedb8_8320;
            }
        }
    }
    !crc
}
