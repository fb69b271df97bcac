//! Network device boundary: the `NetDevice` trait and the device registry.
//!
//! Drivers move bytes; the resolution core understands addresses.  Only
//! [`PacketBuf`] crosses the boundary.  All trait methods take `&self`;
//! drivers use interior mutability for their rings and counters, so the
//! core can transmit from the receive path, from timer callbacks, and
//! from API callers without aliasing issues.

extern crate alloc;

use alloc::boxed::Box;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use crate::packetbuf::PacketBuf;
use crate::types::{IfIndex, MacAddr, NetError};

// =============================================================================
// NetDevice trait
// =============================================================================

/// Abstraction for an Ethernet network device.
///
/// # Concurrency
///
/// - `tx()` may be called from several contexts; the registry serializes
///   callers per device.
/// - `mac()`, `mtu()`, `tx_buf_capacity()`, `link_up()`, `features()` are
///   read-only and callable from any context.
pub trait NetDevice: Send + Sync {
    /// Transmit one frame; the buffer moves into the driver.
    ///
    /// Returns [`LinkDown`](NetError::LinkDown) when the link is down and
    /// [`TxBusy`](NetError::TxBusy) on a transient ring-full condition.
    fn tx(&self, pkt: PacketBuf) -> Result<(), NetError>;

    /// Hardware MAC address.
    fn mac(&self) -> MacAddr;

    /// Maximum transmission unit (payload bytes, excluding the Ethernet
    /// header).
    fn mtu(&self) -> u16;

    /// Total number of transmit buffers the device can hold.
    ///
    /// Bounds the per-entry pending queue threshold.
    fn tx_buf_capacity(&self) -> u16;

    /// Whether the link is currently up.
    fn link_up(&self) -> bool {
        true
    }

    /// Capability flags advertised by the driver.
    fn features(&self) -> DeviceFeatures {
        DeviceFeatures::empty()
    }
}

// =============================================================================
// DeviceFeatures
// =============================================================================

bitflags! {
    /// Capability flags advertised by a network device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceFeatures: u32 {
        /// The device filters multicast receive by hash bucket; the stack
        /// maintains per-bucket reference counts for it.
        const MCAST_HASH_FILTER = 1 << 0;
        /// The device can loop locally addressed frames back in hardware.
        const HW_LOOPBACK       = 1 << 1;
    }
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// NetDeviceRegistry
// =============================================================================

/// Maximum number of simultaneously registered devices.
pub const MAX_DEVICES: usize = 8;

/// Fixed-slot storage for registered network devices.
///
/// The slot index is the device's stable [`IfIndex`].  The lock is held
/// for registration, enumeration, and for the duration of a `tx()` call,
/// which also serializes concurrent senders per this registry.
pub struct NetDeviceRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    slots: [Option<Box<dyn NetDevice>>; MAX_DEVICES],
    count: usize,
}

impl NetDeviceRegistry {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                slots: [const { None }; MAX_DEVICES],
                count: 0,
            }),
        }
    }

    /// Register a device; returns its assigned [`IfIndex`], or `None`
    /// when all slots are occupied.
    pub fn register(&self, dev: Box<dyn NetDevice>) -> Option<IfIndex> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        for (i, slot) in inner.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(dev);
                inner.count += 1;
                return Some(IfIndex(i));
            }
        }
        None
    }

    /// Unregister a device.  Returns `true` if the slot was occupied.
    pub fn unregister(&self, iface: IfIndex) -> bool {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        match inner.slots.get_mut(iface.0) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                inner.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Number of registered devices.
    #[inline]
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Transmit a frame through the device at `iface`.
    pub fn tx(&self, iface: IfIndex, pkt: PacketBuf) -> Result<(), NetError> {
        let inner = self.inner.lock();
        match inner.slots.get(iface.0) {
            Some(Some(dev)) => dev.tx(pkt),
            _ => Err(NetError::NotFound),
        }
    }

    /// MAC address of the device at `iface`.
    pub fn mac(&self, iface: IfIndex) -> Option<MacAddr> {
        let inner = self.inner.lock();
        inner.slots.get(iface.0)?.as_ref().map(|d| d.mac())
    }

    /// MTU of the device at `iface`.
    pub fn mtu(&self, iface: IfIndex) -> Option<u16> {
        let inner = self.inner.lock();
        inner.slots.get(iface.0)?.as_ref().map(|d| d.mtu())
    }

    /// Transmit-buffer capacity of the device at `iface`.
    pub fn tx_buf_capacity(&self, iface: IfIndex) -> Option<u16> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(iface.0)?
            .as_ref()
            .map(|d| d.tx_buf_capacity())
    }

    /// Feature flags of the device at `iface`.
    pub fn features(&self, iface: IfIndex) -> Option<DeviceFeatures> {
        let inner = self.inner.lock();
        inner.slots.get(iface.0)?.as_ref().map(|d| d.features())
    }
}

impl Default for NetDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetDeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetDeviceRegistry({} devices)", self.count())
    }
}
