//! ARP protocol engine: RFC 826 for Ethernet/IPv4.
//!
//! Decodes, validates, and answers received ARP messages, keeps the
//! address cache honest, and emits requests, replies, gratuitous
//! announcements, and probes.  [`ArpCore`] is the explicit per-stack
//! context holding the cache, timer wheel, device registry, interface
//! table, configuration, and counters; nothing in this crate is a global
//! except the frame buffer pool.
//!
//! # Receive policy
//!
//! Validation runs in a fixed order and every rejection bumps its own
//! counter, so a misbehaving peer can be diagnosed from statistics
//! alone.  With the address filter enabled, messages not directly
//! addressed to this host are discarded outright; with it disabled, any
//! validated message addressed to us may seed a resolved entry even when
//! no request was outstanding.

extern crate alloc;

use alloc::boxed::Box;

use crate::cache::{
    AddrCache, ArpKind, CacheParams, RequestTemplate, ResolveOutcome, SenderUpdate,
};
use crate::config::ArpConfig;
use crate::iface::{IfaceTable, is_valid_sender_hw};
use crate::netdev::{DeviceFeatures, NetDevice, NetDeviceRegistry};
use crate::packetbuf::PacketBuf;
use crate::pool::BUF_POOL;
use crate::stats::{ArpCounters, CacheCounters, CachePoolStats};
use crate::timer::{TimerKind, TimerWheel};
use crate::types::{IfIndex, Ipv4Addr, MacAddr, NetError};
use crate::{
    ARP_HLEN_ETHERNET, ARP_HTYPE_ETHERNET, ARP_MSG_LEN, ARP_OP_REPLY, ARP_OP_REQUEST,
    ARP_PLEN_IPV4, ARP_PTYPE_IPV4, ETH_ADDR_LEN, ETH_HEADER_LEN, ETHERTYPE_ARP,
};

// =============================================================================
// Wire codec
// =============================================================================

/// A decoded ARP message (fixed 28 octets for Ethernet/IPv4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpMsg {
    pub htype: u16,
    pub ptype: u16,
    pub hlen: u8,
    pub plen: u8,
    pub oper: u16,
    pub sender_hw: MacAddr,
    pub sender_proto: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_proto: Ipv4Addr,
}

impl ArpMsg {
    /// Decode from wire bytes.  Returns `None` on a short slice; field
    /// values are not judged here; validation is the engine's job.
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < ARP_MSG_LEN {
            return None;
        }
        Some(Self {
            htype: u16::from_be_bytes([b[0], b[1]]),
            ptype: u16::from_be_bytes([b[2], b[3]]),
            hlen: b[4],
            plen: b[5],
            oper: u16::from_be_bytes([b[6], b[7]]),
            sender_hw: MacAddr([b[8], b[9], b[10], b[11], b[12], b[13]]),
            sender_proto: Ipv4Addr([b[14], b[15], b[16], b[17]]),
            target_hw: MacAddr([b[18], b[19], b[20], b[21], b[22], b[23]]),
            target_proto: Ipv4Addr([b[24], b[25], b[26], b[27]]),
        })
    }

    /// Encode to wire bytes, big-endian multi-octet fields.
    pub fn emit(&self) -> [u8; ARP_MSG_LEN] {
        let mut b = [0u8; ARP_MSG_LEN];
        b[0..2].copy_from_slice(&self.htype.to_be_bytes());
        b[2..4].copy_from_slice(&self.ptype.to_be_bytes());
        b[4] = self.hlen;
        b[5] = self.plen;
        b[6..8].copy_from_slice(&self.oper.to_be_bytes());
        b[8..14].copy_from_slice(&self.sender_hw.0);
        b[14..18].copy_from_slice(&self.sender_proto.0);
        b[18..24].copy_from_slice(&self.target_hw.0);
        b[24..28].copy_from_slice(&self.target_proto.0);
        b
    }

    fn ethernet_ipv4(oper: u16) -> Self {
        Self {
            htype: ARP_HTYPE_ETHERNET,
            ptype: ARP_PTYPE_IPV4,
            hlen: ARP_HLEN_ETHERNET,
            plen: ARP_PLEN_IPV4,
            oper,
            sender_hw: MacAddr::ZERO,
            sender_proto: Ipv4Addr::UNSPECIFIED,
            target_hw: MacAddr::ZERO,
            target_proto: Ipv4Addr::UNSPECIFIED,
        }
    }
}

// =============================================================================
// Outbound resolution result
// =============================================================================

/// Outcome of [`ArpCore::resolve`], the hook the IP egress path calls.
pub enum Resolution {
    /// Hardware address filled in; the caller hands the frame to the
    /// driver.
    Resolved(PacketBuf),
    /// The core took the frame and will transmit it once the entry
    /// resolves.
    Pending,
    /// The entry's pending queue is full; the caller drops or reports.
    Unresolved(PacketBuf),
    /// Resource exhaustion; the frame is handed back.
    Failed(NetError, PacketBuf),
}

// =============================================================================
// ArpCore
// =============================================================================

/// The address-resolution core: one value per stack instance.
///
/// All state is owned here and passed by reference, which keeps multiple
/// stacks (and tests) independent.
pub struct ArpCore {
    devices: NetDeviceRegistry,
    ifaces: IfaceTable,
    wheel: TimerWheel,
    config: ArpConfig,
    cache: AddrCache<ArpKind>,
    counters: ArpCounters,
    cache_counters: CacheCounters,
}

impl ArpCore {
    /// Create a core with an ARP cache of `cache_capacity` entries.
    pub fn new(cache_capacity: u16) -> Result<Self, NetError> {
        BUF_POOL.init();
        Ok(Self {
            devices: NetDeviceRegistry::new(),
            ifaces: IfaceTable::new(),
            wheel: TimerWheel::new(),
            config: ArpConfig::new(),
            cache: AddrCache::new(cache_capacity)?,
            counters: ArpCounters::new(),
            cache_counters: CacheCounters::new(),
        })
    }

    /// Register a driver and create the interface's protocol state.
    pub fn attach_device(&self, dev: Box<dyn NetDevice>) -> Option<IfIndex> {
        let hash_filter = dev.features().contains(DeviceFeatures::MCAST_HASH_FILTER);
        let iface = self.devices.register(dev)?;
        self.ifaces.attach(iface, hash_filter);
        Some(iface)
    }

    // -- component access -----------------------------------------------------

    #[inline]
    pub fn devices(&self) -> &NetDeviceRegistry {
        &self.devices
    }

    #[inline]
    pub fn ifaces(&self) -> &IfaceTable {
        &self.ifaces
    }

    #[inline]
    pub fn config(&self) -> &ArpConfig {
        &self.config
    }

    #[inline]
    pub fn counters(&self) -> &ArpCounters {
        &self.counters
    }

    #[inline]
    pub fn cache_counters(&self) -> &CacheCounters {
        &self.cache_counters
    }

    #[inline]
    pub fn cache(&self) -> &AddrCache<ArpKind> {
        &self.cache
    }

    #[inline]
    pub fn wheel(&self) -> &TimerWheel {
        &self.wheel
    }

    /// Bundle the wheel, counters, and current tunables for a cache call.
    pub fn cache_params(&self) -> CacheParams<'_> {
        CacheParams {
            wheel: &self.wheel,
            counters: &self.cache_counters,
            ifaces: &self.ifaces,
            accessed_th: self.config.accessed_threshold(),
            txq_th: self.config.txq_threshold(),
            retry_ticks: self.config.retry_timeout_ticks(),
            renew_ticks: self.config.cache_timeout_ticks(),
            max_attempts_pend: self.config.max_attempts_pend(),
            max_attempts_renew: self.config.max_attempts_renew(),
        }
    }

    // =========================================================================
    // Receive path
    // =========================================================================

    /// Process a received ARP frame.
    ///
    /// The demultiplexer has recorded the ARP message offset in the
    /// buffer header and flagged broadcast reception.  The frame is
    /// always consumed; rejections only bump counters, never touch the
    /// cache.
    pub fn rx(&self, mut pkt: PacketBuf) {
        let iface = pkt.iface();
        let Some(our_mac) = self.devices.mac(iface) else {
            log::debug!("arp: rx on unregistered if {}", iface);
            return;
        };

        let msg = match ArpMsg::parse(pkt.arp_msg()) {
            Some(msg) => msg,
            None => {
                self.counters.rx_inv_msg_len.inc();
                return;
            }
        };

        // Fixed-order validation; first failure discards.
        if msg.htype != ARP_HTYPE_ETHERNET {
            self.counters.rx_inv_hw_type.inc();
            return;
        }
        if msg.hlen != ETH_ADDR_LEN as u8 {
            self.counters.rx_inv_hw_len.inc();
            return;
        }
        if !is_valid_sender_hw(our_mac, msg.sender_hw) {
            self.counters.rx_inv_hw_addr.inc();
            return;
        }
        if msg.ptype != ARP_PTYPE_IPV4 {
            self.counters.rx_inv_proto_type.inc();
            return;
        }
        if msg.plen != ARP_PLEN_IPV4 {
            self.counters.rx_inv_proto_len.inc();
            return;
        }
        if !msg.sender_proto.is_valid_unicast_src() {
            self.counters.rx_inv_proto_addr.inc();
            return;
        }

        let filter = self.config.addr_filter();
        let bcast = pkt.rx_broadcast();
        match msg.oper {
            ARP_OP_REQUEST => {
                // A unicast request must actually be for us.
                if filter && !bcast && msg.target_hw != our_mac {
                    self.counters.rx_inv_op_addr.inc();
                    return;
                }
            }
            ARP_OP_REPLY => {
                // A broadcast reply is non-conformant.
                if bcast {
                    self.counters.rx_inv_op_addr.inc();
                    return;
                }
            }
            _ => {
                self.counters.rx_inv_op_code.inc();
                return;
            }
        }

        // Ignore link padding and trailers beyond the fixed message.
        pkt.truncate_at(pkt.arp_offset() + ARP_MSG_LEN as u16);

        let is_request = msg.oper == ARP_OP_REQUEST;

        // Target check: are we the intended destination?
        let target_hw_ok = if filter && !is_request {
            msg.target_hw == our_mac
        } else {
            true
        };
        let target_proto_ok = self.ifaces.is_host_addr(iface, msg.target_proto)
            || self.ifaces.probe_addr(iface) == Some(msg.target_proto);
        let targeted = target_hw_ok && target_proto_ok;

        // RFC 3927 §2.5: someone else claiming one of our addresses.
        if msg.sender_hw != our_mac && self.ifaces.is_host_addr(iface, msg.sender_proto) {
            self.ifaces.record_conflict(iface);
            self.counters.conflicts.inc();
        }

        if filter && !targeted {
            self.counters.rx_not_target.inc();
            return;
        }

        // RFC 826 packet reception: merge the sender binding.
        let p = self.cache_params();
        match self.cache.update_sender(iface, msg.sender_proto, msg.sender_hw, &p) {
            SenderUpdate::Flush { pkts, hw, iface } => {
                for mut q in pkts {
                    q.set_eth_dst(hw);
                    if self.devices.tx(iface, q).is_err() {
                        self.counters.tx_err.inc();
                    }
                }
            }
            SenderUpdate::Refreshed => {}
            SenderUpdate::NotFound => {
                if filter {
                    if !is_request {
                        // A legitimate but late reply: its pending entry
                        // already timed out and was reclaimed.
                        self.counters.rx_late_reply.inc();
                        return;
                    }
                } else if !targeted {
                    self.counters.rx_not_target.inc();
                    return;
                }
                let _ = self
                    .cache
                    .add_resolved(iface, msg.sender_proto, msg.sender_hw, &p);
            }
        }

        if is_request {
            self.counters.rx_req.inc();
            if targeted {
                self.send_reply(iface, our_mac, &msg);
            }
        } else {
            self.counters.rx_reply.inc();
        }
    }

    // =========================================================================
    // Outbound resolution
    // =========================================================================

    /// Map `next_hop` to a hardware address for an outbound frame.
    ///
    /// The frame's owning interface and L2 offset must be set.  On a
    /// cache miss this creates a pending entry and puts a request on the
    /// wire before returning.
    pub fn resolve(&self, next_hop: Ipv4Addr, pkt: PacketBuf) -> Resolution {
        let iface = pkt.iface();
        let p = self.cache_params();
        let sender_hint = self.ifaces.primary_addr(iface);
        let tx_cap = self.devices.tx_buf_capacity(iface).unwrap_or(0);

        match self
            .cache
            .resolve(iface, next_hop, sender_hint, tx_cap, pkt, &p)
        {
            ResolveOutcome::Resolved { pkt } => Resolution::Resolved(pkt),
            ResolveOutcome::Queued => Resolution::Pending,
            ResolveOutcome::Pending { req } => {
                self.send_request(&req);
                Resolution::Pending
            }
            ResolveOutcome::Unresolved { pkt } => Resolution::Unresolved(pkt),
            ResolveOutcome::NoBuffer { pkt } => Resolution::Failed(NetError::NoBufferSpace, pkt),
            ResolveOutcome::NoCache { pkt } => Resolution::Failed(NetError::NoCacheAvailable, pkt),
            ResolveOutcome::NoTimer { pkt } => Resolution::Failed(NetError::NoTimerAvailable, pkt),
        }
    }

    // =========================================================================
    // Transmit path
    // =========================================================================

    /// Emit the request described by a cache template.  Transmit failures
    /// are counted and absorbed; the retry timer drives recovery.
    fn send_request(&self, req: &RequestTemplate<ArpKind>) {
        let Some(our_mac) = self.devices.mac(req.iface) else {
            return;
        };
        let mut msg = ArpMsg::ethernet_ipv4(ARP_OP_REQUEST);
        msg.sender_hw = our_mac;
        msg.sender_proto = req.sender.unwrap_or(Ipv4Addr::UNSPECIFIED);
        msg.target_proto = req.target;
        // Confirming a known binding goes unicast with the cached
        // address; first-time resolution broadcasts with a zero target.
        let eth_dst = match req.unicast_to {
            Some(hw) => {
                msg.target_hw = hw;
                hw
            }
            None => MacAddr::BROADCAST,
        };
        log::debug!(
            "arp: request for {} on if {} ({})",
            req.target,
            req.iface,
            if req.unicast_to.is_some() { "unicast" } else { "broadcast" }
        );
        match self.tx_msg(req.iface, our_mac, eth_dst, &msg) {
            Ok(()) => self.counters.tx_req.inc(),
            Err(_) => self.counters.tx_err.inc(),
        }
    }

    /// Answer a validated, target-confirmed request.
    fn send_reply(&self, iface: IfIndex, our_mac: MacAddr, req: &ArpMsg) {
        let mut msg = ArpMsg::ethernet_ipv4(ARP_OP_REPLY);
        msg.sender_hw = our_mac;
        msg.sender_proto = req.target_proto;
        msg.target_hw = req.sender_hw;
        msg.target_proto = req.sender_proto;
        log::debug!(
            "arp: reply to {} ({}) on if {}",
            req.sender_proto,
            req.sender_hw,
            iface
        );
        match self.tx_msg(iface, our_mac, req.sender_hw, &msg) {
            Ok(()) => self.counters.tx_reply.inc(),
            Err(_) => self.counters.tx_err.inc(),
        }
    }

    /// Broadcast a gratuitous request announcing `addr` on `iface`.
    ///
    /// Sender and target protocol addresses are both `addr`; the cache is
    /// not touched.  Conflicting answers surface through the normal
    /// receive path as an address conflict on the interface.
    pub fn send_gratuitous_request(&self, iface: IfIndex, addr: Ipv4Addr) -> Result<(), NetError> {
        let our_mac = self.devices.mac(iface).ok_or(NetError::NotFound)?;
        let mut msg = ArpMsg::ethernet_ipv4(ARP_OP_REQUEST);
        msg.sender_hw = our_mac;
        msg.sender_proto = addr;
        msg.target_proto = addr;
        self.tx_msg(iface, our_mac, MacAddr::BROADCAST, &msg)?;
        self.counters.tx_req_gratuitous.inc();
        Ok(())
    }

    /// Probe whether `target` is claimed on the network.
    ///
    /// Any existing entry is dropped, a fresh pending entry with a retry
    /// timer is created, and a request goes out.  After a retry cycle the
    /// caller inspects the cache: a resolved entry means some host
    /// answered.
    pub fn probe_addr(
        &self,
        iface: IfIndex,
        sender: Ipv4Addr,
        target: Ipv4Addr,
    ) -> Result<(), NetError> {
        let p = self.cache_params();
        let req = self.cache.probe(iface, sender, target, &p)?;
        self.send_request(&req);
        Ok(())
    }

    fn tx_msg(
        &self,
        iface: IfIndex,
        src: MacAddr,
        dst: MacAddr,
        msg: &ArpMsg,
    ) -> Result<(), NetError> {
        if self.devices.mtu(iface).unwrap_or(0) < ARP_MSG_LEN as u16 {
            return Err(NetError::InvalidArgument);
        }
        let Some(mut pkt) = PacketBuf::alloc(iface) else {
            return Err(NetError::NoBufferSpace);
        };
        {
            let eth = pkt.push_header(ETH_HEADER_LEN)?;
            eth[0..ETH_ADDR_LEN].copy_from_slice(&dst.0);
            eth[ETH_ADDR_LEN..2 * ETH_ADDR_LEN].copy_from_slice(&src.0);
            eth[2 * ETH_ADDR_LEN..ETH_HEADER_LEN].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        }
        let l2 = pkt.head();
        pkt.set_l2(l2);
        pkt.set_arp_offset(l2 + ETH_HEADER_LEN as u16);
        pkt.append(&msg.emit())?;
        self.devices.tx(iface, pkt)
    }

    // =========================================================================
    // Timer dispatch
    // =========================================================================

    /// Advance the timer wheel to `now_tick` and run the expiries.
    ///
    /// Call from the network-task context; both retry and renew handling
    /// may put requests on the wire.
    pub fn process_timers(&self, now_tick: u64) {
        let fired = self.wheel.advance_to(now_tick);
        for timer in &fired {
            match timer.kind {
                TimerKind::ArpRetry => {
                    let p = self.cache_params();
                    if let Some(req) = self.cache.on_retry_timer(timer.key, &p) {
                        self.send_request(&req);
                    }
                }
                TimerKind::ArpRenew => {
                    let p = self.cache_params();
                    if let Some(req) = self.cache.on_renew_timer(timer.key, &p) {
                        self.send_request(&req);
                    }
                }
                TimerKind::NdpRetry | TimerKind::NdpRenew => {
                    // Belongs to the companion neighbor-discovery engine.
                    log::trace!("arp: ignoring {:?} (key={})", timer.kind, timer.key);
                }
            }
        }
    }

    // =========================================================================
    // Application queries
    // =========================================================================

    /// Hardware address of a resolved binding, without changing state
    /// beyond the lookup bookkeeping.
    pub fn cached_hw_addr(&self, iface: IfIndex, addr: Ipv4Addr) -> Option<MacAddr> {
        self.cache
            .cached_hw(iface, addr, self.config.accessed_threshold())
    }

    /// Read and clear the interface's address-conflict latch.
    pub fn is_addr_conflict(&self, iface: IfIndex) -> bool {
        self.ifaces.take_conflict(iface)
    }

    /// Snapshot of the ARP cache pool.
    pub fn cache_pool_stats(&self) -> CachePoolStats {
        self.cache.pool_stats()
    }

    /// ARP cache utilization as a percentage.
    pub fn cache_usage_pct(&self) -> u8 {
        self.cache.pool_stats().usage_pct()
    }

    /// Reset the cache pool's used high-water mark.
    pub fn cache_pool_reset_used_max(&self) {
        self.cache.reset_used_max();
    }
}
