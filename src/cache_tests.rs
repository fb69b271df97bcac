use crate::cache::{
    AddrCache, ArpKind, CacheParams, EntryFlags, EntryState, LookupStatus, NdpKind,
    ResolveOutcome, SenderUpdate,
};
use crate::iface::IfaceTable;
use crate::packetbuf::PacketBuf;
use crate::pool::BUF_POOL;
use crate::stats::CacheCounters;
use crate::timer::{TimerKind, TimerWheel};
use crate::types::{IfIndex, Ipv4Addr, Ipv6Addr, MacAddr};
use crate::{ETH_HEADER_LEN, ETHERTYPE_IPV4};

const IF0: IfIndex = IfIndex(0);
const OUR_IP: Ipv4Addr = Ipv4Addr([192, 0, 2, 10]);
const IP_A: Ipv4Addr = Ipv4Addr([192, 0, 2, 20]);
const IP_B: Ipv4Addr = Ipv4Addr([192, 0, 2, 21]);
const IP_C: Ipv4Addr = Ipv4Addr([192, 0, 2, 22]);
const MAC_A: MacAddr = MacAddr([2, 0, 0, 0, 0, 0xa]);
const MAC_B: MacAddr = MacAddr([2, 0, 0, 0, 0, 0xb]);

/// Collaborators the cache operations borrow.
struct Env {
    wheel: TimerWheel,
    counters: CacheCounters,
    ifaces: IfaceTable,
}

impl Env {
    fn new() -> Self {
        BUF_POOL.init();
        let env = Self {
            wheel: TimerWheel::new(),
            counters: CacheCounters::new(),
            ifaces: IfaceTable::new(),
        };
        env.ifaces.attach(IF0, true);
        env
    }

    fn params(&self) -> CacheParams<'_> {
        CacheParams {
            wheel: &self.wheel,
            counters: &self.counters,
            ifaces: &self.ifaces,
            accessed_th: 100,
            txq_th: 2,
            retry_ticks: 100,
            renew_ticks: 500,
            max_attempts_pend: 4,
            max_attempts_renew: 16,
        }
    }
}

/// An outbound frame with an Ethernet header and a one-byte marker.
fn egress_pkt(marker: u8) -> PacketBuf {
    let mut pkt = PacketBuf::alloc(IF0).expect("buffer pool exhausted");
    {
        let eth = pkt.push_header(ETH_HEADER_LEN).unwrap();
        eth.fill(0);
        eth[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    }
    let l2 = pkt.head();
    pkt.set_l2(l2);
    pkt.append(&[marker]).unwrap();
    pkt
}

fn marker(pkt: &PacketBuf) -> u8 {
    *pkt.payload().last().unwrap()
}

fn assert_invariants<K: crate::cache::CacheKind>(cache: &AddrCache<K>) {
    if let Err(what) = cache.check_invariants() {
        panic!("invariant violated: {}", what);
    }
}

// =============================================================================
// Allocation, release, and the free pool
// =============================================================================

#[test]
fn probe_then_remove_restores_pool() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    cache.probe(IF0, OUR_IP, IP_A, &p).expect("probe");
    let snap = cache.snapshot(IF0, IP_A).expect("entry");
    assert_eq!(snap.state, EntryState::Pending);
    assert!(snap.flags.contains(EntryFlags::PROBE));
    assert_eq!(snap.attempts, 1);
    assert!(snap.has_timer);
    assert_eq!(cache.pool_stats().used, 1);
    assert_invariants(&cache);

    assert!(cache.remove(IF0, IP_A, &p));
    assert!(cache.snapshot(IF0, IP_A).is_none());
    let stats = cache.pool_stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.avail, 4);
    assert_eq!(stats.used_max, 1);
    assert_eq!(env.wheel.pending_count(), 0, "probe timer cancelled");
    assert_invariants(&cache);

    // Second remove is a miss, not a double free.
    assert!(!cache.remove(IF0, IP_A, &p));
}

#[test]
fn zero_capacity_rejected() {
    assert!(AddrCache::<ArpKind>::new(0).is_err());
}

#[test]
fn exhaustion_with_only_pending_entries_fails() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(2).unwrap();

    cache.probe(IF0, OUR_IP, IP_A, &p).expect("probe a");
    cache.probe(IF0, OUR_IP, IP_B, &p).expect("probe b");

    // Free pool empty, every active entry pending: allocation must fail
    // rather than break a pending entry's promise.
    assert!(cache.probe(IF0, OUR_IP, IP_C, &p).is_err());
    assert_eq!(env.counters.none_avail.get(), 1);
    assert!(cache.snapshot(IF0, IP_A).is_some());
    assert!(cache.snapshot(IF0, IP_B).is_some());
    assert_invariants(&cache);
}

#[test]
fn eviction_recycles_oldest_resolved() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(2).unwrap();

    cache.add_resolved(IF0, IP_A, MAC_A, &p).unwrap();
    cache.add_resolved(IF0, IP_B, MAC_B, &p).unwrap();

    // A is at the tail; it goes first.
    cache.probe(IF0, OUR_IP, IP_C, &p).expect("probe evicts");
    assert!(cache.snapshot(IF0, IP_A).is_none());
    assert!(cache.snapshot(IF0, IP_B).is_some());
    assert_eq!(cache.snapshot(IF0, IP_C).unwrap().state, EntryState::Pending);
    assert_eq!(env.counters.evicted.get(), 1);
    assert_invariants(&cache);
}

#[test]
fn eviction_skips_pending_at_tail() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(2).unwrap();

    cache.probe(IF0, OUR_IP, IP_A, &p).expect("probe");
    cache.add_resolved(IF0, IP_B, MAC_B, &p).unwrap();

    // Tail is the pending entry; the scan walks past it and takes the
    // resolved one.
    cache.probe(IF0, OUR_IP, IP_C, &p).expect("probe evicts resolved");
    assert!(cache.snapshot(IF0, IP_A).is_some(), "pending survives");
    assert!(cache.snapshot(IF0, IP_B).is_none(), "resolved evicted");
    assert_invariants(&cache);
}

// =============================================================================
// Lookup and MRU promotion
// =============================================================================

#[test]
fn lookup_status_reflects_state() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    assert_eq!(cache.lookup(IF0, IP_A, 100), LookupStatus::NotFound);

    cache.probe(IF0, OUR_IP, IP_A, &p).unwrap();
    assert_eq!(cache.lookup(IF0, IP_A, 100), LookupStatus::Pending);
    assert!(cache.cached_hw(IF0, IP_A, 100).is_none());

    cache.add_resolved(IF0, IP_B, MAC_B, &p).unwrap();
    assert_eq!(cache.lookup(IF0, IP_B, 100), LookupStatus::Resolved);
    assert_eq!(cache.cached_hw(IF0, IP_B, 100), Some(MAC_B));

    // Same address on another interface is a distinct key.
    assert_eq!(cache.lookup(IfIndex(1), IP_B, 100), LookupStatus::NotFound);
}

#[test]
fn third_lookup_promotes_to_head() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    cache.add_resolved(IF0, IP_A, MAC_A, &p).unwrap();
    cache.add_resolved(IF0, IP_B, MAC_B, &p).unwrap();
    assert_eq!(cache.head_addr(), Some(IP_B));

    let th = 2;
    cache.lookup(IF0, IP_A, th);
    cache.lookup(IF0, IP_A, th);
    assert_eq!(cache.head_addr(), Some(IP_B), "below threshold, no move");
    assert_eq!(cache.snapshot(IF0, IP_A).unwrap().accessed, 2);

    cache.lookup(IF0, IP_A, th);
    assert_eq!(cache.head_addr(), Some(IP_A), "promoted past threshold");
    assert_eq!(cache.snapshot(IF0, IP_A).unwrap().accessed, 0);
    assert_invariants(&cache);
}

// =============================================================================
// Outbound resolution
// =============================================================================

#[test]
fn resolve_miss_creates_pending_and_queues() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    match cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p) {
        ResolveOutcome::Pending { req } => {
            assert_eq!(req.target, IP_A);
            assert_eq!(req.sender, Some(OUR_IP));
            assert!(req.unicast_to.is_none());
        }
        _ => panic!("expected Pending"),
    }
    let snap = cache.snapshot(IF0, IP_A).unwrap();
    assert_eq!(snap.state, EntryState::Pending);
    assert_eq!(snap.txq_len, 1);
    assert_eq!(snap.sender_proto, Some(OUR_IP));
    assert_invariants(&cache);

    // Second frame rides the same episode.
    assert!(matches!(
        cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(2), &p),
        ResolveOutcome::Queued
    ));
    assert_eq!(cache.snapshot(IF0, IP_A).unwrap().txq_len, 2);
    assert_invariants(&cache);
}

#[test]
fn fifo_at_threshold_rejects() {
    let env = Env::new();
    let p = env.params(); // txq_th = 2
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p);
    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(2), &p);

    match cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(3), &p) {
        ResolveOutcome::Unresolved { pkt } => assert_eq!(marker(&pkt), 3),
        _ => panic!("expected Unresolved at threshold"),
    }
    assert_eq!(cache.snapshot(IF0, IP_A).unwrap().txq_len, 2);
    assert_invariants(&cache);
}

#[test]
fn threshold_beyond_tx_capacity_rejects() {
    let env = Env::new();
    let mut p = env.params();
    p.txq_th = 8;
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p);
    match cache.resolve(IF0, IP_A, Some(OUR_IP), 4, egress_pkt(2), &p) {
        ResolveOutcome::NoBuffer { .. } => {}
        _ => panic!("threshold above device capacity must refuse"),
    }
}

#[test]
fn resolve_hit_fills_destination() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();
    cache.add_resolved(IF0, IP_A, MAC_A, &p).unwrap();

    match cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p) {
        ResolveOutcome::Resolved { pkt } => assert_eq!(pkt.eth_dst(), MAC_A),
        _ => panic!("expected Resolved"),
    }
}

#[test]
fn resolve_exhausted_cache_reports_no_cache() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(1).unwrap();

    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p);
    match cache.resolve(IF0, IP_B, Some(OUR_IP), 16, egress_pkt(2), &p) {
        ResolveOutcome::NoCache { pkt } => assert_eq!(marker(&pkt), 2),
        _ => panic!("expected NoCache"),
    }
}

// =============================================================================
// Inbound update and the pending queue flush
// =============================================================================

#[test]
fn reply_resolves_and_flushes_in_order() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p);
    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(2), &p);

    match cache.update_sender(IF0, IP_A, MAC_A, &p) {
        SenderUpdate::Flush { pkts, hw, iface } => {
            assert_eq!(hw, MAC_A);
            assert_eq!(iface, IF0);
            let markers: Vec<u8> = pkts.iter().map(marker).collect();
            assert_eq!(markers, vec![1, 2], "enqueue order preserved");
            for pkt in &pkts {
                assert!(pkt.pending_key().is_none(), "unlink tag cleared");
            }
        }
        _ => panic!("expected Flush"),
    }

    let snap = cache.snapshot(IF0, IP_A).unwrap();
    assert_eq!(snap.state, EntryState::Resolved);
    assert_eq!(snap.hw_addr, MAC_A);
    assert_eq!(snap.attempts, 0);
    assert_eq!(snap.txq_len, 0);
    assert!(snap.has_timer, "renew timer armed");
    assert_invariants(&cache);
}

#[test]
fn update_refreshes_remapped_sender() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();
    cache.add_resolved(IF0, IP_A, MAC_A, &p).unwrap();

    // The station legitimately re-mapped to another card.
    match cache.update_sender(IF0, IP_A, MAC_B, &p) {
        SenderUpdate::Refreshed => {}
        _ => panic!("expected Refreshed"),
    }
    assert_eq!(cache.snapshot(IF0, IP_A).unwrap().hw_addr, MAC_B);

    assert!(matches!(
        cache.update_sender(IF0, IP_B, MAC_B, &p),
        SenderUpdate::NotFound
    ));
}

// =============================================================================
// Timer-driven state machine
// =============================================================================

/// Advance the wheel and hand every expiry back to the cache, collecting
/// the requests the engine would put on the wire.
fn pump(env: &Env, cache: &AddrCache<ArpKind>, to_tick: u64) -> Vec<Option<MacAddr>> {
    let mut sent = Vec::new();
    for fired in env.wheel.advance_to(to_tick) {
        let p = env.params();
        let req = match fired.kind {
            TimerKind::ArpRetry => cache.on_retry_timer(fired.key, &p),
            TimerKind::ArpRenew => cache.on_renew_timer(fired.key, &p),
            _ => None,
        };
        if let Some(req) = req {
            sent.push(req.unicast_to);
        }
    }
    sent
}

#[test]
fn retry_exhaustion_frees_entry_and_discards_queue() {
    let env = Env::new();
    let p = env.params(); // retry 100 ticks, 4 attempts max
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p);
    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(2), &p);

    // Initial attempt happened at resolve time; three retries follow.
    assert_eq!(pump(&env, &cache, 100).len(), 1);
    assert_eq!(pump(&env, &cache, 200).len(), 1);
    assert_eq!(pump(&env, &cache, 300).len(), 1);
    let snap = cache.snapshot(IF0, IP_A).unwrap();
    assert_eq!(snap.attempts, 4, "all attempts spent");
    assert_eq!(snap.state, EntryState::Pending, "still alive at the limit");

    // The next expiry crosses the limit: entry freed, queue discarded.
    assert_eq!(pump(&env, &cache, 400).len(), 0);
    assert!(cache.snapshot(IF0, IP_A).is_none());
    assert_eq!(env.counters.tx_discarded.get(), 2);
    assert_eq!(cache.pool_stats().used, 0);
    assert_invariants(&cache);
}

#[test]
fn renew_cycle_confirms_by_unicast() {
    let env = Env::new();
    let p = env.params(); // renew 500 ticks
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p);
    match cache.update_sender(IF0, IP_A, MAC_A, &p) {
        SenderUpdate::Flush { .. } => {}
        _ => panic!("expected Flush"),
    }

    // Renew period elapses: entry enters Renew and confirms by unicast.
    let sent = pump(&env, &cache, 500);
    assert_eq!(sent, vec![Some(MAC_A)]);
    let snap = cache.snapshot(IF0, IP_A).unwrap();
    assert_eq!(snap.state, EntryState::Renew);
    assert_eq!(snap.attempts, 1);
    assert!(snap.has_timer);

    // Confirming traffic returns it to Resolved and zeroes the episode.
    assert!(matches!(
        cache.update_sender(IF0, IP_A, MAC_A, &p),
        SenderUpdate::Refreshed
    ));
    let snap = cache.snapshot(IF0, IP_A).unwrap();
    assert_eq!(snap.state, EntryState::Resolved);
    assert_eq!(snap.attempts, 0);
    assert_invariants(&cache);
}

#[test]
fn renew_exhaustion_frees_entry() {
    let env = Env::new();
    let mut p = env.params();
    p.max_attempts_renew = 2;
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    let _ = cache.resolve(IF0, IP_A, Some(OUR_IP), 16, egress_pkt(1), &p);
    match cache.update_sender(IF0, IP_A, MAC_A, &p) {
        SenderUpdate::Flush { .. } => {}
        _ => panic!("expected Flush"),
    }

    // Walk the wheel far enough for the renew probes to run dry.  Every
    // expiry is dispatched with the reduced renew limit.
    let mut alive_ticks = 0u64;
    for t in 1..=40u64 {
        let tick = t * 100;
        for fired in env.wheel.advance_to(tick) {
            let req = match fired.kind {
                TimerKind::ArpRetry => cache.on_retry_timer(fired.key, &p),
                TimerKind::ArpRenew => cache.on_renew_timer(fired.key, &p),
                _ => None,
            };
            let _ = req;
        }
        if cache.snapshot(IF0, IP_A).is_some() {
            alive_ticks = tick;
        } else {
            break;
        }
    }
    assert!(cache.snapshot(IF0, IP_A).is_none(), "entry freed after renewals dry up");
    assert!(alive_ticks >= 500, "survived at least one renew period");
    assert_eq!(cache.pool_stats().used, 0);
    assert_invariants(&cache);
}

#[test]
fn passively_learned_entry_expires_instead_of_renewing() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    // add_resolved leaves the sender protocol address unset.
    cache.add_resolved(IF0, IP_A, MAC_A, &p).unwrap();
    assert!(cache.snapshot(IF0, IP_A).unwrap().sender_proto.is_none());

    let sent = pump(&env, &cache, 500);
    assert!(sent.is_empty(), "no renew probe for a passive entry");
    assert!(cache.snapshot(IF0, IP_A).is_none());
    assert_invariants(&cache);
}

#[test]
fn stale_timer_key_is_ignored() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<ArpKind> = AddrCache::new(4).unwrap();

    cache.probe(IF0, OUR_IP, IP_A, &p).unwrap();
    let key = cache.snapshot(IF0, IP_A).unwrap().key;
    assert!(cache.remove(IF0, IP_A, &p));

    // The slot's generation moved on; the old key must not touch it.
    assert!(cache.on_retry_timer(key, &p).is_none());
    assert!(cache.on_renew_timer(key, &p).is_none());
    assert_invariants(&cache);
}

// =============================================================================
// Neighbor-discovery flavor
// =============================================================================

#[test]
fn ndp_cache_shares_the_machinery() {
    let env = Env::new();
    let p = env.params();
    let cache: AddrCache<NdpKind> = AddrCache::new(4).unwrap();

    let peer = Ipv6Addr([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    cache.add_resolved(IF0, peer, MAC_A, &p).unwrap();
    assert_eq!(cache.lookup(IF0, peer, 100), LookupStatus::Resolved);
    assert_eq!(cache.cached_hw(IF0, peer, 100), Some(MAC_A));
    assert_invariants(&cache);

    // Multicast short-circuit uses the 33:33 mapping.
    let all_mldv2 = Ipv6Addr([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x16]);
    match cache.resolve(IF0, all_mldv2, None, 16, egress_pkt(1), &p) {
        ResolveOutcome::Resolved { pkt } => {
            assert_eq!(pkt.eth_dst(), MacAddr([0x33, 0x33, 0, 0, 0, 0x16]));
        }
        _ => panic!("expected multicast short-circuit"),
    }
    assert_invariants(&cache);
}
