use crate::packetbuf::{HEADROOM, PacketBuf};
use crate::pool::BUF_POOL;
use crate::types::{IfIndex, MacAddr};
use crate::{ETH_HEADER_LEN, ETHERTYPE_IPV4};

const IF0: IfIndex = IfIndex(0);

fn setup() {
    BUF_POOL.init();
}

#[test]
fn alloc_release_cycle() {
    setup();

    let mut slots = std::collections::HashSet::new();
    let mut bufs = Vec::new();
    for _ in 0..16 {
        let pkt = PacketBuf::alloc(IF0).expect("pool exhausted");
        bufs.push(pkt);
    }
    for pkt in &bufs {
        // Distinct buffers never alias payload storage.
        assert!(slots.insert(pkt.payload().as_ptr() as usize));
    }
    drop(bufs);

    // Slots came back: another wave succeeds.
    let again: Vec<_> = (0..16).map(|_| PacketBuf::alloc(IF0).expect("realloc")).collect();
    assert_eq!(again.len(), 16);
}

#[test]
fn tx_buffer_layout() {
    setup();

    let mut pkt = PacketBuf::alloc(IF0).expect("pool");
    assert!(pkt.is_empty());
    assert_eq!(pkt.head(), HEADROOM);

    {
        let eth = pkt.push_header(ETH_HEADER_LEN).unwrap();
        eth[..6].copy_from_slice(&MacAddr::BROADCAST.0);
        eth[6..12].copy_from_slice(&[2, 0, 0, 0, 0, 1]);
        eth[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    }
    assert_eq!(pkt.len(), ETH_HEADER_LEN);
    assert_eq!(pkt.head(), HEADROOM - ETH_HEADER_LEN as u16);

    pkt.append(&[0xde, 0xad]).unwrap();
    assert_eq!(pkt.len(), ETH_HEADER_LEN + 2);
    assert_eq!(&pkt.payload()[ETH_HEADER_LEN..], &[0xde, 0xad]);

    // Headroom is finite.
    assert!(pkt.push_header(HEADROOM as usize + 1).is_err());
}

#[test]
fn rx_buffer_offsets_match_wire() {
    setup();

    let frame = [0x11u8; 40];
    let mut pkt = PacketBuf::from_slice(IF0, &frame).expect("pool");
    assert_eq!(pkt.head(), 0);
    assert_eq!(pkt.len(), 40);

    pkt.set_l2(0);
    pkt.set_arp_offset(14);
    assert_eq!(pkt.arp_msg().len(), 26);

    // The demux consumes the Ethernet header; recorded offsets are
    // absolute, so the message view does not move.
    let eth = pkt.pull_header(ETH_HEADER_LEN).unwrap();
    assert_eq!(eth.len(), ETH_HEADER_LEN);
    assert_eq!(pkt.len(), 26);
    assert_eq!(pkt.arp_msg().len(), 26);

    pkt.truncate_at(14 + 20);
    assert_eq!(pkt.len(), 34);
    // Truncating to a larger end is a no-op.
    pkt.truncate_at(200);
    assert_eq!(pkt.len(), 34);
}

#[test]
fn eth_dst_rewrite() {
    setup();

    let mut pkt = PacketBuf::alloc(IF0).expect("pool");
    {
        let eth = pkt.push_header(ETH_HEADER_LEN).unwrap();
        eth.fill(0);
    }
    let l2 = pkt.head();
    pkt.set_l2(l2);
    assert_eq!(pkt.eth_dst(), MacAddr::ZERO);

    let mac = MacAddr([2, 0, 0, 0, 0, 9]);
    pkt.set_eth_dst(mac);
    assert_eq!(pkt.eth_dst(), mac);
    assert_eq!(&pkt.payload()[..6], &mac.0);
}

#[test]
fn free_with_counter() {
    setup();

    let ctr = crate::stats::Counter::new();
    let pkt = PacketBuf::alloc(IF0).expect("pool");
    pkt.free(Some(&ctr));
    assert_eq!(ctr.get(), 1);

    let pkt = PacketBuf::alloc(IF0).expect("pool");
    pkt.free(None);
    assert_eq!(ctr.get(), 1);
}
