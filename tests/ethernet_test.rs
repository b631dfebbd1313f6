//! ethernet layer tests

mod common;

use common::*;
use rustrial_net::net::device::MAX_FRAME_SIZE;
use rustrial_net::net::error::NetError;
use rustrial_net::net::ethernet::{BROADCAST_MAC, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, MIN_FRAME_SIZE};

#[test]
fn test_send_uses_device_mac_and_pads() {
    let h = wired();
    h.stack.ethernet_send(&h.device, PEER_MAC, ETHERTYPE_IPV4, &[1, 2, 3]).unwrap();

    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    let (header, payload) = parse_ethernet(&sent[0]).unwrap();
    assert_eq!(header.dest_mac, PEER_MAC);
    assert_eq!(header.src_mac, OUR_MAC);
    assert_eq!(header.ethertype, ETHERTYPE_IPV4);
    assert_eq!(sent[0].len(), MIN_FRAME_SIZE);
    assert_eq!(&payload[..3], &[1, 2, 3]);
}

#[test]
fn test_send_rejects_empty_payload() {
    let h = wired();
    assert_eq!(h.stack.ethernet_send(&h.device, PEER_MAC, ETHERTYPE_IPV4, &[]), Err(NetError::InvalidArg));
    assert!(h.take_sent().is_empty());
}

#[test]
fn test_receive_strips_header() {
    let h = wired();
    h.inject(frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &[0xAA; 50]));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert_eq!(h.stack.ethernet_receive(&h.device, &mut buffer), Ok(50));
    assert!(buffer[..50].iter().all(|&b| b == 0xAA));
}

#[test]
fn test_receive_accepts_broadcast() {
    let h = wired();
    h.inject(frame(BROADCAST_MAC, PEER_MAC, ETHERTYPE_IPV4, &[7; 46]));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert_eq!(h.stack.ethernet_receive(&h.device, &mut buffer), Ok(46));
}

#[test]
fn test_receive_filters() {
    let h = wired();
    let mut buffer = [0u8; MAX_FRAME_SIZE];

    assert_eq!(h.stack.ethernet_receive(&h.device, &mut buffer), Err(NetError::Timeout));

    h.inject(frame(GATEWAY_MAC, PEER_MAC, ETHERTYPE_IPV4, &[0; 46]));
    assert_eq!(h.stack.ethernet_receive(&h.device, &mut buffer), Err(NetError::NotFound));

    h.inject(frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV6, &[0; 46]));
    assert_eq!(h.stack.ethernet_receive(&h.device, &mut buffer), Err(NetError::NotSupported));

    h.inject(vec![0xFF; 10]);
    assert_eq!(h.stack.ethernet_receive(&h.device, &mut buffer), Err(NetError::InvalidArg));
}

#[test]
fn test_arp_consumed_internally() {
    let h = wired();
    h.inject(arp_reply_frame(PEER_IP, PEER_MAC));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert_eq!(h.stack.ethernet_receive(&h.device, &mut buffer), Err(NetError::NotFound));
    assert_eq!(h.stack.arp_lookup(PEER_IP), Some(PEER_MAC));
}

#[test]
fn test_broadcast_arp_frame_reaches_handler() {
    let h = wired();
    let request = rustrial_net::net::arp::ArpPacket::new_request(PEER_MAC, PEER_IP, OUR_IP);
    h.inject(frame(BROADCAST_MAC, PEER_MAC, ETHERTYPE_ARP, &request.to_bytes()));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert_eq!(h.stack.ethernet_receive(&h.device, &mut buffer), Err(NetError::NotFound));
    assert_eq!(h.take_sent().len(), 1);
}
