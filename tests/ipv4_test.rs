//! ipv4 layer tests

mod common;

use common::*;
use rustrial_net::net::config::StackConfig;
use rustrial_net::net::device::MAX_FRAME_SIZE;
use rustrial_net::net::error::NetError;
use rustrial_net::net::ethernet::{BROADCAST_MAC, ETHERTYPE_IPV4};
use rustrial_net::net::ipv4::{self, DEFAULT_TTL, protocol};
use rustrial_net::net::stack::NetworkStack;
use std::net::Ipv4Addr;

#[test]
fn test_send_unresolved_next_hop() {
    let h = wired();
    assert_eq!(h.stack.ip_send(PEER_IP, protocol::UDP, &[1, 2, 3, 4]), Err(NetError::NotFound));

    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    let request = parse_arp(&sent[0]).unwrap();
    assert_eq!(request.target_ip, PEER_IP);
}

#[test]
fn test_send_to_cached_neighbor() {
    let h = wired();
    h.stack.arp_update_cache(PEER_IP, PEER_MAC);
    h.stack.ip_send(PEER_IP, protocol::UDP, &[1, 2, 3, 4]).unwrap();
    h.stack.ip_send(PEER_IP, protocol::UDP, &[5, 6]).unwrap();

    let sent = h.take_sent();
    assert_eq!(sent.len(), 2);
    let (eth, _) = parse_ethernet(&sent[0]).unwrap();
    assert_eq!(eth.dest_mac, PEER_MAC);
    assert_eq!(eth.ethertype, ETHERTYPE_IPV4);

    let (first, payload) = parse_ipv4(&sent[0]).unwrap();
    assert_eq!(first.src_ip, OUR_IP);
    assert_eq!(first.dest_ip, PEER_IP);
    assert_eq!(first.protocol, protocol::UDP);
    assert_eq!(first.ttl, DEFAULT_TTL);
    assert_eq!(payload, vec![1, 2, 3, 4]);

    let (second, _) = parse_ipv4(&sent[1]).unwrap();
    assert_eq!(second.identification, first.identification.wrapping_add(1));
}

#[test]
fn test_send_off_link_goes_to_gateway() {
    let h = wired();
    h.stack.arp_update_cache(GATEWAY, GATEWAY_MAC);
    let remote = Ipv4Addr::new(8, 8, 8, 8);
    h.stack.ip_send(remote, protocol::ICMP, &[0; 8]).unwrap();

    let sent = h.take_sent();
    let (eth, _) = parse_ethernet(&sent[0]).unwrap();
    assert_eq!(eth.dest_mac, GATEWAY_MAC);
    let (ip, _) = parse_ipv4(&sent[0]).unwrap();
    assert_eq!(ip.dest_ip, remote);
}

#[test]
fn test_send_broadcast_skips_arp() {
    let h = wired();
    h.stack.ip_send(Ipv4Addr::BROADCAST, protocol::UDP, &[9; 12]).unwrap();

    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    let (eth, _) = parse_ethernet(&sent[0]).unwrap();
    assert_eq!(eth.dest_mac, BROADCAST_MAC);
}

#[test]
fn test_send_without_device() {
    let stack = NetworkStack::new(StackConfig::default(), || 0u64);
    assert_eq!(stack.ip_send(PEER_IP, protocol::UDP, &[1]), Err(NetError::DeviceNotFound));
}

#[test]
fn test_send_with_device_down() {
    let h = wired();
    h.device.set_up(false);
    assert_eq!(h.stack.ip_send(PEER_IP, protocol::UDP, &[1]), Err(NetError::DeviceNotFound));
}

#[test]
fn test_receive_for_us() {
    let h = wired();
    h.inject(from_peer(200, &[0xC0, 0xFF, 0xEE]));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    let datagram = h.stack.ip_receive(&h.device, &mut buffer).unwrap();
    assert_eq!(datagram.src, PEER_IP);
    assert_eq!(datagram.dest, OUR_IP);
    assert_eq!(datagram.protocol, 200);
    assert_eq!(datagram.len, 3);
    assert_eq!(&buffer[..3], &[0xC0, 0xFF, 0xEE]);
}

#[test]
fn test_receive_not_for_us() {
    let h = wired();
    h.inject(ipv4_frame(PEER_IP, Ipv4Addr::new(10, 0, 0, 99), protocol::UDP, &[0; 8], OUR_MAC));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert_eq!(h.stack.ip_receive(&h.device, &mut buffer), Err(NetError::NotFound));
}

#[test]
fn test_unconfigured_device_accepts_anything() {
    let h = wired();
    h.stack
        .set_ip("eth0", Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
        .unwrap();
    h.inject(ipv4_frame(PEER_IP, Ipv4Addr::new(10, 0, 0, 99), 200, &[1], OUR_MAC));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert!(h.stack.ip_receive(&h.device, &mut buffer).is_ok());
}

#[test]
fn test_receive_bad_header_checksum() {
    let h = wired();
    let mut frame = from_peer(protocol::UDP, &[0; 8]);
    frame[14 + 10] ^= 0xFF;
    h.inject(frame);

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert_eq!(h.stack.ip_receive(&h.device, &mut buffer), Err(NetError::Failed));
}

#[test]
fn test_receive_drops_fragments() {
    let h = wired();
    let mut packet = ipv4::build_packet(PEER_IP, OUR_IP, protocol::UDP, 1, &[0; 8]).unwrap();
    packet[6] = 0x20;
    rustrial_net::net::checksum::fill(&mut packet[..ipv4::HEADER_SIZE], 10);
    h.inject(frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &packet));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert_eq!(h.stack.ip_receive(&h.device, &mut buffer), Err(NetError::NotSupported));
}

#[test]
fn test_receive_empty_ring() {
    let h = wired();
    let mut buffer = [0u8; MAX_FRAME_SIZE];
    assert_eq!(h.stack.ip_receive(&h.device, &mut buffer), Err(NetError::Timeout));
}

#[test]
fn test_upper_layer_errors_do_not_fail_receive() {
    let h = wired();
    // UDP to a port nobody bound
    let segment = [0x30, 0x39, 0x10, 0x00, 0x00, 0x09, 0x00, 0x00, 0x42];
    h.inject(from_peer(protocol::UDP, &segment));

    let mut buffer = [0u8; MAX_FRAME_SIZE];
    let datagram = h.stack.ip_receive(&h.device, &mut buffer).unwrap();
    assert_eq!(datagram.protocol, protocol::UDP);
    assert_eq!(datagram.len, segment.len());
}
