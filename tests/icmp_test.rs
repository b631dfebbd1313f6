//! icmp protocol tests

mod common;

use common::*;
use rustrial_net::net::error::NetError;
use rustrial_net::net::icmp::{IcmpPacket, IcmpType};
use rustrial_net::net::ipv4::protocol;

fn echo_request(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    IcmpPacket::new_echo_request(identifier, sequence, data.to_vec())
        .to_bytes()
        .unwrap()
}

#[test]
fn test_echo_request_is_answered() {
    let h = wired();
    h.stack.arp_update_cache(PEER_IP, PEER_MAC);
    h.inject(from_peer(protocol::ICMP, &echo_request(0x1234, 7, b"abcd")));
    h.stack.poll();

    let sent = h.take_sent_ipv4();
    assert_eq!(sent.len(), 1);
    let (ip, payload) = &sent[0];
    assert_eq!(ip.src_ip, OUR_IP);
    assert_eq!(ip.dest_ip, PEER_IP);
    assert_eq!(ip.protocol, protocol::ICMP);

    let reply = IcmpPacket::from_bytes(payload).unwrap();
    assert_eq!(reply.icmp_type, IcmpType::EchoReply);
    assert_eq!(reply.identifier, 0x1234);
    assert_eq!(reply.sequence, 7);
    assert_eq!(reply.data, b"abcd".to_vec());
}

#[test]
fn test_echo_request_from_unknown_neighbor() {
    let h = wired();
    assert_eq!(
        h.stack.icmp_handle_packet(&echo_request(1, 1, b"x"), PEER_IP),
        Err(NetError::NotFound)
    );

    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(parse_arp(&sent[0]).unwrap().target_ip, PEER_IP);
}

#[test]
fn test_echo_reply_lands_in_mailbox() {
    let h = wired();
    let reply = IcmpPacket::create_echo_reply(&IcmpPacket::new_echo_request(1, 42, vec![0; 32]));
    h.inject(from_peer(protocol::ICMP, &reply.to_bytes().unwrap()));
    h.stack.poll();

    let received = h.stack.icmp_take_reply().unwrap();
    assert_eq!(received.src, PEER_IP);
    assert_eq!(received.identifier, 1);
    assert_eq!(received.sequence, 42);
    assert_eq!(received.data_len, 32);
    assert!(h.stack.icmp_take_reply().is_none());
    assert!(h.take_sent().is_empty());
}

#[test]
fn test_mailbox_drops_oldest_when_full() {
    let h = wired();
    let capacity = h.stack.config().echo_mailbox_len as u16;
    for sequence in 0..capacity + 3 {
        let reply = IcmpPacket::create_echo_reply(&IcmpPacket::new_echo_request(1, sequence, vec![]));
        h.stack.icmp_handle_packet(&reply.to_bytes().unwrap(), PEER_IP).unwrap();
    }

    assert_eq!(h.stack.icmp_take_reply().map(|reply| reply.sequence), Some(3));
}

#[test]
fn test_unsupported_type() {
    let h = wired();
    let mut message = [3u8, 1, 0, 0, 0, 0, 0, 0];
    rustrial_net::net::checksum::fill(&mut message, 2);
    assert_eq!(h.stack.icmp_handle_packet(&message, PEER_IP), Err(NetError::NotSupported));
}

#[test]
fn test_bad_checksum() {
    let h = wired();
    let mut message = echo_request(1, 1, b"data");
    message[8] ^= 0x01;
    assert_eq!(h.stack.icmp_handle_packet(&message, PEER_IP), Err(NetError::Failed));
    assert!(h.take_sent().is_empty());
}

#[test]
fn test_truncated_message() {
    let h = wired();
    assert_eq!(h.stack.icmp_handle_packet(&[8, 0, 0], PEER_IP), Err(NetError::InvalidArg));
}

#[test]
fn test_send_echo() {
    let h = wired();
    h.stack.arp_update_cache(PEER_IP, PEER_MAC);
    h.stack.icmp_send_echo(PEER_IP, 9, 3, b"ping").unwrap();

    let sent = h.take_sent_ipv4();
    let request = IcmpPacket::from_bytes(&sent[0].1).unwrap();
    assert!(request.is_echo_request());
    assert_eq!((request.identifier, request.sequence), (9, 3));
    assert_eq!(request.data, b"ping".to_vec());
}
