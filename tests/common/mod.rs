#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustrial_net::net::arp::ArpPacket;
use rustrial_net::net::config::StackConfig;
use rustrial_net::net::device::{DeviceType, MacAddr, NetDevice, NetworkDriver};
use rustrial_net::net::error::{NetError, NetResult};
use rustrial_net::net::ethernet::{self, ETHERTYPE_ARP, ETHERTYPE_IPV4, EthernetHeader};
use rustrial_net::net::ipv4::{self, Ipv4Header};
use rustrial_net::net::loopback::{FrameQueue, LoopbackDriver};
use rustrial_net::net::stack::NetworkStack;

pub const OUR_MAC: MacAddr = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
pub const PEER_MAC: MacAddr = [0x52, 0x54, 0x00, 0xAB, 0xCD, 0xEF];
pub const GATEWAY_MAC: MacAddr = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];

pub const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Clock that moves forward by `step` ms on every read
#[derive(Clone)]
pub struct StepClock {
    now: Arc<AtomicU64>,
    step: u64,
}

impl StepClock {
    pub fn new(step: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(1_000)),
            step,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    /// Closure handed to the stack
    pub fn source(&self) -> impl Fn() -> u64 + Send + Sync + use<> {
        let now = Arc::clone(&self.now);
        let step = self.step;
        move || now.fetch_add(step, Ordering::SeqCst)
    }
}

/// Driver that records transmitted frames and lets a closure play the
/// other end of the wire
pub struct ScriptedDriver {
    sent: FrameQueue,
    inbound: FrameQueue,
    responder: Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>,
}

impl NetworkDriver for ScriptedDriver {
    fn transmit(&mut self, frame: &[u8]) -> NetResult<()> {
        self.sent.push(frame.to_vec());
        for reply in (self.responder)(frame) {
            self.inbound.push(reply);
        }
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> NetResult<usize> {
        let frame = self.inbound.pop().ok_or(NetError::Timeout)?;
        let len = frame.len().min(buffer.len());
        buffer[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }
}

pub struct Harness {
    pub stack: NetworkStack,
    pub device: Arc<NetDevice>,
    /// Frames the stack transmitted
    pub sent: FrameQueue,
    /// Frames waiting for the stack to receive
    pub inbound: FrameQueue,
    pub clock: StepClock,
}

impl Harness {
    /// Deliver `frame` to the stack on its next receive
    pub fn inject(&self, frame: Vec<u8>) {
        self.inbound.push(frame);
    }

    /// Every frame sent so far, oldest first
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        self.sent.drain()
    }

    /// IPv4 datagrams sent so far, ARP frames skipped
    pub fn take_sent_ipv4(&self) -> Vec<(Ipv4Header, Vec<u8>)> {
        self.take_sent().iter().filter_map(|frame| parse_ipv4(frame)).collect()
    }
}

fn configured(config: StackConfig, clock: StepClock, driver: Box<dyn NetworkDriver>) -> (NetworkStack, Arc<NetDevice>) {
    let stack = NetworkStack::new(config, clock.source());
    let device = NetDevice::new("eth0", DeviceType::Ethernet, OUR_MAC, driver).unwrap();
    let device = stack.register_device(device).unwrap();
    stack.set_ip("eth0", OUR_IP, NETMASK, GATEWAY).unwrap();
    device.set_up(true);
    (stack, device)
}

/// eth0 at 10.0.0.5/24 (gateway 10.0.0.1) on a wire the test drives by hand
pub fn wired() -> Harness {
    wired_with(StackConfig::default())
}

pub fn wired_with(config: StackConfig) -> Harness {
    let clock = StepClock::new(1);
    let (driver, sent, inbound) = LoopbackDriver::wire(256);
    let (stack, device) = configured(config, clock.clone(), Box::new(driver));
    Harness {
        stack,
        device,
        sent,
        inbound,
        clock,
    }
}

/// eth0 as in [`wired`], with `responder` answering every transmitted frame
pub fn scripted<F>(config: StackConfig, responder: F) -> Harness
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let clock = StepClock::new(1);
    let sent = FrameQueue::new();
    let inbound = FrameQueue::new();
    let driver = ScriptedDriver {
        sent: sent.clone(),
        inbound: inbound.clone(),
        responder: Box::new(responder),
    };
    let (stack, device) = configured(config, clock.clone(), Box::new(driver));
    Harness {
        stack,
        device,
        sent,
        inbound,
        clock,
    }
}

/// Ethernet frame from `src` to `dest`
pub fn frame(dest: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    ethernet::build_frame(dest, src, ethertype, payload).unwrap()
}

/// IPv4 datagram from `src_ip` (at PEER_MAC) to `dest_ip`, framed to `dest_mac`
pub fn ipv4_frame(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: u8, payload: &[u8], dest_mac: MacAddr) -> Vec<u8> {
    let packet = ipv4::build_packet(src_ip, dest_ip, protocol, 0x4242, payload).unwrap();
    frame(dest_mac, PEER_MAC, ETHERTYPE_IPV4, &packet)
}

/// Datagram from the peer to us
pub fn from_peer(protocol: u8, payload: &[u8]) -> Vec<u8> {
    ipv4_frame(PEER_IP, OUR_IP, protocol, payload, OUR_MAC)
}

/// ARP reply telling us `ip` is at `mac`
pub fn arp_reply_frame(ip: Ipv4Addr, mac: MacAddr) -> Vec<u8> {
    let reply = ArpPacket::new_reply(mac, ip, OUR_MAC, OUR_IP);
    frame(OUR_MAC, mac, ETHERTYPE_ARP, &reply.to_bytes())
}

pub fn parse_ethernet(frame: &[u8]) -> Option<(EthernetHeader, &[u8])> {
    let header = EthernetHeader::from_bytes(frame).ok()?;
    Some((header, &frame[ethernet::HEADER_SIZE..]))
}

pub fn parse_arp(frame: &[u8]) -> Option<ArpPacket> {
    let (header, payload) = parse_ethernet(frame)?;
    if header.ethertype != ETHERTYPE_ARP {
        return None;
    }
    ArpPacket::from_bytes(payload).ok()
}

/// IPv4 header and payload (padding stripped)
pub fn parse_ipv4(frame: &[u8]) -> Option<(Ipv4Header, Vec<u8>)> {
    let (header, payload) = parse_ethernet(frame)?;
    if header.ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let (ip, len) = Ipv4Header::from_bytes(payload).ok()?;
    let end = len + ip.payload_length();
    Some((ip, payload[len..end].to_vec()))
}

/// ARP reply for requests asking about one of `ips`, answered by `mac`
pub fn answer_arp(frame: &[u8], ips: &[Ipv4Addr], mac: MacAddr) -> Option<Vec<u8>> {
    let request = parse_arp(frame)?;
    if !request.is_request() || !ips.contains(&request.target_ip) {
        return None;
    }
    Some(arp_reply_frame(request.target_ip, mac))
}
