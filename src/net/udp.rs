//! UDP Protocol Implementation (RFC 768)
//!
//! Stateless datagram send plus a receive path that demultiplexes inbound
//! datagrams to bound [`UdpSocket`]s by destination port.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use spin::Mutex;

use crate::net::checksum::{self, Checksum};
use crate::net::error::{NetError, NetResult, alloc_buffer};
use crate::net::ipv4::protocol;
use crate::net::stack::NetworkStack;
use crate::net::wait::{Deadline, yield_now};

/// UDP header size (8 bytes)
pub const UDP_HEADER_SIZE: usize = 8;

const CHECKSUM_OFFSET: usize = 6;

/// UDP port range for ephemeral (dynamic) port allocation
pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Parsed UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub src_port: u16,
    pub dest_port: u16,
    /// Length of UDP header + data
    pub length: u16,
    /// Checksum (0 = not computed by the sender)
    pub checksum: u16,
    pub data: Vec<u8>,
}

/// Errors that can occur while parsing UDP datagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    /// Packet is too short to contain a valid UDP header
    PacketTooShort,
    /// Length field doesn't match actual packet size
    InvalidLength,
    ChecksumMismatch,
}

impl fmt::Display for UdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdpError::PacketTooShort => write!(f, "UDP packet too short"),
            UdpError::InvalidLength => write!(f, "Invalid UDP length"),
            UdpError::ChecksumMismatch => write!(f, "UDP checksum mismatch"),
        }
    }
}

impl From<UdpError> for NetError {
    fn from(error: UdpError) -> Self {
        match error {
            UdpError::PacketTooShort | UdpError::InvalidLength => NetError::InvalidArg,
            UdpError::ChecksumMismatch => NetError::Failed,
        }
    }
}

impl UdpPacket {
    /// Create a new UDP packet (checksum 0)
    pub fn new(src_port: u16, dest_port: u16, data: Vec<u8>) -> Self {
        let length = (UDP_HEADER_SIZE + data.len()) as u16;
        Self {
            src_port,
            dest_port,
            length,
            checksum: 0,
            data,
        }
    }

    /// Parse a UDP packet from raw bytes
    ///
    /// # Arguments
    /// * `bytes` - Raw packet bytes (UDP header + data); trailing bytes past
    ///   the length field are ignored
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UdpError> {
        if bytes.len() < UDP_HEADER_SIZE {
            return Err(UdpError::PacketTooShort);
        }

        let src_port = u16::from_be_bytes([bytes[0], bytes[1]]);
        let dest_port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let length = u16::from_be_bytes([bytes[4], bytes[5]]);
        let checksum = u16::from_be_bytes([bytes[6], bytes[7]]);

        if (length as usize) < UDP_HEADER_SIZE || length as usize > bytes.len() {
            return Err(UdpError::InvalidLength);
        }

        Ok(Self {
            src_port,
            dest_port,
            length,
            checksum,
            data: bytes[UDP_HEADER_SIZE..length as usize].to_vec(),
        })
    }

    /// Serialize the packet; the checksum field is written as stored
    pub fn to_bytes(&self) -> NetResult<Vec<u8>> {
        let mut bytes = alloc_buffer(UDP_HEADER_SIZE + self.data.len())?;
        bytes.extend_from_slice(&self.src_port.to_be_bytes());
        bytes.extend_from_slice(&self.dest_port.to_be_bytes());
        bytes.extend_from_slice(&self.length.to_be_bytes());
        bytes.extend_from_slice(&self.checksum.to_be_bytes());
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    /// Serialize with the pseudo-header checksum filled in
    pub fn to_bytes_with_checksum(&self, src_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> NetResult<Vec<u8>> {
        let mut bytes = self.to_bytes()?;
        checksum::fill_with_pseudo_header(&mut bytes, CHECKSUM_OFFSET, src_ip, dest_ip, protocol::UDP);
        // 0 means "no checksum" on the wire
        if bytes[6] == 0 && bytes[7] == 0 {
            bytes[6] = 0xFF;
            bytes[7] = 0xFF;
        }
        Ok(bytes)
    }
}

/// Verify the checksum of a raw UDP segment; 0 means not computed
pub fn verify_checksum(segment: &[u8], src_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> bool {
    match segment.get(CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2) {
        None => false,
        Some([0, 0]) => true,
        Some(_) => {
            // Summing the stored checksum too yields zero for intact data,
            // including the 0xFFFF form of a computed zero
            let mut sum = Checksum::new();
            sum.add_pseudo_header(src_ip, dest_ip, protocol::UDP, segment.len() as u16);
            sum.add_bytes(segment);
            sum.finish() == 0
        }
    }
}

/// A datagram delivered to a bound socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub data: Vec<u8>,
}

struct PortQueue {
    datagrams: VecDeque<UdpDatagram>,
}

/// Bound ports and their receive queues
pub struct UdpLayer {
    ports: Mutex<BTreeMap<u16, PortQueue>>,
    next_ephemeral: Mutex<u16>,
    queue_len: usize,
}

impl UdpLayer {
    pub fn new(queue_len: usize) -> Self {
        Self {
            ports: Mutex::new(BTreeMap::new()),
            next_ephemeral: Mutex::new(EPHEMERAL_PORT_START),
            queue_len,
        }
    }

    fn bind(&self, port: u16) -> NetResult<u16> {
        let mut ports = self.ports.lock();

        let port = if port == 0 {
            self.allocate_ephemeral(&ports)?
        } else if ports.contains_key(&port) {
            return Err(NetError::AlreadyExists);
        } else {
            port
        };

        ports.insert(
            port,
            PortQueue {
                datagrams: VecDeque::new(),
            },
        );
        Ok(port)
    }

    fn allocate_ephemeral(&self, ports: &BTreeMap<u16, PortQueue>) -> NetResult<u16> {
        let mut next = self.next_ephemeral.lock();
        for _ in EPHEMERAL_PORT_START..=EPHEMERAL_PORT_END {
            let candidate = *next;
            *next = if *next == EPHEMERAL_PORT_END {
                EPHEMERAL_PORT_START
            } else {
                *next + 1
            };
            if !ports.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(NetError::OutOfMemory)
    }

    fn unbind(&self, port: u16) {
        self.ports.lock().remove(&port);
    }

    fn deliver(&self, port: u16, datagram: UdpDatagram) -> NetResult<()> {
        let mut ports = self.ports.lock();
        let queue = ports.get_mut(&port).ok_or(NetError::NotFound)?;
        if queue.datagrams.len() >= self.queue_len {
            log::debug!("[UDP] port {} queue full, dropping datagram", port);
            return Err(NetError::OutOfMemory);
        }
        queue.datagrams.push_back(datagram);
        Ok(())
    }

    fn take(&self, port: u16) -> Option<UdpDatagram> {
        self.ports.lock().get_mut(&port)?.datagrams.pop_front()
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.ports.lock().contains_key(&port)
    }
}

impl NetworkStack {
    /// Send one datagram (checksum left zero)
    pub fn udp_send(&self, dest_ip: Ipv4Addr, dest_port: u16, src_port: u16, data: &[u8]) -> NetResult<()> {
        if data.is_empty() {
            return Err(NetError::InvalidArg);
        }

        let mut payload = alloc_buffer(data.len())?;
        payload.extend_from_slice(data);
        let packet = UdpPacket::new(src_port, dest_port, payload);
        self.ip_send(dest_ip, protocol::UDP, &packet.to_bytes()?)
    }

    /// Handle an IP-delivered UDP segment from `src_ip` to `dest_ip`.
    ///
    /// # Returns
    /// * `Ok(())` - Queued on the bound socket
    /// * `Err(NetError::NotFound)` - Nothing bound to the destination port
    /// * `Err(NetError::Failed)` - Checksum mismatch
    pub fn udp_receive(&self, segment: &[u8], src_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> NetResult<()> {
        let packet = UdpPacket::from_bytes(segment)?;
        let covered = &segment[..packet.length as usize];
        if !verify_checksum(covered, src_ip, dest_ip) {
            return Err(UdpError::ChecksumMismatch.into());
        }

        log::trace!(
            "[UDP] {}:{} -> port {} ({} bytes)",
            src_ip,
            packet.src_port,
            packet.dest_port,
            packet.data.len()
        );

        self.udp.deliver(
            packet.dest_port,
            UdpDatagram {
                src_ip,
                src_port: packet.src_port,
                data: packet.data,
            },
        )
    }

    /// Bind a socket to `port` (0 picks an ephemeral port)
    pub fn udp_bind(&self, port: u16) -> NetResult<UdpSocket<'_>> {
        let port = self.udp.bind(port)?;
        log::debug!("[UDP] bound port {}", port);
        Ok(UdpSocket { stack: self, port })
    }
}

/// A bound UDP port; unbound on drop
pub struct UdpSocket<'a> {
    stack: &'a NetworkStack,
    port: u16,
}

impl UdpSocket<'_> {
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn send_to(&self, data: &[u8], dest_ip: Ipv4Addr, dest_port: u16) -> NetResult<()> {
        self.stack.udp_send(dest_ip, dest_port, self.port, data)
    }

    /// Next queued datagram, if any
    pub fn try_recv_from(&self) -> Option<UdpDatagram> {
        self.stack.udp.take(self.port)
    }

    /// Wait up to `timeout_ms` for a datagram, pumping inbound frames
    pub async fn recv_from(&self, timeout_ms: u64) -> NetResult<UdpDatagram> {
        let deadline = Deadline::after(self.stack.clock(), timeout_ms);
        self.recv_until(&deadline).await
    }

    /// Wait for a datagram until `deadline`
    pub async fn recv_until(&self, deadline: &Deadline) -> NetResult<UdpDatagram> {
        let clock = self.stack.clock();
        loop {
            if let Some(datagram) = self.try_recv_from() {
                return Ok(datagram);
            }
            if deadline.is_expired(clock) {
                return Err(NetError::Timeout);
            }
            self.stack.poll();
            if let Some(datagram) = self.try_recv_from() {
                return Ok(datagram);
            }
            yield_now().await;
        }
    }
}

impl Drop for UdpSocket<'_> {
    fn drop(&mut self) {
        self.stack.udp.unbind(self.port);
        log::debug!("[UDP] unbound port {}", self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
    const DEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    #[test]
    fn test_packet_layout() {
        let bytes = UdpPacket::new(12345, 53, vec![1, 2, 3, 4]).to_bytes().unwrap();
        assert_eq!(bytes, vec![0x30, 0x39, 0x00, 0x35, 0x00, 0x0C, 0x00, 0x00, 1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_ignores_trailing_padding() {
        let mut bytes = UdpPacket::new(68, 67, vec![7; 3]).to_bytes().unwrap();
        bytes.extend_from_slice(&[0; 5]);
        let packet = UdpPacket::from_bytes(&bytes).unwrap();
        assert_eq!(packet.data, vec![7; 3]);
        assert_eq!(packet.length, 11);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(UdpPacket::from_bytes(&[0; 7]), Err(UdpError::PacketTooShort));
        let mut bytes = UdpPacket::new(1, 2, vec![0; 4]).to_bytes().unwrap();
        bytes[5] = 40;
        assert_eq!(UdpPacket::from_bytes(&bytes), Err(UdpError::InvalidLength));
    }

    #[test]
    fn test_checksum_round_trip() {
        let packet = UdpPacket::new(53, 49152, vec![0xDE, 0xAD, 0xBE]);
        let bytes = packet.to_bytes_with_checksum(SRC, DEST).unwrap();
        assert!(verify_checksum(&bytes, SRC, DEST));
        assert!(!verify_checksum(&bytes, SRC, Ipv4Addr::new(10, 0, 0, 6)));

        let unchecked = packet.to_bytes().unwrap();
        assert!(verify_checksum(&unchecked, SRC, Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn test_ephemeral_ports_skip_bound() {
        let layer = UdpLayer::new(4);
        assert_eq!(layer.bind(EPHEMERAL_PORT_START + 1), Ok(EPHEMERAL_PORT_START + 1));
        assert_eq!(layer.bind(0), Ok(EPHEMERAL_PORT_START));
        assert_eq!(layer.bind(0), Ok(EPHEMERAL_PORT_START + 2));
        assert_eq!(layer.bind(EPHEMERAL_PORT_START), Err(NetError::AlreadyExists));
        layer.unbind(EPHEMERAL_PORT_START);
        assert!(!layer.is_bound(EPHEMERAL_PORT_START));
    }

    #[test]
    fn test_deliver_respects_queue_limit() {
        let layer = UdpLayer::new(1);
        layer.bind(68).unwrap();
        let datagram = UdpDatagram {
            src_ip: SRC,
            src_port: 67,
            data: vec![1],
        };
        assert_eq!(layer.deliver(68, datagram.clone()), Ok(()));
        assert_eq!(layer.deliver(68, datagram.clone()), Err(NetError::OutOfMemory));
        assert_eq!(layer.deliver(69, datagram.clone()), Err(NetError::NotFound));
        assert_eq!(layer.take(68), Some(datagram));
        assert_eq!(layer.take(68), None);
    }
}
