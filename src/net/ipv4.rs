//! IPv4 Protocol Implementation
//!
//! Implements IPv4 header parsing, building, checksums, next-hop selection
//! and dispatch of inbound datagrams to ICMP, TCP and UDP.
//!
//! # References
//! - RFC 791: Internet Protocol (IPv4)
//! - RFC 1071: Computing the Internet Checksum

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU16, Ordering};

pub use core::net::Ipv4Addr;

use crate::net::checksum;
use crate::net::device::NetDevice;
use crate::net::error::{NetError, NetResult, alloc_buffer};
use crate::net::ethernet::{BROADCAST_MAC, ETHERTYPE_IPV4, MAX_PAYLOAD_SIZE};
use crate::net::stack::NetworkStack;

/// IPv4 Protocol Numbers (IANA assigned)
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 header flags (3-bit field)
pub mod flags {
    pub const DONT_FRAGMENT: u8 = 0b010;
    pub const MORE_FRAGMENTS: u8 = 0b001;
}

/// Default TTL (Time To Live) value
pub const DEFAULT_TTL: u8 = 64;

/// IPv4 header size without options
pub const HEADER_SIZE: usize = 20;

/// Offset of the header checksum field
const CHECKSUM_OFFSET: usize = 10;

/// Largest payload that fits one Ethernet frame
pub const MAX_PAYLOAD: usize = MAX_PAYLOAD_SIZE - HEADER_SIZE;

/// IPv4 Header Structure
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version|  IHL  |    DSCP   |ECN|         Total Length          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Identification        |Flags|      Fragment Offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Time to Live |    Protocol   |         Header Checksum       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Source Address                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Destination Address                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Internet Header Length in 32-bit words (5-15)
    pub ihl: u8,
    /// DSCP (6 bits) + ECN (2 bits)
    pub tos: u8,
    /// Total packet length (header + data) in bytes
    pub total_length: u16,
    pub identification: u16,
    /// Flags (see [`flags`])
    pub flags: u8,
    /// Fragment offset in 8-byte blocks
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a header without options, TTL 64, checksum left to `to_bytes`
    ///
    /// # Arguments
    /// * `src_ip` - Source IP address
    /// * `dest_ip` - Destination IP address
    /// * `protocol` - Protocol number (use `protocol::*` constants)
    /// * `payload_len` - Length of the payload data
    ///
    /// # Returns
    /// * `Err(Ipv4Error::InvalidLength)` - Header plus payload exceeds 65535 bytes
    pub fn new(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: u8, payload_len: u16) -> Result<Self, Ipv4Error> {
        let total_length = (HEADER_SIZE as u16)
            .checked_add(payload_len)
            .ok_or(Ipv4Error::InvalidLength)?;
        Ok(Self {
            ihl: 5,
            tos: 0,
            total_length,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src_ip,
            dest_ip,
        })
    }

    /// Parse and validate an IPv4 header
    ///
    /// # Returns
    /// - `Ok((Ipv4Header, header_len))` - Parsed header and offset to payload data
    /// - `Err(Ipv4Error)` - Parse or checksum error
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), Ipv4Error> {
        if data.len() < HEADER_SIZE {
            return Err(Ipv4Error::PacketTooShort);
        }

        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;
        if version != 4 {
            return Err(Ipv4Error::InvalidVersion(version));
        }
        if ihl < 5 {
            return Err(Ipv4Error::InvalidIhl(ihl));
        }

        let header_len = (ihl as usize) * 4;
        if data.len() < header_len {
            return Err(Ipv4Error::PacketTooShort);
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < header_len || (total_length as usize) > data.len() {
            return Err(Ipv4Error::InvalidLength);
        }

        if !checksum::verify(&data[..header_len], CHECKSUM_OFFSET) {
            return Err(Ipv4Error::ChecksumMismatch);
        }

        let flags_frag = u16::from_be_bytes([data[6], data[7]]);

        let header = Self {
            ihl,
            tos: data[1],
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags: (flags_frag >> 13) as u8,
            fragment_offset: flags_frag & 0x1FFF,
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src_ip: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dest_ip: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        };

        Ok((header, header_len))
    }

    /// Append the 20-byte header with a computed checksum to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.push((4 << 4) | 5);
        out.push(self.tos);
        out.extend_from_slice(&self.total_length.to_be_bytes());
        out.extend_from_slice(&self.identification.to_be_bytes());
        let flags_frag = ((self.flags as u16 & 0x07) << 13) | (self.fragment_offset & 0x1FFF);
        out.extend_from_slice(&flags_frag.to_be_bytes());
        out.push(self.ttl);
        out.push(self.protocol);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.src_ip.octets());
        out.extend_from_slice(&self.dest_ip.octets());
        checksum::fill(&mut out[start..], CHECKSUM_OFFSET);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        self.write_to(&mut bytes);
        bytes
    }

    /// Check if this packet is part of a fragmented datagram
    pub fn is_fragmented(&self) -> bool {
        (self.flags & flags::MORE_FRAGMENTS) != 0 || self.fragment_offset != 0
    }

    pub fn header_length(&self) -> usize {
        (self.ihl as usize) * 4
    }

    pub fn payload_length(&self) -> usize {
        (self.total_length as usize).saturating_sub(self.header_length())
    }
}

/// Build a complete IPv4 packet
pub fn build_packet(
    src_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
    protocol: u8,
    identification: u16,
    payload: &[u8],
) -> NetResult<Vec<u8>> {
    if payload.is_empty() {
        return Err(NetError::InvalidArg);
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(NetError::InvalidArg);
    }

    let mut header = Ipv4Header::new(src_ip, dest_ip, protocol, payload.len() as u16)?;
    header.identification = identification;

    let mut packet = alloc_buffer(HEADER_SIZE + payload.len())?;
    header.write_to(&mut packet);
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// IPv4 Error Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    /// Packet is too short to contain a valid header
    PacketTooShort,
    /// Invalid IP version (not 4)
    InvalidVersion(u8),
    /// Invalid IHL (Internet Header Length < 5)
    InvalidIhl(u8),
    /// Invalid total length field
    InvalidLength,
    /// Header checksum mismatch
    ChecksumMismatch,
}

impl fmt::Display for Ipv4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ipv4Error::PacketTooShort => write!(f, "Packet too short"),
            Ipv4Error::InvalidVersion(v) => write!(f, "Invalid IP version: {}", v),
            Ipv4Error::InvalidIhl(ihl) => write!(f, "Invalid IHL: {}", ihl),
            Ipv4Error::InvalidLength => write!(f, "Invalid total length"),
            Ipv4Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
        }
    }
}

impl From<Ipv4Error> for NetError {
    fn from(error: Ipv4Error) -> Self {
        match error {
            Ipv4Error::PacketTooShort | Ipv4Error::InvalidIhl(_) | Ipv4Error::InvalidLength => NetError::InvalidArg,
            Ipv4Error::InvalidVersion(_) => NetError::NotSupported,
            Ipv4Error::ChecksumMismatch => NetError::Failed,
        }
    }
}

/// Per-stack IP state
pub struct IpState {
    next_id: AtomicU16,
}

impl IpState {
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU16::new(1),
        }
    }

    pub(crate) fn next_identification(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IpState {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of a datagram accepted by [`NetworkStack::ip_receive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpDatagram {
    pub src: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub protocol: u8,
    /// Payload bytes now at the start of the receive buffer
    pub len: usize,
}

impl NetworkStack {
    /// Send `data` to `dest` through the primary device.
    ///
    /// The next hop is `dest` itself when on-link, else the gateway; the
    /// limited broadcast address skips ARP. An unresolved next hop sends one
    /// ARP request and fails with `NotFound`.
    pub fn ip_send(&self, dest: Ipv4Addr, protocol: u8, data: &[u8]) -> NetResult<()> {
        let device = self.primary_device()?;
        let addr = device.addr();

        let packet = build_packet(addr.ip, dest, protocol, self.ip.next_identification(), data)?;

        let dest_mac = if dest.is_broadcast() {
            BROADCAST_MAC
        } else {
            let hop = addr.next_hop(dest).ok_or(NetError::NotFound)?;
            self.arp_resolve(hop)?
        };

        self.ethernet_send(&device, dest_mac, ETHERTYPE_IPV4, &packet)
    }

    /// Receive one datagram from `device`.
    ///
    /// Pulls a frame through the Ethernet layer, validates the IPv4 header,
    /// moves the payload to the start of `buffer` and dispatches it to ICMP,
    /// TCP or UDP. Errors from the upper layer are logged and dropped; the
    /// datagram is still reported.
    ///
    /// # Returns
    /// * `Ok(IpDatagram)` - Payload is at `buffer[..datagram.len]`
    /// * `Err(NetError::Failed)` - Header checksum mismatch
    /// * `Err(NetError::NotFound)` - Addressed elsewhere, or consumed by ARP
    /// * `Err(NetError::NotSupported)` - Fragment or not IPv4
    /// * any error from [`NetworkStack::ethernet_receive`]
    pub fn ip_receive(&self, device: &NetDevice, buffer: &mut [u8]) -> NetResult<IpDatagram> {
        let len = self.ethernet_receive(device, buffer)?;
        let (header, header_len) = Ipv4Header::from_bytes(&buffer[..len])?;

        let our_ip = device.ip();
        let for_us = header.dest_ip == our_ip || header.dest_ip.is_broadcast() || our_ip.is_unspecified();
        if !for_us {
            log::trace!("[IP] dropping datagram for {}", header.dest_ip);
            return Err(NetError::NotFound);
        }

        if header.is_fragmented() {
            log::debug!("[IP] dropping fragment from {}", header.src_ip);
            return Err(NetError::NotSupported);
        }

        let payload_len = header.payload_length();
        buffer.copy_within(header_len..header_len + payload_len, 0);

        let datagram = IpDatagram {
            src: header.src_ip,
            dest: header.dest_ip,
            protocol: header.protocol,
            len: payload_len,
        };

        let payload = &buffer[..payload_len];
        let result = match header.protocol {
            protocol::ICMP => self.icmp_handle_packet(payload, header.src_ip),
            protocol::TCP => self.tcp_handle_packet(payload, header.src_ip, header.dest_ip),
            protocol::UDP => self.udp_receive(payload, header.src_ip, header.dest_ip),
            _ => Err(NetError::NotSupported),
        };
        if let Err(e) = result {
            log::debug!("[IP] protocol {} from {} dropped: {}", header.protocol, header.src_ip, e);
        }

        Ok(datagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const DEST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    #[test]
    fn test_build_and_parse() {
        let packet = build_packet(SRC, DEST, protocol::UDP, 7, &[1, 2, 3, 4]).unwrap();
        assert_eq!(packet.len(), 24);
        assert_eq!(packet[0], 0x45);
        assert_eq!(packet[8], DEFAULT_TTL);
        assert_eq!(packet[9], protocol::UDP);

        let (header, offset) = Ipv4Header::from_bytes(&packet).unwrap();
        assert_eq!(offset, HEADER_SIZE);
        assert_eq!(header.src_ip, SRC);
        assert_eq!(header.dest_ip, DEST);
        assert_eq!(header.identification, 7);
        assert_eq!(header.payload_length(), 4);
        assert!(!header.is_fragmented());
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut packet = build_packet(SRC, DEST, protocol::ICMP, 1, &[0; 8]).unwrap();
        packet[15] ^= 0x01;
        assert_eq!(Ipv4Header::from_bytes(&packet).map(|_| ()), Err(Ipv4Error::ChecksumMismatch));
        assert_eq!(NetError::from(Ipv4Error::ChecksumMismatch), NetError::Failed);
    }

    #[test]
    fn test_rejects_bad_version_and_length() {
        let mut packet = build_packet(SRC, DEST, protocol::ICMP, 1, &[0; 8]).unwrap();
        packet[0] = 0x65;
        assert_eq!(Ipv4Header::from_bytes(&packet).map(|_| ()), Err(Ipv4Error::InvalidVersion(6)));

        let packet = build_packet(SRC, DEST, protocol::ICMP, 1, &[0; 8]).unwrap();
        assert_eq!(Ipv4Header::from_bytes(&packet[..24]).map(|_| ()), Err(Ipv4Error::InvalidLength));
        assert_eq!(Ipv4Header::from_bytes(&packet[..19]).map(|_| ()), Err(Ipv4Error::PacketTooShort));
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let mut packet = build_packet(SRC, DEST, protocol::UDP, 1, &[9; 10]).unwrap();
        packet.resize(46, 0);
        let (header, _) = Ipv4Header::from_bytes(&packet).unwrap();
        assert_eq!(header.payload_length(), 10);
    }

    #[test]
    fn test_fragment_flags() {
        let mut header = Ipv4Header::new(SRC, DEST, protocol::UDP, 8).unwrap();
        header.flags = flags::DONT_FRAGMENT;
        let (parsed, _) = Ipv4Header::from_bytes(&[header.to_bytes(), vec![0; 8]].concat()).unwrap();
        assert_eq!(parsed.flags, flags::DONT_FRAGMENT);
        assert!(!parsed.is_fragmented());

        header.flags = flags::MORE_FRAGMENTS;
        let (parsed, _) = Ipv4Header::from_bytes(&[header.to_bytes(), vec![0; 8]].concat()).unwrap();
        assert!(parsed.is_fragmented());
    }

    #[test]
    fn test_payload_limits() {
        assert_eq!(build_packet(SRC, DEST, protocol::UDP, 1, &[]), Err(NetError::InvalidArg));
        let big = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(build_packet(SRC, DEST, protocol::UDP, 1, &big), Err(NetError::InvalidArg));
    }

    #[test]
    fn test_header_length_bounds() {
        let largest = u16::MAX - HEADER_SIZE as u16;
        assert_eq!(
            Ipv4Header::new(SRC, DEST, protocol::UDP, largest).map(|header| header.total_length),
            Ok(u16::MAX)
        );
        assert_eq!(
            Ipv4Header::new(SRC, DEST, protocol::UDP, largest + 1),
            Err(Ipv4Error::InvalidLength)
        );
        assert_eq!(Ipv4Header::new(SRC, DEST, protocol::UDP, u16::MAX), Err(Ipv4Error::InvalidLength));
    }
}
