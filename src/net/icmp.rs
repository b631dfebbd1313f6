//! ICMP (Internet Control Message Protocol) Implementation
//! RFC 792 - https://www.rfc-editor.org/rfc/rfc792
//!
//! Echo request/reply. Incoming requests are answered directly; incoming
//! replies are posted to a bounded mailbox that ping reads from.

use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use crossbeam_queue::ArrayQueue;

use crate::net::checksum;
use crate::net::error::{NetError, NetResult, alloc_buffer};
use crate::net::ipv4::protocol;
use crate::net::stack::NetworkStack;

/// ICMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    /// Echo Reply (Type 0)
    EchoReply,
    /// Destination Unreachable (Type 3)
    DestinationUnreachable,
    /// Redirect (Type 5)
    Redirect,
    /// Echo Request (Type 8)
    EchoRequest,
    /// Time Exceeded (Type 11)
    TimeExceeded,
    Unknown(u8),
}

impl From<u8> for IcmpType {
    fn from(value: u8) -> Self {
        match value {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            5 => IcmpType::Redirect,
            8 => IcmpType::EchoRequest,
            11 => IcmpType::TimeExceeded,
            other => IcmpType::Unknown(other),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(icmp_type: IcmpType) -> Self {
        match icmp_type {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::Redirect => 5,
            IcmpType::EchoRequest => 8,
            IcmpType::TimeExceeded => 11,
            IcmpType::Unknown(val) => val,
        }
    }
}

impl fmt::Display for IcmpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpType::EchoReply => write!(f, "Echo Reply"),
            IcmpType::DestinationUnreachable => write!(f, "Destination Unreachable"),
            IcmpType::Redirect => write!(f, "Redirect"),
            IcmpType::EchoRequest => write!(f, "Echo Request"),
            IcmpType::TimeExceeded => write!(f, "Time Exceeded"),
            IcmpType::Unknown(val) => write!(f, "Unknown({})", val),
        }
    }
}

/// ICMP echo packet
///
/// Format:
/// ```text
/// [Type (1)][Code (1)][Checksum (2)]
/// [Identifier (2)][Sequence (2)][Data (variable)]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub icmp_type: IcmpType,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub data: Vec<u8>,
}

/// ICMP parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Packet too short (minimum 8 bytes)
    PacketTooShort,
    InvalidChecksum,
}

impl fmt::Display for IcmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpError::PacketTooShort => write!(f, "ICMP packet too short"),
            IcmpError::InvalidChecksum => write!(f, "Invalid ICMP checksum"),
        }
    }
}

impl From<IcmpError> for NetError {
    fn from(error: IcmpError) -> Self {
        match error {
            IcmpError::PacketTooShort => NetError::InvalidArg,
            IcmpError::InvalidChecksum => NetError::Failed,
        }
    }
}

impl IcmpPacket {
    /// Header size (type, code, checksum, identifier, sequence)
    pub const HEADER_SIZE: usize = 8;

    const CHECKSUM_OFFSET: usize = 2;

    /// Parse an ICMP packet, verifying its checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self, IcmpError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(IcmpError::PacketTooShort);
        }
        if !checksum::verify(data, Self::CHECKSUM_OFFSET) {
            return Err(IcmpError::InvalidChecksum);
        }

        Ok(IcmpPacket {
            icmp_type: IcmpType::from(data[0]),
            code: data[1],
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            data: data[Self::HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize with a freshly computed checksum
    pub fn to_bytes(&self) -> NetResult<Vec<u8>> {
        let mut bytes = alloc_buffer(Self::HEADER_SIZE + self.data.len())?;
        bytes.push(self.icmp_type.into());
        bytes.push(self.code);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.identifier.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.data);
        checksum::fill(&mut bytes, Self::CHECKSUM_OFFSET);
        Ok(bytes)
    }

    pub fn new_echo_request(identifier: u16, sequence: u16, data: Vec<u8>) -> Self {
        IcmpPacket {
            icmp_type: IcmpType::EchoRequest,
            code: 0,
            identifier,
            sequence,
            data,
        }
    }

    /// Echo reply carrying the request's identifier, sequence and data
    pub fn create_echo_reply(request: &IcmpPacket) -> Self {
        IcmpPacket {
            icmp_type: IcmpType::EchoReply,
            code: 0,
            identifier: request.identifier,
            sequence: request.sequence,
            data: request.data.clone(),
        }
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type == IcmpType::EchoRequest
    }

    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type == IcmpType::EchoReply
    }
}

impl fmt::Display for IcmpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ICMP {} (code={}, id={}, seq={}, {} bytes data)",
            self.icmp_type,
            self.code,
            self.identifier,
            self.sequence,
            self.data.len()
        )
    }
}

/// An echo reply seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub src: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
    pub data_len: usize,
    /// Uptime when the reply was handled
    pub received_at: u64,
}

/// Bounded queue of received echo replies; the oldest is dropped when full
pub struct EchoMailbox {
    replies: ArrayQueue<EchoReply>,
}

impl EchoMailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            replies: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn post(&self, reply: EchoReply) {
        // force_push evicts the oldest entry instead of failing
        let _ = self.replies.force_push(reply);
    }

    pub fn take(&self) -> Option<EchoReply> {
        self.replies.pop()
    }

    /// Remove the first reply accepted by `matches`.
    ///
    /// Every other reply is kept in arrival order if `retain` accepts it
    /// and dropped otherwise.
    pub fn take_matching(
        &self,
        matches: impl Fn(&EchoReply) -> bool,
        retain: impl Fn(&EchoReply) -> bool,
    ) -> Option<EchoReply> {
        let mut found = None;
        for _ in 0..self.replies.len() {
            let Some(reply) = self.replies.pop() else {
                break;
            };
            if found.is_none() && matches(&reply) {
                found = Some(reply);
            } else if retain(&reply) {
                let _ = self.replies.force_push(reply);
            } else {
                log::trace!("[ICMP] discarding reply from {} seq={}", reply.src, reply.sequence);
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

impl NetworkStack {
    /// Send an echo request to `dest`
    pub fn icmp_send_echo(&self, dest: Ipv4Addr, identifier: u16, sequence: u16, data: &[u8]) -> NetResult<()> {
        let mut payload = Vec::new();
        payload.try_reserve_exact(data.len())?;
        payload.extend_from_slice(data);

        let request = IcmpPacket::new_echo_request(identifier, sequence, payload);
        self.ip_send(dest, protocol::ICMP, &request.to_bytes()?)
    }

    /// Handle an inbound ICMP message from `src`.
    ///
    /// # Returns
    /// * `Err(NetError::Failed)` - Checksum mismatch
    /// * `Err(NetError::NotSupported)` - Anything but echo request/reply
    pub fn icmp_handle_packet(&self, data: &[u8], src: Ipv4Addr) -> NetResult<()> {
        self.primary_device()?;
        let packet = IcmpPacket::from_bytes(data)?;

        match packet.icmp_type {
            IcmpType::EchoRequest => {
                log::debug!("[ICMP] echo request from {} seq={}", src, packet.sequence);
                let reply = IcmpPacket::create_echo_reply(&packet);
                self.ip_send(src, protocol::ICMP, &reply.to_bytes()?)
            }
            IcmpType::EchoReply => {
                self.icmp.post(EchoReply {
                    src,
                    identifier: packet.identifier,
                    sequence: packet.sequence,
                    data_len: packet.data.len(),
                    received_at: self.now_ms(),
                });
                Ok(())
            }
            other => {
                log::debug!("[ICMP] ignoring {} from {}", other, src);
                Err(NetError::NotSupported)
            }
        }
    }

    /// Next unclaimed echo reply
    pub fn icmp_take_reply(&self) -> Option<EchoReply> {
        self.icmp.take()
    }
}
