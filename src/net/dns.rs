//! DNS (Domain Name System) Client Implementation
//!
//! Resolves hostnames to IPv4 addresses with a single A query sent over UDP
//! to the configured nameserver.
//!
//! # RFC References
//! - RFC 1035: Domain Names - Implementation and Specification
//!
//! # Example
//! ```ignore
//! let ip = stack.dns_resolve("example.com").await?;
//! log::info!("example.com resolved to {}", ip);
//! ```

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::net::{Ipv4Addr, Ipv6Addr};
use spin::Mutex;

use crate::net::config::StackConfig;
use crate::net::error::{NetError, NetResult};
use crate::net::stack::NetworkStack;
use crate::net::wait::Deadline;

/// Well-known DNS server port
pub const DNS_PORT: u16 = 53;

/// Header size (12 bytes)
pub const DNS_HEADER_SIZE: usize = 12;

/// Longest encoded name, length bytes and terminator included
pub const MAX_NAME_LEN: usize = 255;

/// Longest single label
pub const MAX_LABEL_LEN: usize = 63;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;

/// DNS error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    /// Empty name, non-ASCII text, or a label that is empty or longer
    /// than 63 bytes
    InvalidName,
    /// Encoded name longer than 255 bytes
    NameTooLong,
    /// Message ends early or uses a reserved label type
    Malformed,
    /// A compression pointer inside an already compressed name
    NestedPointer,
    /// Transaction ID does not match the query
    IdMismatch,
    /// QR bit clear
    NotAResponse,
    /// Non-zero RCODE
    ServerError(u8),
    /// No A record in the answer section
    NoAnswer,
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsError::InvalidName => write!(f, "Invalid domain name"),
            DnsError::NameTooLong => write!(f, "Domain name too long"),
            DnsError::Malformed => write!(f, "Malformed DNS message"),
            DnsError::NestedPointer => write!(f, "Nested DNS compression pointer"),
            DnsError::IdMismatch => write!(f, "DNS transaction ID mismatch"),
            DnsError::NotAResponse => write!(f, "DNS message is not a response"),
            DnsError::ServerError(rcode) => write!(f, "DNS server returned error (rcode={})", rcode),
            DnsError::NoAnswer => write!(f, "No A records found"),
        }
    }
}

impl From<DnsError> for NetError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::InvalidName | DnsError::NameTooLong => NetError::InvalidArg,
            DnsError::Malformed | DnsError::NestedPointer => NetError::Failed,
            DnsError::IdMismatch | DnsError::NotAResponse | DnsError::ServerError(_) | DnsError::NoAnswer => {
                NetError::NotFound
            }
        }
    }
}

/// DNS header structure (12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DnsHeader {
    id: u16,
    /// QR, Opcode, AA, TC, RD, RA, Z, RCODE
    flags: u16,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

impl DnsHeader {
    /// Standard query with recursion desired
    fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: FLAG_RECURSION_DESIRED,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    fn from_bytes(data: &[u8]) -> Result<Self, DnsError> {
        if data.len() < DNS_HEADER_SIZE {
            return Err(DnsError::Malformed);
        }

        Ok(Self {
            id: u16::from_be_bytes([data[0], data[1]]),
            flags: u16::from_be_bytes([data[2], data[3]]),
            qdcount: u16::from_be_bytes([data[4], data[5]]),
            ancount: u16::from_be_bytes([data[6], data[7]]),
            nscount: u16::from_be_bytes([data[8], data[9]]),
            arcount: u16::from_be_bytes([data[10], data[11]]),
        })
    }

    fn to_bytes(&self) -> [u8; DNS_HEADER_SIZE] {
        let mut bytes = [0u8; DNS_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.flags.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.qdcount.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.ancount.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.nscount.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.arcount.to_be_bytes());
        bytes
    }

    fn is_response(&self) -> bool {
        (self.flags & FLAG_RESPONSE) != 0
    }

    fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }
}

/// DNS resource record
#[derive(Debug, Clone)]
struct DnsRecord {
    name: String,
    rtype: u16,
    rclass: u16,
    ttl: u32,
    rdata: Vec<u8>,
}

impl DnsRecord {
    /// Parse a record starting at `offset`, returning it and the offset past it
    fn parse(data: &[u8], offset: usize) -> Result<(Self, usize), DnsError> {
        let (name, mut offset) = decode_name(data, offset)?;

        let fixed = data.get(offset..offset + 10).ok_or(DnsError::Malformed)?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        offset += 10;

        let rdata = data.get(offset..offset + rdlength).ok_or(DnsError::Malformed)?.to_vec();
        offset += rdlength;

        Ok((
            Self {
                name,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            offset,
        ))
    }

    fn as_ipv4(&self) -> Option<Ipv4Addr> {
        match self.rdata.as_slice() {
            [a, b, c, d] if self.rtype == TYPE_A && self.rclass == CLASS_IN => Some(Ipv4Addr::new(*a, *b, *c, *d)),
            _ => None,
        }
    }
}

/// Encode a domain name in DNS label format.
///
/// `"google.com"` becomes `[6]google[3]com[0]`. One trailing dot is
/// accepted. Internationalized names must already be in their ASCII
/// (punycode) form.
pub fn encode_name(name: &str) -> Result<Vec<u8>, DnsError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || !name.is_ascii() {
        return Err(DnsError::InvalidName);
    }
    if name.len() + 2 > MAX_NAME_LEN {
        return Err(DnsError::NameTooLong);
    }

    let mut encoded = Vec::new();
    encoded.try_reserve_exact(name.len() + 2).map_err(|_| DnsError::NameTooLong)?;
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidName);
        }
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }
    encoded.push(0);

    Ok(encoded)
}

/// Decode the name at `offset` in `message` into dotted form.
///
/// Follows at most one compression pointer; a pointer reached after
/// jumping is rejected. Returns the name and the offset just past its
/// in-place encoding.
pub fn decode_name(message: &[u8], offset: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut pos = offset;
    let mut resume: Option<usize> = None;
    let mut encoded_len = 1;

    loop {
        let len = *message.get(pos).ok_or(DnsError::Malformed)?;
        match len & 0xC0 {
            0xC0 => {
                if resume.is_some() {
                    return Err(DnsError::NestedPointer);
                }
                let low = *message.get(pos + 1).ok_or(DnsError::Malformed)?;
                resume = Some(pos + 2);
                pos = (((len & 0x3F) as usize) << 8) | low as usize;
            }
            0x00 if len == 0 => return Ok((name, resume.unwrap_or(pos + 1))),
            0x00 => {
                let len = len as usize;
                let label = message.get(pos + 1..pos + 1 + len).ok_or(DnsError::Malformed)?;
                encoded_len += len + 1;
                if encoded_len > MAX_NAME_LEN {
                    return Err(DnsError::NameTooLong);
                }
                let label = core::str::from_utf8(label).map_err(|_| DnsError::Malformed)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(label);
                pos += 1 + len;
            }
            _ => return Err(DnsError::Malformed),
        }
    }
}

/// Build a single-question A query
pub fn build_query(hostname: &str, id: u16) -> Result<Vec<u8>, DnsError> {
    let qname = encode_name(hostname)?;

    let mut packet = Vec::new();
    packet
        .try_reserve_exact(DNS_HEADER_SIZE + qname.len() + 4)
        .map_err(|_| DnsError::NameTooLong)?;
    packet.extend_from_slice(&DnsHeader::new_query(id).to_bytes());
    packet.extend_from_slice(&qname);
    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Parse a response to query `expected_id`, returning the first A record
pub fn parse_response(data: &[u8], expected_id: u16) -> Result<Ipv4Addr, DnsError> {
    let header = DnsHeader::from_bytes(data)?;
    if header.id != expected_id {
        return Err(DnsError::IdMismatch);
    }
    if !header.is_response() {
        return Err(DnsError::NotAResponse);
    }
    if header.rcode() != 0 {
        return Err(DnsError::ServerError(header.rcode()));
    }

    let mut offset = DNS_HEADER_SIZE;
    for _ in 0..header.qdcount {
        let (_, next) = decode_name(data, offset)?;
        if next + 4 > data.len() {
            return Err(DnsError::Malformed);
        }
        offset = next + 4;
    }

    for _ in 0..header.ancount {
        let (record, next) = DnsRecord::parse(data, offset)?;
        if let Some(ip) = record.as_ipv4() {
            log::trace!("[DNS] {} A {} (ttl {})", record.name, ip, record.ttl);
            return Ok(ip);
        }
        offset = next;
    }

    Err(DnsError::NoAnswer)
}

struct DnsState {
    nameserver: Ipv4Addr,
    next_id: u16,
}

/// Resolver state owned by the stack
pub struct DnsResolver {
    state: Mutex<DnsState>,
}

impl DnsResolver {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            state: Mutex::new(DnsState {
                nameserver: config.dns_nameserver,
                next_id: 1,
            }),
        }
    }

    /// Current nameserver and a fresh transaction ID
    fn next_query(&self) -> (Ipv4Addr, u16) {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        (state.nameserver, id)
    }
}

impl NetworkStack {
    pub fn dns_set_nameserver(&self, nameserver: Ipv4Addr) {
        self.dns.state.lock().nameserver = nameserver;
        log::info!("[DNS] nameserver set to {}", nameserver);
    }

    pub fn dns_nameserver(&self) -> Ipv4Addr {
        self.dns.state.lock().nameserver
    }

    /// Resolve `hostname` to an IPv4 address.
    ///
    /// Dotted-quad literals are returned without a query. Otherwise one
    /// query goes to the nameserver and responses are read until one with
    /// the matching transaction ID arrives or `dns_timeout_ms` passes.
    ///
    /// # Returns
    /// * `Err(NetError::NotFound)` - Server error or no A record
    /// * `Err(NetError::Timeout)` - No matching response in time
    /// * `Err(NetError::InvalidArg)` - Hostname cannot be encoded
    pub async fn dns_resolve(&self, hostname: &str) -> NetResult<Ipv4Addr> {
        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        let (nameserver, id) = self.dns.next_query();
        let query = build_query(hostname, id)?;

        let socket = self.udp_bind(0)?;
        self.arp_prepare_route(nameserver).await?;
        socket.send_to(&query, nameserver, DNS_PORT)?;
        log::debug!("[DNS] query {} id={} -> {}", hostname, id, nameserver);

        let deadline = Deadline::after(self.clock(), self.config.dns_timeout_ms);
        loop {
            let datagram = socket.recv_until(&deadline).await?;
            if datagram.src_port != DNS_PORT {
                continue;
            }
            match parse_response(&datagram.data, id) {
                Ok(ip) => {
                    log::info!("[DNS] {} -> {}", hostname, ip);
                    return Ok(ip);
                }
                Err(DnsError::IdMismatch | DnsError::NotAResponse) => {
                    log::debug!("[DNS] ignoring unrelated message from {}", datagram.src_ip);
                }
                Err(e) => {
                    log::debug!("[DNS] {} failed: {}", hostname, e);
                    return Err(e.into());
                }
            }
        }
    }

    /// AAAA lookups are not supported
    pub fn dns_resolve_ipv6(&self, _hostname: &str) -> NetResult<Ipv6Addr> {
        Err(NetError::NotImplemented)
    }
}
