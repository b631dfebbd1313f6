//! ARP (Address Resolution Protocol) - RFC 826
//!
//! Maps IPv4 addresses to MAC addresses on the local link.
//! Packet format: [HW Type (2)][Proto Type (2)][HW Len (1)][Proto Len (1)]
//!                [Operation (2)][Sender MAC (6)][Sender IP (4)]
//!                [Target MAC (6)][Target IP (4)]
//!
//! Resolution never blocks: a cache miss broadcasts one request and reports
//! `NotFound`, and the caller retries once the reply has been seen.
//! [`NetworkStack::arp_resolve_wait`] wraps that in a bounded async wait.
//! Any observed reply updates the cache, solicited or not.

use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use spin::Mutex;

use crate::net::config::StackConfig;
use crate::net::device::{MacAddr, NetDevice};
use crate::net::error::{NetError, NetResult};
use crate::net::ethernet::{BROADCAST_MAC, ETHERTYPE_ARP};
use crate::net::stack::NetworkStack;
use crate::net::wait::{Deadline, yield_now};

/// ARP hardware type for Ethernet
pub const HW_TYPE_ETHERNET: u16 = 1;

/// ARP protocol type for IPv4
pub const PROTO_TYPE_IPV4: u16 = 0x0800;

/// ARP operation codes
pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// ARP packet size (fixed at 28 bytes)
pub const ARP_PACKET_SIZE: usize = 28;

/// Errors that can occur while parsing ARP packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short to be valid
    PacketTooShort,
    /// Invalid hardware type (not Ethernet)
    InvalidHardwareType,
    /// Invalid protocol type (not IPv4)
    InvalidProtocolType,
    /// Invalid hardware address length
    InvalidHardwareLength,
    /// Invalid protocol address length
    InvalidProtocolLength,
    /// Unknown operation code
    UnknownOperation,
}

impl fmt::Display for ArpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArpError::PacketTooShort => write!(f, "ARP packet too short"),
            ArpError::InvalidHardwareType => write!(f, "ARP hardware type is not Ethernet"),
            ArpError::InvalidProtocolType => write!(f, "ARP protocol type is not IPv4"),
            ArpError::InvalidHardwareLength => write!(f, "Invalid ARP hardware address length"),
            ArpError::InvalidProtocolLength => write!(f, "Invalid ARP protocol address length"),
            ArpError::UnknownOperation => write!(f, "Unknown ARP operation"),
        }
    }
}

impl From<ArpError> for NetError {
    fn from(error: ArpError) -> Self {
        match error {
            ArpError::PacketTooShort
            | ArpError::InvalidHardwareLength
            | ArpError::InvalidProtocolLength => NetError::InvalidArg,
            ArpError::InvalidHardwareType
            | ArpError::InvalidProtocolType
            | ArpError::UnknownOperation => NetError::NotSupported,
        }
    }
}

/// ARP packet structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    /// Operation (1 = request, 2 = reply)
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Create a new ARP request packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address
    /// * `target_ip` - The IP address we want to resolve
    pub fn new_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ARP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: [0; 6],
            target_ip,
        }
    }

    /// Create a new ARP reply packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address
    /// * `target_mac` - The MAC address of the requester
    /// * `target_ip` - The IP address of the requester
    pub fn new_reply(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_mac: MacAddr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ARP_REPLY,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Parse an Ethernet/IPv4 ARP packet from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ArpError> {
        if data.len() < ARP_PACKET_SIZE {
            return Err(ArpError::PacketTooShort);
        }

        if u16::from_be_bytes([data[0], data[1]]) != HW_TYPE_ETHERNET {
            return Err(ArpError::InvalidHardwareType);
        }
        if u16::from_be_bytes([data[2], data[3]]) != PROTO_TYPE_IPV4 {
            return Err(ArpError::InvalidProtocolType);
        }
        if data[4] != 6 {
            return Err(ArpError::InvalidHardwareLength);
        }
        if data[5] != 4 {
            return Err(ArpError::InvalidProtocolLength);
        }

        let operation = u16::from_be_bytes([data[6], data[7]]);
        if operation != ARP_REQUEST && operation != ARP_REPLY {
            return Err(ArpError::UnknownOperation);
        }

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        let sender_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);

        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&data[18..24]);
        let target_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        Ok(Self {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    /// Convert the ARP packet to bytes for transmission
    pub fn to_bytes(&self) -> [u8; ARP_PACKET_SIZE] {
        let mut bytes = [0u8; ARP_PACKET_SIZE];
        bytes[0..2].copy_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
        bytes[2..4].copy_from_slice(&PROTO_TYPE_IPV4.to_be_bytes());
        bytes[4] = 6;
        bytes[5] = 4;
        bytes[6..8].copy_from_slice(&self.operation.to_be_bytes());
        bytes[8..14].copy_from_slice(&self.sender_mac);
        bytes[14..18].copy_from_slice(&self.sender_ip.octets());
        bytes[18..24].copy_from_slice(&self.target_mac);
        bytes[24..28].copy_from_slice(&self.target_ip.octets());
        bytes
    }

    pub fn is_request(&self) -> bool {
        self.operation == ARP_REQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.operation == ARP_REPLY
    }
}

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
    /// When the mapping was last learned
    updated_at: u64,
    /// When the mapping was last learned or looked up
    last_used: u64,
}

/// Fixed-capacity IP → MAC cache.
///
/// At most one entry per IP. When full, the least recently used entry is
/// evicted. Entries older than the timeout are treated as absent and dropped
/// on lookup.
pub struct ArpCache {
    entries: Vec<ArpEntry>,
    capacity: usize,
    timeout_ms: u64,
}

impl ArpCache {
    pub fn new(capacity: usize, timeout_ms: u64) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            timeout_ms,
        }
    }

    /// Add or refresh the mapping for `ip`
    pub fn update(&mut self, ip: Ipv4Addr, mac: MacAddr, now: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.ip == ip) {
            entry.mac = mac;
            entry.updated_at = now;
            entry.last_used = now;
            return;
        }

        let entry = ArpEntry {
            ip,
            mac,
            updated_at: now,
            last_used: now,
        };

        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return;
        }

        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(index, _)| index);
        if let Some(index) = victim {
            log::debug!("[ARP] cache full, evicting {}", self.entries[index].ip);
            self.entries[index] = entry;
        }
    }

    /// Look up `ip`, refreshing its LRU position
    pub fn lookup(&mut self, ip: Ipv4Addr, now: u64) -> Option<MacAddr> {
        let index = self.entries.iter().position(|entry| entry.ip == ip)?;
        if self.is_expired(&self.entries[index], now) {
            self.entries.swap_remove(index);
            return None;
        }
        let entry = &mut self.entries[index];
        entry.last_used = now;
        Some(entry.mac)
    }

    fn is_expired(&self, entry: &ArpEntry, now: u64) -> bool {
        now.saturating_sub(entry.updated_at) >= self.timeout_ms
    }

    pub fn remove(&mut self, ip: Ipv4Addr) -> bool {
        match self.entries.iter().position(|entry| entry.ip == ip) {
            Some(index) => {
                self.entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry
    ///
    /// # Returns
    /// Number of entries removed
    pub fn remove_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        let timeout = self.timeout_ms;
        self.entries
            .retain(|entry| now.saturating_sub(entry.updated_at) < timeout);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `(ip, mac, learned_at)` for every entry (for display)
    pub fn entries(&self) -> Vec<(Ipv4Addr, MacAddr, u64)> {
        self.entries
            .iter()
            .map(|entry| (entry.ip, entry.mac, entry.updated_at))
            .collect()
    }
}

/// ARP state owned by the stack
pub struct ArpResolver {
    pub(crate) cache: Mutex<ArpCache>,
}

impl ArpResolver {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            cache: Mutex::new(ArpCache::new(config.arp_cache_capacity, config.arp_cache_timeout_ms)),
        }
    }
}

impl NetworkStack {
    /// Record `ip` → `mac`
    pub fn arp_update_cache(&self, ip: Ipv4Addr, mac: MacAddr) {
        let now = self.now_ms();
        self.arp.cache.lock().update(ip, mac, now);
    }

    /// Cached MAC for `ip`, without sending anything
    pub fn arp_lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let now = self.now_ms();
        self.arp.cache.lock().lookup(ip, now)
    }

    /// Resolve `ip` from the cache.
    ///
    /// On a miss one broadcast request goes out and `NotFound` is returned;
    /// call again once the reply has been received.
    pub fn arp_resolve(&self, ip: Ipv4Addr) -> NetResult<MacAddr> {
        if let Some(mac) = self.arp_lookup(ip) {
            return Ok(mac);
        }

        self.arp_request(ip)?;
        Err(NetError::NotFound)
    }

    /// Broadcast a request for `target_ip` on the primary device
    pub fn arp_request(&self, target_ip: Ipv4Addr) -> NetResult<()> {
        let device = self.primary_device()?;
        let request = ArpPacket::new_request(device.mac(), device.ip(), target_ip);
        log::debug!("[ARP] who-has {} tell {}", target_ip, device.ip());
        self.ethernet_send(&device, BROADCAST_MAC, ETHERTYPE_ARP, &request.to_bytes())
    }

    /// Process an inbound ARP packet received on `device`.
    ///
    /// Requests for the device's own address are answered. Replies update
    /// the cache unconditionally.
    pub fn arp_handle_packet(&self, device: &NetDevice, data: &[u8]) -> NetResult<()> {
        if !device.is_up() {
            return Err(NetError::DeviceNotFound);
        }

        let packet = ArpPacket::from_bytes(data)?;
        let our_ip = device.ip();

        if packet.is_request() {
            if our_ip.is_unspecified() || packet.target_ip != our_ip {
                return Ok(());
            }
            let reply = ArpPacket::new_reply(device.mac(), our_ip, packet.sender_mac, packet.sender_ip);
            log::debug!("[ARP] {} is-at us, replying to {}", our_ip, packet.sender_ip);
            self.ethernet_send(device, packet.sender_mac, ETHERTYPE_ARP, &reply.to_bytes())
        } else {
            log::debug!("[ARP] learned {} from reply", packet.sender_ip);
            self.arp_update_cache(packet.sender_ip, packet.sender_mac);
            Ok(())
        }
    }

    /// Resolve `ip`, waiting for the reply.
    ///
    /// Requests are repeated every `arp_request_interval_ms` until
    /// `arp_resolve_timeout_ms` passes. Inbound frames are pumped while
    /// waiting.
    pub async fn arp_resolve_wait(&self, ip: Ipv4Addr) -> NetResult<MacAddr> {
        if let Some(mac) = self.arp_lookup(ip) {
            return Ok(mac);
        }

        let clock = self.clock();
        let deadline = Deadline::after(clock, self.config.arp_resolve_timeout_ms);
        let mut last_request: Option<u64> = None;

        while !deadline.is_expired(clock) {
            let now = clock.uptime_ms();
            let due = last_request
                .map(|sent| now.saturating_sub(sent) >= self.config.arp_request_interval_ms)
                .unwrap_or(true);
            if due {
                self.arp_request(ip)?;
                last_request = Some(now);
            }

            self.poll();
            if let Some(mac) = self.arp_lookup(ip) {
                return Ok(mac);
            }
            yield_now().await;
        }

        log::debug!("[ARP] no reply for {}", ip);
        Err(NetError::Timeout)
    }

    /// Wait until the next hop towards `dest` is resolved.
    ///
    /// Broadcast destinations need no resolution.
    pub async fn arp_prepare_route(&self, dest: Ipv4Addr) -> NetResult<()> {
        if dest.is_broadcast() {
            return Ok(());
        }
        let device = self.primary_device()?;
        let hop = device.addr().next_hop(dest).ok_or(NetError::NotFound)?;
        self.arp_resolve_wait(hop).await.map(|_| ())
    }

    /// Drop cache entries older than `arp_cache_timeout_ms`
    pub fn arp_remove_expired(&self) -> usize {
        let now = self.now_ms();
        self.arp.cache.lock().remove_expired(now)
    }

    /// Snapshot of the cache for display
    pub fn arp_entries(&self) -> Vec<(Ipv4Addr, MacAddr, u64)> {
        self.arp.cache.lock().entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn mac(last: u8) -> MacAddr {
        [0x02, 0, 0, 0, 0, last]
    }

    #[test]
    fn test_packet_round_trip() {
        let request = ArpPacket::new_request(mac(1), ip(5), ip(9));
        let bytes = request.to_bytes();
        assert_eq!(&bytes[0..8], &[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);

        let parsed = ArpPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, request);
        assert!(parsed.is_request());
        assert_eq!(parsed.target_mac, [0; 6]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ArpPacket::from_bytes(&[0; 27]), Err(ArpError::PacketTooShort));

        let mut bytes = ArpPacket::new_reply(mac(1), ip(5), mac(2), ip(9)).to_bytes();
        bytes[1] = 6;
        assert_eq!(ArpPacket::from_bytes(&bytes), Err(ArpError::InvalidHardwareType));
        assert_eq!(NetError::from(ArpError::InvalidHardwareType), NetError::NotSupported);

        let mut bytes = ArpPacket::new_reply(mac(1), ip(5), mac(2), ip(9)).to_bytes();
        bytes[7] = 3;
        assert_eq!(ArpPacket::from_bytes(&bytes), Err(ArpError::UnknownOperation));
    }

    #[test]
    fn test_cache_update_refreshes_existing() {
        let mut cache = ArpCache::new(4, 30_000);
        cache.update(ip(9), mac(1), 0);
        cache.update(ip(9), mac(2), 10);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(ip(9), 20), Some(mac(2)));
    }

    #[test]
    fn test_cache_expiry() {
        let mut cache = ArpCache::new(4, 30_000);
        cache.update(ip(9), mac(1), 1_000);
        assert_eq!(cache.lookup(ip(9), 30_999), Some(mac(1)));
        // Lookups do not extend the lifetime
        assert_eq!(cache.lookup(ip(9), 31_000), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let mut cache = ArpCache::new(3, 30_000);
        cache.update(ip(1), mac(1), 0);
        cache.update(ip(2), mac(2), 1);
        cache.update(ip(3), mac(3), 2);

        // Touch the oldest so the second becomes the victim
        assert!(cache.lookup(ip(1), 3).is_some());
        cache.update(ip(4), mac(4), 4);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.lookup(ip(2), 5), None);
        assert_eq!(cache.lookup(ip(1), 5), Some(mac(1)));
        assert_eq!(cache.lookup(ip(4), 5), Some(mac(4)));
    }

    #[test]
    fn test_remove_expired() {
        let mut cache = ArpCache::new(4, 100);
        cache.update(ip(1), mac(1), 0);
        cache.update(ip(2), mac(2), 50);
        assert_eq!(cache.remove_expired(120), 1);
        assert_eq!(cache.entries(), vec![(ip(2), mac(2), 50)]);
        assert!(cache.remove(ip(2)));
        assert!(!cache.remove(ip(2)));
    }
}
