//! Stack configuration
//!
//! Table sizes, timeouts and defaults for every layer. Per-interface
//! addressing lives on the device itself (see [`InterfaceAddr`]).
//!
//! [`InterfaceAddr`]: crate::net::device::InterfaceAddr

use alloc::string::String;
use core::net::Ipv4Addr;

/// Default outbound interface
pub const DEFAULT_PRIMARY_DEVICE: &str = "eth0";

/// Default DNS server (Google Public DNS)
pub const DEFAULT_NAMESERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Interface every outbound datagram leaves through
    pub primary_device: String,
    /// ARP cache slots
    pub arp_cache_capacity: usize,
    /// ARP entries older than this are treated as missing
    pub arp_cache_timeout_ms: u64,
    /// Upper bound for `arp_resolve_wait`
    pub arp_resolve_timeout_ms: u64,
    /// Minimum spacing between repeated requests in `arp_resolve_wait`
    pub arp_request_interval_ms: u64,
    /// TCP connection slots (listeners included)
    pub tcp_max_connections: usize,
    /// Per-connection receive buffer
    pub tcp_receive_buffer_size: usize,
    /// How long closing connections linger before `tcp_tick` frees them
    pub tcp_time_wait_ms: u64,
    /// Datagrams queued per bound UDP socket
    pub udp_queue_len: usize,
    pub dns_nameserver: Ipv4Addr,
    pub dns_timeout_ms: u64,
    /// DISCOVER and REQUEST attempts
    pub dhcp_attempts: u32,
    pub dhcp_attempt_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Echo replies kept for `ping_send` to pick up
    pub echo_mailbox_len: usize,
}

impl StackConfig {
    pub fn new() -> Self {
        Self {
            primary_device: String::from(DEFAULT_PRIMARY_DEVICE),
            arp_cache_capacity: 64,
            arp_cache_timeout_ms: 30_000,
            arp_resolve_timeout_ms: 1_000,
            arp_request_interval_ms: 200,
            tcp_max_connections: 32,
            tcp_receive_buffer_size: 4096,
            tcp_time_wait_ms: 2_000,
            udp_queue_len: 64,
            dns_nameserver: DEFAULT_NAMESERVER,
            dns_timeout_ms: 5_000,
            dhcp_attempts: 3,
            dhcp_attempt_timeout_ms: 2_000,
            ping_timeout_ms: 5_000,
            echo_mailbox_len: 32,
        }
    }

    pub fn with_primary_device(mut self, name: &str) -> Self {
        self.primary_device = String::from(name);
        self
    }

    pub fn with_nameserver(mut self, nameserver: Ipv4Addr) -> Self {
        self.dns_nameserver = nameserver;
        self
    }

    pub fn with_arp_cache(mut self, capacity: usize, timeout_ms: u64) -> Self {
        self.arp_cache_capacity = capacity;
        self.arp_cache_timeout_ms = timeout_ms;
        self
    }

    pub fn with_tcp_limits(mut self, max_connections: usize, receive_buffer_size: usize) -> Self {
        self.tcp_max_connections = max_connections;
        self.tcp_receive_buffer_size = receive_buffer_size;
        self
    }

    pub fn with_dhcp_retries(mut self, attempts: u32, attempt_timeout_ms: u64) -> Self {
        self.dhcp_attempts = attempts;
        self.dhcp_attempt_timeout_ms = attempt_timeout_ms;
        self
    }

    pub fn with_ping_timeout(mut self, timeout_ms: u64) -> Self {
        self.ping_timeout_ms = timeout_ms;
        self
    }

    pub fn with_dns_timeout(mut self, timeout_ms: u64) -> Self {
        self.dns_timeout_ms = timeout_ms;
        self
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::new()
    }
}
