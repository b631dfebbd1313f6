//! DHCP client (RFC 2131)
//!
//! DISCOVER → OFFER → REQUEST → ACK/NAK, each step retried up to
//! `dhcp_attempts` times with a per-attempt deadline. Messages leave the
//! named device directly as limited broadcasts from 0.0.0.0.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::net::device::{MacAddr, NetDevice};
use crate::net::error::{NetError, NetResult, alloc_buffer};
use crate::net::ethernet::{BROADCAST_MAC, ETHERTYPE_IPV4};
use crate::net::ipv4::{self, protocol};
use crate::net::stack::NetworkStack;
use crate::net::udp::{UdpPacket, UdpSocket};
use crate::net::wait::Deadline;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const FLAGS_BROADCAST: u16 = 0x8000;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Fixed BOOTP fields before the options area
pub const BOOTP_FIXED_LEN: usize = 236;
/// Options area, magic cookie included
pub const OPTIONS_LEN: usize = 312;
/// Full message as sent
pub const DHCP_MESSAGE_LEN: usize = BOOTP_FIXED_LEN + OPTIONS_LEN;

const COOKIE_OFFSET: usize = BOOTP_FIXED_LEN;
const OPTIONS_OFFSET: usize = BOOTP_FIXED_LEN + MAGIC_COOKIE.len();

/// Option codes
pub mod option {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVER: u8 = 6;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST: u8 = 55;
    pub const END: u8 = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl DhcpMessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

/// Configuration negotiated by one successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpConfig {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_server: Ipv4Addr,
    /// Server that granted the lease
    pub server_id: Ipv4Addr,
    /// Seconds
    pub lease_time: u32,
    pub configured: bool,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            dns_server: Ipv4Addr::UNSPECIFIED,
            server_id: Ipv4Addr::UNSPECIFIED,
            lease_time: 0,
            configured: false,
        }
    }
}

/// Options this client understands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub message_type: Option<DhcpMessageType>,
    pub server_id: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns_server: Option<Ipv4Addr>,
    pub lease_time: Option<u32>,
}

fn ipv4_option(data: &[u8]) -> Option<Ipv4Addr> {
    match data {
        [a, b, c, d, ..] => Some(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => None,
    }
}

/// Walk code/length/value triples until END or the end of the area.
///
/// PAD bytes are skipped; a truncated option ends the walk. For list
/// options (router, DNS) the first address is kept.
pub fn parse_options(options: &[u8]) -> DhcpOptions {
    let mut parsed = DhcpOptions::default();
    let mut i = 0;

    while i < options.len() {
        let code = options[i];
        if code == option::END {
            break;
        }
        if code == option::PAD {
            i += 1;
            continue;
        }

        let Some(&len) = options.get(i + 1) else {
            break;
        };
        let Some(data) = options.get(i + 2..i + 2 + len as usize) else {
            break;
        };

        match code {
            option::MESSAGE_TYPE => parsed.message_type = data.first().and_then(|&t| DhcpMessageType::from_u8(t)),
            option::SERVER_ID => parsed.server_id = ipv4_option(data),
            option::SUBNET_MASK => parsed.subnet_mask = ipv4_option(data),
            option::ROUTER => parsed.router = ipv4_option(data),
            option::DNS_SERVER => parsed.dns_server = ipv4_option(data),
            option::LEASE_TIME => {
                if let [a, b, c, d, ..] = data {
                    parsed.lease_time = Some(u32::from_be_bytes([*a, *b, *c, *d]));
                }
            }
            _ => {}
        }

        i += 2 + len as usize;
    }

    parsed
}

/// A BOOTREPLY carrying the magic cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpReply {
    pub xid: u32,
    pub yiaddr: Ipv4Addr,
    pub options: DhcpOptions,
}

impl DhcpReply {
    /// Parse a server message; anything that is not a BOOTREPLY with the
    /// magic cookie yields `None`
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < OPTIONS_OFFSET || payload[0] != BOOTREPLY {
            return None;
        }
        if payload[COOKIE_OFFSET..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return None;
        }

        Some(Self {
            xid: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            yiaddr: Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]),
            options: parse_options(&payload[OPTIONS_OFFSET..]),
        })
    }

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.options.message_type
    }

    /// Configuration granted by an ACK; omitted options stay unspecified
    pub fn to_config(&self) -> DhcpConfig {
        let defaults = DhcpConfig::default();
        DhcpConfig {
            ip: self.yiaddr,
            netmask: self.options.subnet_mask.unwrap_or(defaults.netmask),
            gateway: self.options.router.unwrap_or(defaults.gateway),
            dns_server: self.options.dns_server.unwrap_or(defaults.dns_server),
            server_id: self.options.server_id.unwrap_or(defaults.server_id),
            lease_time: self.options.lease_time.unwrap_or(defaults.lease_time),
            configured: true,
        }
    }
}

/// Build a BOOTREQUEST of `message_type` with `extra` options after the
/// message-type option
fn build_message(
    mac: MacAddr,
    xid: u32,
    ciaddr: Ipv4Addr,
    message_type: DhcpMessageType,
    extra: &[(u8, &[u8])],
) -> NetResult<Vec<u8>> {
    let mut message = alloc_buffer(DHCP_MESSAGE_LEN)?;
    message.resize(DHCP_MESSAGE_LEN, 0);

    message[0] = BOOTREQUEST;
    message[1] = HTYPE_ETHERNET;
    message[2] = mac.len() as u8;
    message[4..8].copy_from_slice(&xid.to_be_bytes());
    if ciaddr.is_unspecified() {
        message[10..12].copy_from_slice(&FLAGS_BROADCAST.to_be_bytes());
    }
    message[12..16].copy_from_slice(&ciaddr.octets());
    message[28..34].copy_from_slice(&mac);
    message[COOKIE_OFFSET..OPTIONS_OFFSET].copy_from_slice(&MAGIC_COOKIE);

    let mut i = OPTIONS_OFFSET;
    let mut put = |code: u8, data: &[u8]| -> NetResult<()> {
        if i + 2 + data.len() >= DHCP_MESSAGE_LEN {
            return Err(NetError::InvalidArg);
        }
        message[i] = code;
        message[i + 1] = data.len() as u8;
        message[i + 2..i + 2 + data.len()].copy_from_slice(data);
        i += 2 + data.len();
        Ok(())
    };

    put(option::MESSAGE_TYPE, &[message_type.as_u8()])?;
    for (code, data) in extra {
        put(*code, data)?;
    }
    if matches!(message_type, DhcpMessageType::Discover | DhcpMessageType::Request) {
        put(
            option::PARAMETER_REQUEST,
            &[option::SUBNET_MASK, option::ROUTER, option::DNS_SERVER, option::LEASE_TIME],
        )?;
    }
    message[i] = option::END;

    Ok(message)
}

pub fn build_discover(mac: MacAddr, xid: u32) -> NetResult<Vec<u8>> {
    build_message(mac, xid, Ipv4Addr::UNSPECIFIED, DhcpMessageType::Discover, &[])
}

/// REQUEST echoing the offered address and the offering server
pub fn build_request(mac: MacAddr, xid: u32, requested: Ipv4Addr, server_id: Ipv4Addr) -> NetResult<Vec<u8>> {
    build_message(
        mac,
        xid,
        Ipv4Addr::UNSPECIFIED,
        DhcpMessageType::Request,
        &[
            (option::REQUESTED_IP, &requested.octets()[..]),
            (option::SERVER_ID, &server_id.octets()[..]),
        ],
    )
}

pub fn build_release(mac: MacAddr, xid: u32, ip: Ipv4Addr, server_id: Ipv4Addr) -> NetResult<Vec<u8>> {
    build_message(
        mac,
        xid,
        ip,
        DhcpMessageType::Release,
        &[(option::SERVER_ID, &server_id.octets()[..])],
    )
}

struct Lease {
    device: String,
    config: DhcpConfig,
}

/// DHCP client state owned by the stack
pub struct DhcpClient {
    next_xid: AtomicU32,
    lease: Mutex<Option<Lease>>,
}

impl DhcpClient {
    pub const fn new() -> Self {
        Self {
            next_xid: AtomicU32::new(1),
            lease: Mutex::new(None),
        }
    }

    fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStack {
    fn dhcp_device(&self, name: &str) -> NetResult<Arc<NetDevice>> {
        self.find_device(name)
            .filter(|device| device.is_up())
            .ok_or(NetError::DeviceNotFound)
    }

    /// Broadcast a client message out of `device` from `src_ip`
    fn dhcp_broadcast(&self, device: &NetDevice, src_ip: Ipv4Addr, message: &[u8]) -> NetResult<()> {
        let mut payload = alloc_buffer(message.len())?;
        payload.extend_from_slice(message);
        let udp = UdpPacket::new(DHCP_CLIENT_PORT, DHCP_SERVER_PORT, payload).to_bytes()?;
        let packet = ipv4::build_packet(
            src_ip,
            Ipv4Addr::BROADCAST,
            protocol::UDP,
            self.ip.next_identification(),
            &udp,
        )?;
        self.ethernet_send(device, BROADCAST_MAC, ETHERTYPE_IPV4, &packet)
    }

    /// Send `message` and wait for a reply to `xid` that `accept` takes,
    /// resending on every attempt
    async fn dhcp_exchange(
        &self,
        device: &NetDevice,
        socket: &UdpSocket<'_>,
        message: &[u8],
        xid: u32,
        accept: impl Fn(&DhcpReply) -> bool,
    ) -> NetResult<DhcpReply> {
        for attempt in 1..=self.config.dhcp_attempts {
            self.dhcp_broadcast(device, Ipv4Addr::UNSPECIFIED, message)?;
            let deadline = Deadline::after(self.clock(), self.config.dhcp_attempt_timeout_ms);

            loop {
                let datagram = match socket.recv_until(&deadline).await {
                    Ok(datagram) => datagram,
                    Err(NetError::Timeout) => break,
                    Err(e) => return Err(e),
                };
                if datagram.src_port != DHCP_SERVER_PORT {
                    continue;
                }
                match DhcpReply::parse(&datagram.data) {
                    Some(reply) if reply.xid == xid && accept(&reply) => return Ok(reply),
                    _ => log::trace!("[DHCP] ignoring message from {}", datagram.src_ip),
                }
            }

            log::debug!("[DHCP] attempt {}/{} timed out", attempt, self.config.dhcp_attempts);
        }
        Err(NetError::Timeout)
    }

    /// Run the DORA handshake on `device_name` and return the lease.
    ///
    /// The device's address is left untouched; see
    /// [`NetworkStack::dhcp_configure`].
    ///
    /// # Returns
    /// * `Err(NetError::DeviceNotFound)` - No such device, or it is down
    /// * `Err(NetError::Timeout)` - No OFFER or ACK after every attempt
    /// * `Err(NetError::Failed)` - Server answered NAK
    pub async fn dhcp_request_config(&self, device_name: &str) -> NetResult<DhcpConfig> {
        let device = self.dhcp_device(device_name)?;
        let socket = self.udp_bind(DHCP_CLIENT_PORT)?;
        let xid = self.dhcp.next_xid();

        log::info!("[DHCP] {}: DISCOVER (xid {:#010x})", device.name(), xid);
        let discover = build_discover(device.mac(), xid)?;
        let offer = self
            .dhcp_exchange(&device, &socket, &discover, xid, |reply| {
                reply.message_type() == Some(DhcpMessageType::Offer) && reply.options.server_id.is_some()
            })
            .await?;

        let server_id = offer.options.server_id.ok_or(NetError::Failed)?;
        log::info!("[DHCP] {}: OFFER {} from {}", device.name(), offer.yiaddr, server_id);

        let request = build_request(device.mac(), xid, offer.yiaddr, server_id)?;
        let ack = self
            .dhcp_exchange(&device, &socket, &request, xid, |reply| {
                matches!(reply.message_type(), Some(DhcpMessageType::Ack | DhcpMessageType::Nak))
            })
            .await?;

        if ack.message_type() == Some(DhcpMessageType::Nak) {
            log::warn!("[DHCP] {}: NAK from {}", device.name(), server_id);
            return Err(NetError::Failed);
        }

        let mut config = ack.to_config();
        if config.server_id.is_unspecified() {
            config.server_id = server_id;
        }
        log::info!(
            "[DHCP] {}: leased {} mask {} gw {} dns {} for {}s",
            device.name(),
            config.ip,
            config.netmask,
            config.gateway,
            config.dns_server,
            config.lease_time
        );

        *self.dhcp.lease.lock() = Some(Lease {
            device: String::from(device.name()),
            config,
        });
        Ok(config)
    }

    /// Lease an address for `device_name` and apply it: interface address,
    /// and the DNS nameserver when the server offered one
    pub async fn dhcp_configure(&self, device_name: &str) -> NetResult<DhcpConfig> {
        let config = self.dhcp_request_config(device_name).await?;
        self.set_ip(device_name, config.ip, config.netmask, config.gateway)?;
        if !config.dns_server.is_unspecified() {
            self.dns_set_nameserver(config.dns_server);
        }
        Ok(config)
    }

    /// Give the lease held by `device_name` back and unconfigure it.
    ///
    /// # Returns
    /// * `Err(NetError::InvalidState)` - No lease held for the device
    pub fn dhcp_release(&self, device_name: &str) -> NetResult<()> {
        let device = self.dhcp_device(device_name)?;
        let lease = {
            let mut lease = self.dhcp.lease.lock();
            match lease.take() {
                Some(held) if held.device == device_name => held.config,
                other => {
                    *lease = other;
                    return Err(NetError::InvalidState);
                }
            }
        };

        let release = build_release(device.mac(), self.dhcp.next_xid(), lease.ip, lease.server_id)?;
        self.dhcp_broadcast(&device, lease.ip, &release)?;
        device.set_ip(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
        log::info!("[DHCP] {}: released {}", device_name, lease.ip);
        Ok(())
    }

    /// Lease currently held, if any
    pub fn dhcp_lease(&self) -> Option<DhcpConfig> {
        self.dhcp.lease.lock().as_ref().map(|lease| lease.config)
    }
}
