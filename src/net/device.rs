//! Network device registry
//!
//! A device couples a name, a MAC address and IPv4 addressing with the
//! driver that moves raw frames. Drivers implement [`NetworkDriver`]; the
//! stack never touches hardware directly.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::net::error::{NetError, NetResult};

/// 48-bit Ethernet hardware address
pub type MacAddr = [u8; 6];

/// Longest accepted device name
pub const MAX_DEVICE_NAME_LEN: usize = 15;

/// Largest frame a driver hands to `receive` (header + MTU + FCS)
pub const MAX_FRAME_SIZE: usize = 1518;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Ethernet,
    Wifi,
    Loopback,
}

/// Frame transport implemented by each NIC driver
pub trait NetworkDriver: Send {
    /// Transmit one complete Ethernet frame (header included, no FCS)
    fn transmit(&mut self, frame: &[u8]) -> NetResult<()>;

    /// Copy the next pending frame into `buffer`.
    ///
    /// # Returns
    /// * `Ok(len)` - A frame of `len` bytes was received
    /// * `Err(NetError::Timeout)` - The receive ring is empty
    fn receive(&mut self, buffer: &mut [u8]) -> NetResult<usize>;
}

/// IPv4 addressing of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl InterfaceAddr {
    pub const UNCONFIGURED: Self = Self {
        ip: Ipv4Addr::UNSPECIFIED,
        netmask: Ipv4Addr::UNSPECIFIED,
        gateway: Ipv4Addr::UNSPECIFIED,
    };

    pub fn new(ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self { ip, netmask, gateway }
    }

    /// An address has been assigned
    pub fn is_configured(&self) -> bool {
        !self.ip.is_unspecified()
    }

    /// `ip & netmask` equality with our own address
    pub fn is_local(&self, dest: Ipv4Addr) -> bool {
        let mask = self.netmask.to_bits();
        (self.ip.to_bits() & mask) == (dest.to_bits() & mask)
    }

    /// Directly reachable destinations are their own next hop; everything
    /// else goes through the gateway. `None` when off-link without a gateway.
    pub fn next_hop(&self, dest: Ipv4Addr) -> Option<Ipv4Addr> {
        if dest.is_broadcast() || self.is_local(dest) {
            Some(dest)
        } else if !self.gateway.is_unspecified() {
            Some(self.gateway)
        } else {
            None
        }
    }
}

impl fmt::Display for InterfaceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} gateway {}", self.ip, self.netmask, self.gateway)
    }
}

/// A registered network interface
pub struct NetDevice {
    name: String,
    kind: DeviceType,
    mac: MacAddr,
    addr: Mutex<InterfaceAddr>,
    up: AtomicBool,
    driver: Mutex<Box<dyn NetworkDriver>>,
}

impl NetDevice {
    /// Create a device in the down state with no address
    ///
    /// # Arguments
    /// * `name` - Interface name, at most 15 bytes (e.g. "eth0")
    /// * `kind` - Link type
    /// * `mac` - Hardware address
    /// * `driver` - Frame transport
    pub fn new(
        name: &str,
        kind: DeviceType,
        mac: MacAddr,
        driver: Box<dyn NetworkDriver>,
    ) -> NetResult<Self> {
        if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
            return Err(NetError::InvalidArg);
        }

        Ok(Self {
            name: String::from(name),
            kind,
            mac,
            addr: Mutex::new(InterfaceAddr::UNCONFIGURED),
            up: AtomicBool::new(false),
            driver: Mutex::new(driver),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceType {
        self.kind
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn addr(&self) -> InterfaceAddr {
        *self.addr.lock()
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.addr.lock().ip
    }

    pub fn set_ip(&self, ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) {
        *self.addr.lock() = InterfaceAddr::new(ip, netmask, gateway);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    /// Hand a frame to the driver
    pub fn send_packet(&self, frame: &[u8]) -> NetResult<()> {
        if frame.is_empty() {
            return Err(NetError::InvalidArg);
        }
        self.driver.lock().transmit(frame)
    }

    /// Pull the next frame from the driver into `buffer`
    pub fn receive_packet(&self, buffer: &mut [u8]) -> NetResult<usize> {
        if buffer.is_empty() {
            return Err(NetError::InvalidArg);
        }
        self.driver.lock().receive(buffer)
    }
}

impl fmt::Debug for NetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetDevice")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mac", &format_mac(&self.mac))
            .field("addr", &self.addr())
            .field("up", &self.is_up())
            .finish()
    }
}

/// Devices known to the stack, most recently registered first
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<NetDevice>>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Take ownership of a device; names must be unique
    pub fn register(&self, device: NetDevice) -> NetResult<Arc<NetDevice>> {
        let mut devices = self.devices.lock();
        if devices.iter().any(|existing| existing.name == device.name) {
            return Err(NetError::AlreadyExists);
        }
        devices.try_reserve(1)?;

        let device = Arc::new(device);
        devices.insert(0, Arc::clone(&device));
        Ok(device)
    }

    pub fn find(&self, name: &str) -> Option<Arc<NetDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|device| device.name == name)
            .cloned()
    }

    pub fn set_ip(&self, name: &str, ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> NetResult<()> {
        let device = self.find(name).ok_or(NetError::DeviceNotFound)?;
        device.set_ip(ip, netmask, gateway);
        Ok(())
    }

    pub fn devices(&self) -> Vec<Arc<NetDevice>> {
        self.devices.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a MAC address for display
pub fn format_mac(mac: &MacAddr) -> String {
    use alloc::format;
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
