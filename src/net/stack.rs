//! Network stack root
//!
//! [`NetworkStack`] owns the state of every layer: device registry, ARP
//! cache, IP identification counter, ICMP echo mailbox, UDP sockets, TCP
//! connections, DNS and DHCP client state. Every protocol module adds its
//! operations as methods on it, so a stack is fully self-contained and two
//! stacks never share state.
//!
//! Kernels that need a static entry point can [`install`] one stack and
//! reach it through [`global`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::net::Ipv4Addr;

use crate::net::arp::ArpResolver;
use crate::net::config::StackConfig;
use crate::net::device::{DeviceRegistry, MAX_FRAME_SIZE, NetDevice};
use crate::net::dhcp::DhcpClient;
use crate::net::dns::DnsResolver;
use crate::net::error::{NetError, NetResult};
use crate::net::icmp::EchoMailbox;
use crate::net::ipv4::IpState;
use crate::net::ping::PingState;
use crate::net::tcp::TcpLayer;
use crate::net::udp::UdpLayer;
use crate::net::wait::{Clock, yield_now};

/// Frames taken from one device per `poll`
const POLL_BUDGET: usize = 64;

pub struct NetworkStack {
    pub(crate) config: StackConfig,
    clock: Box<dyn Clock>,
    pub(crate) devices: DeviceRegistry,
    pub(crate) arp: ArpResolver,
    pub(crate) ip: IpState,
    pub(crate) icmp: EchoMailbox,
    pub(crate) udp: UdpLayer,
    pub(crate) tcp: TcpLayer,
    pub(crate) dns: DnsResolver,
    pub(crate) dhcp: DhcpClient,
    pub(crate) ping: PingState,
}

impl NetworkStack {
    pub fn new(config: StackConfig, clock: impl Clock + 'static) -> Self {
        log::info!(
            "[NET] stack initialized (primary device {}, nameserver {})",
            config.primary_device,
            config.dns_nameserver
        );
        Self {
            arp: ArpResolver::new(&config),
            ip: IpState::new(),
            icmp: EchoMailbox::new(config.echo_mailbox_len),
            udp: UdpLayer::new(config.udp_queue_len),
            tcp: TcpLayer::new(&config),
            dns: DnsResolver::new(&config),
            dhcp: DhcpClient::new(),
            ping: PingState::new(),
            devices: DeviceRegistry::new(),
            clock: Box::new(clock),
            config,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Current uptime in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.clock.uptime_ms()
    }

    /// Add a device to the registry
    ///
    /// # Returns
    /// * `Err(NetError::AlreadyExists)` - A device with that name is registered
    pub fn register_device(&self, device: NetDevice) -> NetResult<Arc<NetDevice>> {
        let device = self.devices.register(device)?;
        log::info!(
            "[NET] registered {} ({:?}, {})",
            device.name(),
            device.kind(),
            crate::net::device::format_mac(&device.mac())
        );
        Ok(device)
    }

    pub fn find_device(&self, name: &str) -> Option<Arc<NetDevice>> {
        self.devices.find(name)
    }

    /// Configure the address of device `name`
    pub fn set_ip(&self, name: &str, ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> NetResult<()> {
        self.devices.set_ip(name, ip, netmask, gateway)?;
        log::info!("[NET] {}: ip {} netmask {} gateway {}", name, ip, netmask, gateway);
        Ok(())
    }

    pub fn devices(&self) -> Vec<Arc<NetDevice>> {
        self.devices.devices()
    }

    /// The device all outbound IP traffic uses
    ///
    /// # Returns
    /// * `Err(NetError::DeviceNotFound)` - Not registered, or down
    pub fn primary_device(&self) -> NetResult<Arc<NetDevice>> {
        self.devices
            .find(&self.config.primary_device)
            .filter(|device| device.is_up())
            .ok_or(NetError::DeviceNotFound)
    }

    /// Drain pending frames from every up device through the inbound path,
    /// then reap expired ARP entries and TCP connections.
    ///
    /// # Returns
    /// Number of frames taken off the devices
    pub fn poll(&self) -> usize {
        let mut buffer = [0u8; MAX_FRAME_SIZE];
        let mut frames = 0;

        for device in self.devices.devices() {
            if !device.is_up() {
                continue;
            }
            for _ in 0..POLL_BUDGET {
                match self.ip_receive(&device, &mut buffer) {
                    Ok(_) => frames += 1,
                    Err(NetError::Timeout) => break,
                    Err(e) => {
                        frames += 1;
                        log::trace!("[NET] {}: frame dropped: {}", device.name(), e);
                    }
                }
            }
        }

        self.arp_remove_expired();
        self.tcp_tick();
        frames
    }

    /// Inbound processing loop for a kernel executor
    pub async fn rx_task(&self) {
        log::info!("[NET] RX task started");
        loop {
            self.poll();
            yield_now().await;
        }
    }
}

static GLOBAL: OnceCell<NetworkStack> = OnceCell::uninit();

/// Install `stack` as the global stack
///
/// # Returns
/// * `Err(NetError::AlreadyExists)` - A stack was installed before
pub fn install(stack: NetworkStack) -> NetResult<&'static NetworkStack> {
    GLOBAL
        .try_init_once(|| stack)
        .map_err(|_| NetError::AlreadyExists)?;
    global()
}

/// The installed global stack
pub fn global() -> NetResult<&'static NetworkStack> {
    GLOBAL.try_get().map_err(|_| NetError::NotInitialized)
}
