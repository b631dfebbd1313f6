//Ethernet Frame Layer (OSI Layer 2)
//
//Frames and unframes payloads, filters inbound frames by destination MAC and
//hands ARP to the resolver. The NIC appends and strips the FCS itself.
//Frame structure: [Dest MAC (6)][Src MAC (6)][EtherType (2)][Payload (46-1500)]

use alloc::vec::Vec;
use core::fmt;

use crate::net::device::{MacAddr, NetDevice};
use crate::net::error::{NetError, NetResult, alloc_buffer};
use crate::net::stack::NetworkStack;

/// EtherType constants
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Broadcast MAC address (FF:FF:FF:FF:FF:FF)
pub const BROADCAST_MAC: MacAddr = [0xFF; 6];

/// Ethernet frame header size
pub const HEADER_SIZE: usize = 14;

/// Minimum frame size without FCS; shorter frames are zero padded
pub const MIN_FRAME_SIZE: usize = 60;

/// Maximum Ethernet payload size (MTU)
pub const MAX_PAYLOAD_SIZE: usize = 1500;

/// Errors that can occur during Ethernet frame operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthernetError {
    /// Frame is too short to hold a header
    FrameTooShort,
    /// Payload exceeds MTU
    PayloadTooLarge,
}

impl fmt::Display for EthernetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EthernetError::FrameTooShort => write!(f, "Ethernet frame too short"),
            EthernetError::PayloadTooLarge => write!(f, "Ethernet payload exceeds MTU"),
        }
    }
}

impl From<EthernetError> for NetError {
    fn from(_: EthernetError) -> Self {
        NetError::InvalidArg
    }
}

/// Parsed Ethernet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dest_mac: MacAddr,
    pub src_mac: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn new(dest_mac: MacAddr, src_mac: MacAddr, ethertype: u16) -> Self {
        Self {
            dest_mac,
            src_mac,
            ethertype,
        }
    }

    /// Parse the 14-byte header at the start of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self, EthernetError> {
        if data.len() < HEADER_SIZE {
            return Err(EthernetError::FrameTooShort);
        }

        let mut dest_mac = [0u8; 6];
        dest_mac.copy_from_slice(&data[0..6]);

        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&data[6..12]);

        let ethertype = u16::from_be_bytes([data[12], data[13]]);

        Ok(Self {
            dest_mac,
            src_mac,
            ethertype,
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.dest_mac);
        out.extend_from_slice(&self.src_mac);
        out.extend_from_slice(&self.ethertype.to_be_bytes());
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest_mac == BROADCAST_MAC
    }

    pub fn is_multicast(&self) -> bool {
        (self.dest_mac[0] & 0x01) != 0 && !self.is_broadcast()
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_broadcast() && !self.is_multicast()
    }

    /// Broadcast, or unicast to `mac`
    pub fn is_for(&self, mac: MacAddr) -> bool {
        self.is_broadcast() || self.dest_mac == mac
    }
}

/// Build a complete frame around `payload`, zero padded to [`MIN_FRAME_SIZE`].
///
/// # Returns
/// * `Err(NetError::InvalidArg)` - Empty payload or payload above the MTU
/// * `Err(NetError::OutOfMemory)` - Frame buffer could not be allocated
pub fn build_frame(dest: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> NetResult<Vec<u8>> {
    if payload.is_empty() {
        return Err(NetError::InvalidArg);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(EthernetError::PayloadTooLarge.into());
    }

    let total = (HEADER_SIZE + payload.len()).max(MIN_FRAME_SIZE);
    let mut frame = alloc_buffer(total)?;
    EthernetHeader::new(dest, src, ethertype).write_to(&mut frame);
    frame.extend_from_slice(payload);
    frame.resize(total, 0);
    Ok(frame)
}

impl NetworkStack {
    /// Frame `data` and transmit it on `device`
    ///
    /// # Arguments
    /// * `device` - Outgoing interface; its MAC is the frame source
    /// * `dest_mac` - Frame destination
    /// * `ethertype` - Payload protocol (`ETHERTYPE_IPV4`, `ETHERTYPE_ARP`)
    /// * `data` - Payload bytes
    pub fn ethernet_send(&self, device: &NetDevice, dest_mac: MacAddr, ethertype: u16, data: &[u8]) -> NetResult<()> {
        let frame = build_frame(dest_mac, device.mac(), ethertype, data)?;
        device.send_packet(&frame)
    }

    /// Receive one frame from `device` into `buffer`.
    ///
    /// Frames addressed elsewhere are dropped with `NotFound`. ARP frames are
    /// consumed here and also report `NotFound`. For IPv4 frames the header
    /// is stripped: the payload is moved to the start of `buffer` and its
    /// length returned.
    ///
    /// # Returns
    /// * `Ok(len)` - IPv4 payload of `len` bytes at `buffer[..len]`
    /// * `Err(NetError::Timeout)` - Nothing pending on the device
    /// * `Err(NetError::InvalidArg)` - Runt frame
    /// * `Err(NetError::NotFound)` - Not for us, or consumed internally
    /// * `Err(NetError::NotSupported)` - Any other EtherType
    pub fn ethernet_receive(&self, device: &NetDevice, buffer: &mut [u8]) -> NetResult<usize> {
        let len = device.receive_packet(buffer)?;
        let header = EthernetHeader::from_bytes(&buffer[..len])?;

        if !header.is_for(device.mac()) {
            log::trace!("[ETH] dropping frame for {:02X?}", header.dest_mac);
            return Err(NetError::NotFound);
        }

        match header.ethertype {
            ETHERTYPE_ARP => {
                if let Err(e) = self.arp_handle_packet(device, &buffer[HEADER_SIZE..len]) {
                    log::debug!("[ARP] dropped packet: {}", e);
                }
                Err(NetError::NotFound)
            }
            ETHERTYPE_IPV4 => {
                buffer.copy_within(HEADER_SIZE..len, 0);
                Ok(len - HEADER_SIZE)
            }
            other => {
                log::trace!("[ETH] unsupported ethertype {:#06x}", other);
                Err(NetError::NotSupported)
            }
        }
    }
}
