//! TCP Protocol Implementation (RFC 793)
//!
//! Connection state machine over a fixed-size connection table.
//!
//! # Features
//! - Passive open: a SYN for a listening port is answered with SYN+ACK and
//!   the connection is queued for `accept` as ESTABLISHED straight away
//! - Active open (`tcp_connect`)
//! - In-order append-only receive buffer per connection
//! - Teardown in both directions; closing connections linger in
//!   FIN_WAIT_1/FIN_WAIT_2/TIME_WAIT until `tcp_tick` reaps them
//! - RST for segments that match no connection or listener
//!
//! # Limitations
//! - No retransmission, congestion control or reassembly
//! - One segment per `tcp_send`, capped at the MSS

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use spin::Mutex;

use crate::net::checksum;
use crate::net::config::StackConfig;
use crate::net::error::{NetError, NetResult, alloc_buffer};
use crate::net::ipv4::protocol;
use crate::net::stack::NetworkStack;

/// Minimum TCP header size (20 bytes, no options)
pub const TCP_HEADER_SIZE: usize = 20;

const CHECKSUM_OFFSET: usize = 16;

/// Largest payload sent in one segment (1500 - 20 IP - 20 TCP)
pub const MAX_SEGMENT_SIZE: usize = 1460;

/// TCP port range for ephemeral (dynamic) port allocation
pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// TCP Control Flags
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// TCP Connection State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    /// Waiting for connection request
    Listen,
    /// Sent SYN, waiting for SYN-ACK
    SynSent,
    /// Received SYN, SYN-ACK being sent
    SynReceived,
    Established,
    /// We closed first, waiting for the ACK of our FIN
    FinWait1,
    /// Our FIN was acknowledged, waiting for the peer's FIN
    FinWait2,
    /// Peer closed first
    CloseWait,
    /// Both FINs sent, waiting for the last ACK
    LastAck,
    /// Both sides closed, lingering before the slot is freed
    TimeWait,
}

impl TcpState {
    /// States `tcp_tick` frees once they have lingered long enough
    fn is_closing(&self) -> bool {
        matches!(
            self,
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::LastAck | TcpState::TimeWait
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while parsing TCP segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Packet is too short to contain a valid TCP header
    PacketTooShort,
    /// Invalid data offset (header length)
    InvalidDataOffset,
    ChecksumMismatch,
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpError::PacketTooShort => write!(f, "TCP segment too short"),
            TcpError::InvalidDataOffset => write!(f, "Invalid TCP data offset"),
            TcpError::ChecksumMismatch => write!(f, "TCP checksum mismatch"),
        }
    }
}

impl From<TcpError> for NetError {
    fn from(error: TcpError) -> Self {
        match error {
            TcpError::PacketTooShort | TcpError::InvalidDataOffset => NetError::InvalidArg,
            TcpError::ChecksumMismatch => NetError::Failed,
        }
    }
}

/// TCP segment (options are skipped on parse and never sent)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub urgent_pointer: u16,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub fn new(src_port: u16, dest_port: u16, seq: u32, ack: u32, flags: u8, window: u16) -> Self {
        Self {
            src_port,
            dest_port,
            seq,
            ack,
            flags,
            window,
            urgent_pointer: 0,
            payload: Vec::new(),
        }
    }

    /// Parse a segment and verify its pseudo-header checksum
    ///
    /// # Arguments
    /// * `data` - Raw segment bytes (TCP header + payload)
    /// * `src_addr` - Source IP address from the IP header
    /// * `dest_addr` - Destination IP address from the IP header
    pub fn parse(data: &[u8], src_addr: Ipv4Addr, dest_addr: Ipv4Addr) -> Result<Self, TcpError> {
        if data.len() < TCP_HEADER_SIZE {
            return Err(TcpError::PacketTooShort);
        }

        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(TcpError::InvalidDataOffset);
        }
        let header_len = (data_offset as usize) * 4;
        if data.len() < header_len {
            return Err(TcpError::PacketTooShort);
        }

        if !checksum::verify_with_pseudo_header(data, CHECKSUM_OFFSET, src_addr, dest_addr, protocol::TCP) {
            return Err(TcpError::ChecksumMismatch);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dest_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            payload: data[header_len..].to_vec(),
        })
    }

    /// Build the segment with its pseudo-header checksum
    pub fn build(&self, src_addr: Ipv4Addr, dest_addr: Ipv4Addr) -> NetResult<Vec<u8>> {
        let mut packet = alloc_buffer(TCP_HEADER_SIZE + self.payload.len())?;

        packet.extend_from_slice(&self.src_port.to_be_bytes());
        packet.extend_from_slice(&self.dest_port.to_be_bytes());
        packet.extend_from_slice(&self.seq.to_be_bytes());
        packet.extend_from_slice(&self.ack.to_be_bytes());
        packet.push(((TCP_HEADER_SIZE / 4) as u8) << 4);
        packet.push(self.flags);
        packet.extend_from_slice(&self.window.to_be_bytes());
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&self.urgent_pointer.to_be_bytes());
        packet.extend_from_slice(&self.payload);

        checksum::fill_with_pseudo_header(&mut packet, CHECKSUM_OFFSET, src_addr, dest_addr, protocol::TCP);
        Ok(packet)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        (self.flags & flag) != 0
    }

    /// Sequence space consumed: payload plus one each for SYN and FIN
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.has_flag(flags::SYN) {
            len += 1;
        }
        if self.has_flag(flags::FIN) {
            len += 1;
        }
        len
    }
}

/// Generation-checked reference to a connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcpHandle {
    slot: u32,
    generation: u32,
}

/// Transmission Control Block
#[derive(Debug, Clone)]
pub struct TcpConnection {
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    state: TcpState,
    /// Next sequence number to send
    seq: u32,
    /// Next sequence number expected from the peer
    ack: u32,
    recv_buffer: VecDeque<u8>,
    recv_capacity: usize,
    /// Connections waiting for `accept` (listeners only)
    pending: VecDeque<TcpHandle>,
    /// Uptime of the last state change
    state_since: u64,
}

/// A segment ready for the IP layer
struct Outgoing {
    dest: Ipv4Addr,
    bytes: Vec<u8>,
}

impl TcpConnection {
    fn new(
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        recv_capacity: usize,
        now: u64,
    ) -> Self {
        Self {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            state: TcpState::Closed,
            seq: 0,
            ack: 0,
            recv_buffer: VecDeque::new(),
            recv_capacity,
            pending: VecDeque::new(),
            state_since: now,
        }
    }

    fn listener(local_ip: Ipv4Addr, local_port: u16, now: u64) -> Self {
        let mut conn = Self::new(local_ip, local_port, Ipv4Addr::UNSPECIFIED, 0, 0, now);
        conn.state = TcpState::Listen;
        conn
    }

    fn set_state(&mut self, state: TcpState, now: u64) {
        log::trace!(
            "[TCP] {}:{} <-> {}:{} {} -> {}",
            self.local_ip,
            self.local_port,
            self.remote_ip,
            self.remote_port,
            self.state,
            state
        );
        self.state = state;
        self.state_since = now;
    }

    fn window(&self) -> u16 {
        let free = self.recv_capacity.saturating_sub(self.recv_buffer.len());
        free.min(u16::MAX as usize) as u16
    }

    /// Build the next outgoing segment and advance `seq` past it
    fn emit(&mut self, flags: u8, payload: &[u8]) -> NetResult<Outgoing> {
        let mut segment = TcpSegment::new(self.local_port, self.remote_port, self.seq, self.ack, flags, self.window());
        segment.payload.try_reserve_exact(payload.len())?;
        segment.payload.extend_from_slice(payload);

        let bytes = segment.build(self.local_ip, self.remote_ip)?;
        self.seq = self.seq.wrapping_add(segment.seq_len());
        Ok(Outgoing {
            dest: self.remote_ip,
            bytes,
        })
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn local(&self) -> (Ipv4Addr, u16) {
        (self.local_ip, self.local_port)
    }

    pub fn remote(&self) -> (Ipv4Addr, u16) {
        (self.remote_ip, self.remote_port)
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    /// Bytes waiting in the receive buffer
    pub fn available(&self) -> usize {
        self.recv_buffer.len()
    }

    pub fn pending_accepts(&self) -> usize {
        self.pending.len()
    }
}

/// RST answering a segment that matched nothing
fn reset_for(segment: &TcpSegment, local_ip: Ipv4Addr, remote_ip: Ipv4Addr) -> NetResult<Outgoing> {
    let reply = if segment.has_flag(flags::ACK) {
        TcpSegment::new(segment.dest_port, segment.src_port, segment.ack, 0, flags::RST, 0)
    } else {
        TcpSegment::new(
            segment.dest_port,
            segment.src_port,
            0,
            segment.seq.wrapping_add(segment.seq_len()),
            flags::RST | flags::ACK,
            0,
        )
    };
    Ok(Outgoing {
        dest: remote_ip,
        bytes: reply.build(local_ip, remote_ip)?,
    })
}

struct Slot {
    generation: u32,
    conn: Option<TcpConnection>,
}

/// Fixed-capacity connection arena with a free list
pub struct TcpTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    next_isn: u32,
    next_ephemeral: u16,
}

impl TcpTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            next_isn: 1,
            next_ephemeral: EPHEMERAL_PORT_START,
        }
    }

    fn insert(&mut self, conn: TcpConnection) -> NetResult<TcpHandle> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.conn = Some(conn);
            return Ok(TcpHandle {
                slot: index,
                generation: slot.generation,
            });
        }

        if self.slots.len() >= self.capacity {
            return Err(NetError::OutOfMemory);
        }
        self.slots.try_reserve(1)?;
        self.slots.push(Slot {
            generation: 0,
            conn: Some(conn),
        });
        Ok(TcpHandle {
            slot: (self.slots.len() - 1) as u32,
            generation: 0,
        })
    }

    pub fn get(&self, handle: TcpHandle) -> Option<&TcpConnection> {
        self.slots
            .get(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.conn.as_ref())
    }

    fn get_mut(&mut self, handle: TcpHandle) -> Option<&mut TcpConnection> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.conn.as_mut())
    }

    /// Free a slot; stale handles to it stop resolving
    fn remove(&mut self, handle: TcpHandle) -> Option<TcpConnection> {
        let slot = self
            .slots
            .get_mut(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);

        for slot in self.slots.iter_mut() {
            if let Some(listener) = slot.conn.as_mut().filter(|c| c.state == TcpState::Listen) {
                listener.pending.retain(|pending| *pending != handle);
            }
        }
        Some(conn)
    }

    fn handles(&self) -> impl Iterator<Item = (TcpHandle, &TcpConnection)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.conn.as_ref().map(|conn| {
                (
                    TcpHandle {
                        slot: index as u32,
                        generation: slot.generation,
                    },
                    conn,
                )
            })
        })
    }

    /// Connection matching a segment's 4-tuple (listeners excluded)
    fn find(&self, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Option<TcpHandle> {
        self.handles()
            .find(|(_, conn)| {
                conn.state != TcpState::Listen
                    && conn.local_port == local_port
                    && conn.remote_ip == remote_ip
                    && conn.remote_port == remote_port
            })
            .map(|(handle, _)| handle)
    }

    fn find_listener(&self, local_port: u16) -> Option<TcpHandle> {
        self.handles()
            .find(|(_, conn)| conn.state == TcpState::Listen && conn.local_port == local_port)
            .map(|(handle, _)| handle)
    }

    fn next_isn(&mut self) -> u32 {
        let isn = self.next_isn;
        self.next_isn = self.next_isn.wrapping_add(1);
        isn
    }

    fn allocate_port(&mut self) -> NetResult<u16> {
        for _ in EPHEMERAL_PORT_START..=EPHEMERAL_PORT_END {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate == EPHEMERAL_PORT_END {
                EPHEMERAL_PORT_START
            } else {
                candidate + 1
            };
            if !self.handles().any(|(_, conn)| conn.local_port == candidate) {
                return Ok(candidate);
            }
        }
        Err(NetError::OutOfMemory)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// TCP state owned by the stack
pub struct TcpLayer {
    table: Mutex<TcpTable>,
    recv_capacity: usize,
    time_wait_ms: u64,
}

impl TcpLayer {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            table: Mutex::new(TcpTable::new(config.tcp_max_connections)),
            recv_capacity: config.tcp_receive_buffer_size,
            time_wait_ms: config.tcp_time_wait_ms,
        }
    }

    /// Run one inbound segment through the state machine.
    ///
    /// `local_ip` is the address replies leave from, which differs from
    /// `dest_ip` for broadcasts and while the device is unconfigured.
    #[allow(clippy::too_many_arguments)]
    fn process(
        &self,
        table: &mut TcpTable,
        segment: &TcpSegment,
        src_ip: Ipv4Addr,
        dest_ip: Ipv4Addr,
        local_ip: Ipv4Addr,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) -> NetResult<()> {
        let Some(handle) = table.find(segment.dest_port, src_ip, segment.src_port) else {
            return self.open_passive(table, segment, src_ip, dest_ip, local_ip, now, out);
        };

        if segment.has_flag(flags::RST) {
            log::debug!("[TCP] reset by {}:{}", src_ip, segment.src_port);
            table.remove(handle);
            return Ok(());
        }

        let conn = table.get_mut(handle).ok_or(NetError::NotFound)?;
        match conn.state {
            TcpState::SynSent => {
                let matches = segment.has_flag(flags::SYN) && segment.has_flag(flags::ACK) && segment.ack == conn.seq;
                if !matches {
                    return Err(NetError::InvalidState);
                }
                conn.ack = segment.seq.wrapping_add(1);
                conn.set_state(TcpState::Established, now);
                out.push(conn.emit(flags::ACK, &[])?);
                log::info!("[TCP] connected to {}:{}", conn.remote_ip, conn.remote_port);
                Ok(())
            }
            TcpState::LastAck => {
                if segment.has_flag(flags::ACK) {
                    log::debug!("[TCP] {}:{} closed", src_ip, segment.src_port);
                    table.remove(handle);
                }
                Ok(())
            }
            TcpState::FinWait1 | TcpState::FinWait2 => {
                // The peer may keep sending until it closes its half
                let len = segment.payload.len();
                if len > 0 && !Self::queue_payload(conn, segment)? {
                    return Ok(());
                }
                if segment.has_flag(flags::FIN) {
                    conn.ack = segment.seq.wrapping_add(segment.seq_len());
                    conn.set_state(TcpState::TimeWait, now);
                    out.push(conn.emit(flags::ACK, &[])?);
                } else {
                    if conn.state == TcpState::FinWait1 && segment.has_flag(flags::ACK) && segment.ack == conn.seq {
                        conn.set_state(TcpState::FinWait2, now);
                    }
                    if len > 0 {
                        out.push(conn.emit(flags::ACK, &[])?);
                    }
                }
                Ok(())
            }
            TcpState::TimeWait => {
                if segment.has_flag(flags::FIN) {
                    out.push(conn.emit(flags::ACK, &[])?);
                }
                Ok(())
            }
            TcpState::SynReceived | TcpState::Established | TcpState::CloseWait => {
                Self::receive_data(conn, segment, now, out)
            }
            TcpState::Listen | TcpState::Closed => Err(NetError::InvalidState),
        }
    }

    /// Append the payload to the receive buffer and advance `ack` past it.
    ///
    /// Returns `false` without touching `ack` when the buffer has no room.
    fn queue_payload(conn: &mut TcpConnection, segment: &TcpSegment) -> NetResult<bool> {
        let len = segment.payload.len();
        if conn.recv_buffer.len() + len > conn.recv_capacity {
            log::debug!(
                "[TCP] receive buffer full ({} + {} > {}), dropping segment",
                conn.recv_buffer.len(),
                len,
                conn.recv_capacity
            );
            return Ok(false);
        }
        conn.recv_buffer.try_reserve(len)?;
        conn.recv_buffer.extend(segment.payload.iter().copied());
        conn.ack = segment.seq.wrapping_add(len as u32);
        Ok(true)
    }

    /// Data and FIN handling for a synchronized connection
    fn receive_data(conn: &mut TcpConnection, segment: &TcpSegment, now: u64, out: &mut Vec<Outgoing>) -> NetResult<()> {
        let len = segment.payload.len();
        let fin = segment.has_flag(flags::FIN);

        if len > 0 {
            if !Self::queue_payload(conn, segment)? {
                return Ok(());
            }
            if !fin {
                out.push(conn.emit(flags::ACK, &[])?);
            }
        }

        if fin {
            conn.ack = segment.seq.wrapping_add(len as u32).wrapping_add(1);
            conn.set_state(TcpState::CloseWait, now);
            out.push(conn.emit(flags::ACK, &[])?);
            out.push(conn.emit(flags::FIN | flags::ACK, &[])?);
            conn.set_state(TcpState::LastAck, now);
        }

        Ok(())
    }

    /// SYN for a listening port: create the connection and answer SYN+ACK
    #[allow(clippy::too_many_arguments)]
    fn open_passive(
        &self,
        table: &mut TcpTable,
        segment: &TcpSegment,
        src_ip: Ipv4Addr,
        dest_ip: Ipv4Addr,
        local_ip: Ipv4Addr,
        now: u64,
        out: &mut Vec<Outgoing>,
    ) -> NetResult<()> {
        let is_syn = segment.has_flag(flags::SYN) && !segment.has_flag(flags::ACK);
        let listener = if is_syn && !dest_ip.is_broadcast() {
            table.find_listener(segment.dest_port)
        } else {
            None
        };

        let Some(listener) = listener else {
            if !segment.has_flag(flags::RST) {
                out.push(reset_for(segment, local_ip, src_ip)?);
            }
            return Err(NetError::NotFound);
        };

        let mut conn = TcpConnection::new(local_ip, segment.dest_port, src_ip, segment.src_port, self.recv_capacity, now);
        conn.seq = table.next_isn();
        conn.ack = segment.seq.wrapping_add(1);
        conn.set_state(TcpState::SynReceived, now);
        let syn_ack = conn.emit(flags::SYN | flags::ACK, &[])?;
        conn.set_state(TcpState::Established, now);

        let handle = table.insert(conn)?;
        if let Some(listener) = table.get_mut(listener) {
            listener.pending.push_back(handle);
        }
        out.push(syn_ack);

        log::info!("[TCP] accepted {}:{} on port {}", src_ip, segment.src_port, segment.dest_port);
        Ok(())
    }
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpStatus {
    pub state: TcpState,
    pub local: (Ipv4Addr, u16),
    pub remote: (Ipv4Addr, u16),
    pub seq: u32,
    pub ack: u32,
    pub available: usize,
    pub pending_accepts: usize,
}

impl From<&TcpConnection> for TcpStatus {
    fn from(conn: &TcpConnection) -> Self {
        Self {
            state: conn.state(),
            local: conn.local(),
            remote: conn.remote(),
            seq: conn.seq(),
            ack: conn.ack(),
            available: conn.available(),
            pending_accepts: conn.pending_accepts(),
        }
    }
}

impl NetworkStack {
    fn tcp_transmit(&self, out: Vec<Outgoing>) -> NetResult<()> {
        let mut result = Ok(());
        for segment in out {
            if let Err(e) = self.ip_send(segment.dest, protocol::TCP, &segment.bytes) {
                log::debug!("[TCP] send to {} failed: {}", segment.dest, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Open a listener on `port`
    ///
    /// # Returns
    /// * `Err(NetError::AlreadyExists)` - Port already has a listener
    /// * `Err(NetError::OutOfMemory)` - Connection table full
    pub fn tcp_listen(&self, port: u16) -> NetResult<TcpHandle> {
        if port == 0 {
            return Err(NetError::InvalidArg);
        }
        let local_ip = self.primary_device().map(|device| device.ip()).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let now = self.now_ms();

        let mut table = self.tcp.table.lock();
        if table.find_listener(port).is_some() {
            return Err(NetError::AlreadyExists);
        }
        let handle = table.insert(TcpConnection::listener(local_ip, port, now))?;
        log::info!("[TCP] listening on port {}", port);
        Ok(handle)
    }

    /// Pop the next established connection queued on the listener for
    /// `port`; never blocks.
    pub fn tcp_accept(&self, port: u16) -> Option<TcpHandle> {
        let mut table = self.tcp.table.lock();
        let listener = table.find_listener(port)?;
        loop {
            let handle = table.get_mut(listener)?.pending.pop_front()?;
            if table.get(handle).is_some() {
                return Some(handle);
            }
        }
    }

    /// Actively open a connection to `remote_ip:remote_port`.
    ///
    /// The SYN goes out immediately, so the next hop must already be in the
    /// ARP cache (see [`NetworkStack::arp_prepare_route`]). The connection
    /// reaches ESTABLISHED when the matching SYN+ACK is processed.
    pub fn tcp_connect(&self, remote_ip: Ipv4Addr, remote_port: u16) -> NetResult<TcpHandle> {
        if remote_port == 0 || remote_ip.is_unspecified() || remote_ip.is_broadcast() {
            return Err(NetError::InvalidArg);
        }
        let device = self.primary_device()?;
        let now = self.now_ms();

        let (handle, syn) = {
            let mut table = self.tcp.table.lock();
            let local_port = table.allocate_port()?;
            let mut conn =
                TcpConnection::new(device.ip(), local_port, remote_ip, remote_port, self.tcp.recv_capacity, now);
            conn.seq = table.next_isn();
            conn.set_state(TcpState::SynSent, now);
            let syn = conn.emit(flags::SYN, &[])?;
            (table.insert(conn)?, syn)
        };

        if let Err(e) = self.tcp_transmit(alloc::vec![syn]) {
            self.tcp.table.lock().remove(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Send `data` as one PSH+ACK segment
    ///
    /// # Returns
    /// * `Err(NetError::InvalidState)` - Connection not ESTABLISHED
    /// * `Err(NetError::InvalidArg)` - Empty, larger than the MSS, or stale handle
    pub fn tcp_send(&self, handle: TcpHandle, data: &[u8]) -> NetResult<()> {
        if data.is_empty() || data.len() > MAX_SEGMENT_SIZE {
            return Err(NetError::InvalidArg);
        }

        let segment = {
            let mut table = self.tcp.table.lock();
            let conn = table.get_mut(handle).ok_or(NetError::InvalidArg)?;
            if conn.state != TcpState::Established {
                return Err(NetError::InvalidState);
            }
            conn.emit(flags::PSH | flags::ACK, data)?
        };

        self.tcp_transmit(alloc::vec![segment])
    }

    /// Move buffered bytes into `buffer`
    ///
    /// # Returns
    /// * `Ok(n)` - `n` bytes copied, in arrival order
    /// * `Err(NetError::NotFound)` - Nothing buffered
    /// * `Err(NetError::InvalidState)` - Connection never synchronized
    pub fn tcp_receive(&self, handle: TcpHandle, buffer: &mut [u8]) -> NetResult<usize> {
        if buffer.is_empty() {
            return Err(NetError::InvalidArg);
        }

        let mut table = self.tcp.table.lock();
        let conn = table.get_mut(handle).ok_or(NetError::InvalidArg)?;
        match conn.state {
            TcpState::SynReceived
            | TcpState::Established
            | TcpState::CloseWait
            | TcpState::LastAck
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::TimeWait => {}
            _ => return Err(NetError::InvalidState),
        }
        if conn.recv_buffer.is_empty() {
            return Err(NetError::NotFound);
        }

        let count = buffer.len().min(conn.recv_buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(conn.recv_buffer.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    /// Close a connection or listener.
    ///
    /// An ESTABLISHED connection sends FIN+ACK and lingers in FIN_WAIT_1
    /// until the peer finishes or `tcp_tick` reaps it. A listener resets and
    /// frees its never-accepted connections. Anything else is freed at once.
    pub fn tcp_close(&self, handle: TcpHandle) -> NetResult<()> {
        let now = self.now_ms();
        let mut out = Vec::new();
        {
            let mut table = self.tcp.table.lock();
            let conn = table.get_mut(handle).ok_or(NetError::InvalidArg)?;
            match conn.state {
                TcpState::Established | TcpState::SynReceived => {
                    out.push(conn.emit(flags::FIN | flags::ACK, &[])?);
                    conn.set_state(TcpState::FinWait1, now);
                }
                TcpState::CloseWait => {
                    out.push(conn.emit(flags::FIN | flags::ACK, &[])?);
                    conn.set_state(TcpState::LastAck, now);
                }
                TcpState::Listen => {
                    let pending: Vec<TcpHandle> = conn.pending.drain(..).collect();
                    let port = conn.local_port;
                    table.remove(handle);
                    for child in pending {
                        if let Some(mut orphan) = table.remove(child) {
                            out.push(orphan.emit(flags::RST | flags::ACK, &[])?);
                        }
                    }
                    log::info!("[TCP] stopped listening on port {}", port);
                }
                _ => {
                    table.remove(handle);
                }
            }
        }
        self.tcp_transmit(out)
    }

    /// Handle an inbound segment from `src_ip` to `dest_ip`.
    ///
    /// Replies (ACK, SYN+ACK, FIN+ACK, RST) are sent before returning.
    ///
    /// # Returns
    /// * `Err(NetError::NotFound)` - No connection or listener (RST sent)
    /// * `Err(NetError::Failed)` - Checksum mismatch
    pub fn tcp_handle_packet(&self, data: &[u8], src_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> NetResult<()> {
        let local_ip = self.primary_device()?.ip();
        let segment = TcpSegment::parse(data, src_ip, dest_ip)?;
        let now = self.now_ms();

        let mut out = Vec::new();
        let result = {
            let mut table = self.tcp.table.lock();
            self.tcp.process(&mut table, &segment, src_ip, dest_ip, local_ip, now, &mut out)
        };

        let sent = self.tcp_transmit(out);
        result.and(sent)
    }

    /// Free closing connections that have lingered past `tcp_time_wait_ms`
    ///
    /// # Returns
    /// Number of connections freed
    pub fn tcp_tick(&self) -> usize {
        let now = self.now_ms();
        let mut table = self.tcp.table.lock();
        let expired: Vec<TcpHandle> = table
            .handles()
            .filter(|(_, conn)| conn.state.is_closing() && now.saturating_sub(conn.state_since) >= self.tcp.time_wait_ms)
            .map(|(handle, _)| handle)
            .collect();
        for handle in &expired {
            table.remove(*handle);
        }
        expired.len()
    }

    pub fn tcp_state(&self, handle: TcpHandle) -> Option<TcpState> {
        self.tcp.table.lock().get(handle).map(|conn| conn.state())
    }

    pub fn tcp_status(&self, handle: TcpHandle) -> Option<TcpStatus> {
        self.tcp.table.lock().get(handle).map(TcpStatus::from)
    }

    /// Every live connection and listener
    pub fn tcp_connections(&self) -> Vec<(TcpHandle, TcpState)> {
        self.tcp
            .table
            .lock()
            .handles()
            .map(|(handle, conn)| (handle, conn.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn conn(port: u16) -> TcpConnection {
        TcpConnection::new(SERVER, port, CLIENT, 40000, 16, 0)
    }

    #[test]
    fn test_segment_round_trip() {
        let mut segment = TcpSegment::new(40000, 80, 1000, 0, flags::SYN, 4096);
        segment.payload = vec![1, 2, 3];
        let bytes = segment.build(CLIENT, SERVER).unwrap();
        assert_eq!(bytes[12], 0x50);
        assert_eq!(bytes[13], flags::SYN);

        let parsed = TcpSegment::parse(&bytes, CLIENT, SERVER).unwrap();
        assert_eq!(parsed, segment);
        assert_eq!(parsed.seq_len(), 4);
    }

    #[test]
    fn test_checksum_uses_pseudo_header() {
        let bytes = TcpSegment::new(1, 2, 3, 4, flags::ACK, 0).build(CLIENT, SERVER).unwrap();
        assert_eq!(TcpSegment::parse(&bytes, SERVER, SERVER), Err(TcpError::ChecksumMismatch));
    }

    #[test]
    fn test_parse_rejects_short_and_bad_offset() {
        assert_eq!(TcpSegment::parse(&[0; 19], CLIENT, SERVER), Err(TcpError::PacketTooShort));
        let mut bytes = TcpSegment::new(1, 2, 3, 4, flags::ACK, 0).build(CLIENT, SERVER).unwrap();
        bytes[12] = 0x40;
        assert_eq!(TcpSegment::parse(&bytes, CLIENT, SERVER), Err(TcpError::InvalidDataOffset));
    }

    #[test]
    fn test_table_reuses_slots_with_new_generation() {
        let mut table = TcpTable::new(2);
        let first = table.insert(conn(1)).unwrap();
        let second = table.insert(conn(2)).unwrap();
        assert_eq!(table.insert(conn(3)).err(), Some(NetError::OutOfMemory));

        assert!(table.remove(first).is_some());
        assert!(table.get(first).is_none());
        let third = table.insert(conn(3)).unwrap();
        assert_ne!(first, third);
        assert!(table.get(first).is_none());
        assert_eq!(table.get(third).map(|c| c.local_port), Some(3));
        assert_eq!(table.get(second).map(|c| c.local_port), Some(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_clears_pending_queues() {
        let mut table = TcpTable::new(4);
        let listener = table.insert(TcpConnection::listener(SERVER, 80, 0)).unwrap();
        let child = table.insert(conn(80)).unwrap();
        table.get_mut(listener).unwrap().pending.push_back(child);

        table.remove(child);
        assert_eq!(table.get(listener).unwrap().pending_accepts(), 0);
    }

    #[test]
    fn test_find_skips_listener() {
        let mut table = TcpTable::new(4);
        let listener = table.insert(TcpConnection::listener(SERVER, 80, 0)).unwrap();
        assert_eq!(table.find_listener(80), Some(listener));
        assert_eq!(table.find(80, Ipv4Addr::UNSPECIFIED, 0), None);
    }

    #[test]
    fn test_emit_advances_sequence() {
        let mut c = conn(80);
        c.seq = 100;
        c.emit(flags::SYN | flags::ACK, &[]).unwrap();
        assert_eq!(c.seq, 101);
        c.emit(flags::PSH | flags::ACK, &[0; 10]).unwrap();
        assert_eq!(c.seq, 111);
        c.emit(flags::ACK, &[]).unwrap();
        assert_eq!(c.seq, 111);
    }

    #[test]
    fn test_window_tracks_free_space() {
        let mut c = conn(80);
        assert_eq!(c.window(), 16);
        c.recv_buffer.extend([0u8; 10]);
        assert_eq!(c.window(), 6);
    }

    #[test]
    fn test_reset_for_syn() {
        let syn = TcpSegment::new(40000, 81, 500, 0, flags::SYN, 1024);
        let out = reset_for(&syn, SERVER, CLIENT).unwrap();
        let rst = TcpSegment::parse(&out.bytes, SERVER, CLIENT).unwrap();
        assert_eq!(rst.flags, flags::RST | flags::ACK);
        assert_eq!(rst.ack, 501);
        assert_eq!(rst.dest_port, 40000);
        assert_eq!(out.dest, CLIENT);
    }
}
