//! Ping: ICMP echo round-trip measurement

use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU16, Ordering};
use spin::Mutex;

use crate::net::error::{NetError, NetResult};
use crate::net::stack::NetworkStack;
use crate::net::wait::{Deadline, yield_now};

/// Identifier carried by every echo request this stack sends
pub const PING_IDENTIFIER: u16 = 1;

/// Echo payload
pub const PING_PAYLOAD: [u8; 32] = *b"abcdefghijklmnopqrstuvwabcdefghi";

/// Per-stack sequence counter and the sequences still awaiting a reply
pub struct PingState {
    next_sequence: AtomicU16,
    in_flight: Mutex<Vec<u16>>,
}

impl PingState {
    pub const fn new() -> Self {
        Self {
            next_sequence: AtomicU16::new(1),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    fn next_sequence(&self) -> u16 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn is_in_flight(&self, sequence: u16) -> bool {
        self.in_flight.lock().contains(&sequence)
    }

    /// Allocate a sequence number, held until the guard drops
    fn start(&self) -> InFlight<'_> {
        let sequence = self.next_sequence();
        self.in_flight.lock().push(sequence);
        InFlight { state: self, sequence }
    }
}

/// Marks one echo request as outstanding
struct InFlight<'a> {
    state: &'a PingState,
    sequence: u16,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let sequence = self.sequence;
        self.state.in_flight.lock().retain(|s| *s != sequence);
    }
}

impl Default for PingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Results of a [`NetworkStack::ping_count`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    pub min_ms: u64,
    pub max_ms: u64,
    pub total_ms: u64,
}

impl PingStats {
    fn record(&mut self, rtt_ms: u64) {
        if self.received == 0 {
            self.min_ms = rtt_ms;
            self.max_ms = rtt_ms;
        } else {
            self.min_ms = self.min_ms.min(rtt_ms);
            self.max_ms = self.max_ms.max(rtt_ms);
        }
        self.received += 1;
        self.total_ms += rtt_ms;
    }

    pub fn avg_ms(&self) -> Option<u64> {
        (self.received > 0).then(|| self.total_ms / self.received as u64)
    }

    pub fn lost(&self) -> u32 {
        self.transmitted - self.received
    }

    pub fn loss_percent(&self) -> u32 {
        if self.transmitted == 0 {
            return 0;
        }
        self.lost() * 100 / self.transmitted
    }
}

impl NetworkStack {
    /// Send one echo request to `dest` and wait for the matching reply.
    ///
    /// A reply matches on identifier, sequence and source address. Replies
    /// belonging to other outstanding pings stay queued for their waiter;
    /// stale ones carrying our identifier are discarded.
    ///
    /// # Returns
    /// * `Ok(rtt_ms)` - Round-trip time in milliseconds
    /// * `Err(NetError::Timeout)` - No reply within `ping_timeout_ms`, or the
    ///   next hop never answered ARP
    pub async fn ping_send(&self, dest: Ipv4Addr) -> NetResult<u64> {
        if dest.is_unspecified() {
            return Err(NetError::InvalidArg);
        }

        self.arp_prepare_route(dest).await?;

        let clock = self.clock();
        let in_flight = self.ping.start();
        let sequence = in_flight.sequence;
        let deadline = Deadline::after(clock, self.config.ping_timeout_ms);
        let sent_at = clock.uptime_ms();

        log::debug!("[PING] echo request to {} seq={}", dest, sequence);
        self.icmp_send_echo(dest, PING_IDENTIFIER, sequence, &PING_PAYLOAD)?;

        loop {
            let reply = self.icmp.take_matching(
                |reply| reply.identifier == PING_IDENTIFIER && reply.sequence == sequence && reply.src == dest,
                |reply| reply.identifier != PING_IDENTIFIER || self.ping.is_in_flight(reply.sequence),
            );
            if let Some(reply) = reply {
                let rtt = reply.received_at.saturating_sub(sent_at);
                log::info!("[PING] reply from {}: seq={} time={}ms", dest, sequence, rtt);
                return Ok(rtt);
            }

            if deadline.is_expired(clock) {
                log::info!("[PING] {} seq={} timed out", dest, sequence);
                return Err(NetError::Timeout);
            }
            self.poll();
            yield_now().await;
        }
    }

    /// Resolve `hostname` and ping it
    pub async fn ping_hostname(&self, hostname: &str) -> NetResult<u64> {
        let dest = self.dns_resolve(hostname).await?;
        self.ping_send(dest).await
    }

    /// Ping `dest` `count` times; timeouts count as lost
    pub async fn ping_count(&self, dest: Ipv4Addr, count: u32) -> NetResult<PingStats> {
        let mut stats = PingStats::default();
        for _ in 0..count {
            stats.transmitted += 1;
            match self.ping_send(dest).await {
                Ok(rtt) => stats.record(rtt),
                Err(NetError::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(stats)
    }
}
