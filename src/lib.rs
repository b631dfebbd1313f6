//! In-kernel IPv4 network stack.
//!
//! Ethernet framing, ARP resolution, IPv4, ICMP echo, UDP datagrams, a TCP
//! connection state machine, a DNS resolver and a DHCP client, all hanging
//! off a single [`NetworkStack`](net::stack::NetworkStack) root object.
//!
//! The crate is `no_std` + `alloc` so it links into a kernel; drivers plug in
//! through [`NetworkDriver`](net::device::NetworkDriver) and time comes from a
//! [`Clock`](net::wait::Clock).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod net;

pub use net::error::{NetError, NetResult};
pub use net::stack::NetworkStack;
