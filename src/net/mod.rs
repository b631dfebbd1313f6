//! Network stack implementation
//!
//! Layers from the bottom up: devices and drivers, Ethernet, ARP, IPv4,
//! then ICMP, UDP and TCP, with DNS, DHCP and ping built on top. All state
//! lives in [`stack::NetworkStack`].

pub mod error;
pub mod config;
pub mod checksum;
pub mod wait;
pub mod device;
pub mod loopback;
pub mod ethernet;
pub mod arp;
pub mod ipv4;
pub mod icmp;
pub mod udp;
pub mod tcp;
pub mod dns;
pub mod dhcp;
pub mod ping;
pub mod stack;
