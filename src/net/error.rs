//! Error type shared by every layer of the stack.
//!
//! Errors are returned by value and never retried on the caller's behalf.
//! `Timeout` and `NotFound` mean "no response"; `Failed` and `NotSupported`
//! are protocol errors worth reporting.

use alloc::collections::TryReserveError;
use core::fmt;

/// Stack-wide error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Missing, empty or malformed argument
    InvalidArg,
    /// A frame or packet buffer could not be allocated
    OutOfMemory,
    /// No such device, or the device is down
    DeviceNotFound,
    /// Protocol, message type or feature not handled
    NotSupported,
    /// Not for us, cache miss, no listener, no answer
    NotFound,
    /// Checksum mismatch or protocol-level rejection (DHCP NAK)
    Failed,
    /// Deadline passed without a response, or the RX ring is empty
    Timeout,
    /// Operation not valid in the current connection state
    InvalidState,
    /// Port, listener or device name already taken
    AlreadyExists,
    /// Global stack not installed yet
    NotInitialized,
    /// Entry point exists but has no implementation
    NotImplemented,
}

impl NetError {
    /// `true` for errors a caller should report as "no response"
    pub fn is_no_response(&self) -> bool {
        matches!(self, NetError::Timeout | NetError::NotFound)
    }

    /// `true` for errors a caller should report as a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, NetError::Failed | NetError::NotSupported)
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::InvalidArg => write!(f, "Invalid argument"),
            NetError::OutOfMemory => write!(f, "Out of memory"),
            NetError::DeviceNotFound => write!(f, "Network device not found"),
            NetError::NotSupported => write!(f, "Not supported"),
            NetError::NotFound => write!(f, "Not found"),
            NetError::Failed => write!(f, "Operation failed"),
            NetError::Timeout => write!(f, "Timed out"),
            NetError::InvalidState => write!(f, "Invalid state"),
            NetError::AlreadyExists => write!(f, "Already exists"),
            NetError::NotInitialized => write!(f, "Network stack not initialized"),
            NetError::NotImplemented => write!(f, "Not implemented"),
        }
    }
}

impl From<TryReserveError> for NetError {
    fn from(_: TryReserveError) -> Self {
        NetError::OutOfMemory
    }
}

pub type NetResult<T> = Result<T, NetError>;

/// Allocate an empty buffer able to hold `capacity` bytes
pub(crate) fn alloc_buffer(capacity: usize) -> NetResult<alloc::vec::Vec<u8>> {
    let mut buffer = alloc::vec::Vec::new();
    buffer.try_reserve_exact(capacity)?;
    Ok(buffer)
}
