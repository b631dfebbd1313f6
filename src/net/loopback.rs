//! Loopback driver
//!
//! Echoes every transmitted frame back as a received frame, which lets the
//! whole stack run without hardware. [`LoopbackDriver::wire`] splits the
//! echo into separate TX and RX queues so a harness can watch what the stack
//! sends and feed it frames of its own.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::net::device::NetworkDriver;
use crate::net::error::{NetError, NetResult};

/// Default queue depth
pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// Shared FIFO of raw frames
#[derive(Clone, Default)]
pub struct FrameQueue {
    frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Vec<u8>) {
        self.frames.lock().push_back(frame);
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Remove and return every queued frame
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.frames.lock().drain(..).collect()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

pub struct LoopbackDriver {
    tx: FrameQueue,
    rx: FrameQueue,
    max_queue_size: usize,
}

impl LoopbackDriver {
    /// Create an echoing loopback driver
    ///
    /// # Arguments
    /// * `max_queue_size` - Maximum number of frames held before transmit fails
    pub fn new(max_queue_size: usize) -> Self {
        let queue = FrameQueue::new();
        Self {
            tx: queue.clone(),
            rx: queue,
            max_queue_size,
        }
    }

    /// Create a driver whose transmitted frames land in one queue and whose
    /// received frames come from another.
    ///
    /// # Returns
    /// `(driver, tx, rx)`: read what the stack sent from `tx`, push frames
    /// for the stack to receive into `rx`.
    pub fn wire(max_queue_size: usize) -> (Self, FrameQueue, FrameQueue) {
        let tx = FrameQueue::new();
        let rx = FrameQueue::new();
        let driver = Self {
            tx: tx.clone(),
            rx: rx.clone(),
            max_queue_size,
        };
        (driver, tx, rx)
    }

    /// Two drivers joined back to back: what one transmits, the other
    /// receives
    pub fn pair(max_queue_size: usize) -> (Self, Self) {
        let a_to_b = FrameQueue::new();
        let b_to_a = FrameQueue::new();
        let a = Self {
            tx: a_to_b.clone(),
            rx: b_to_a.clone(),
            max_queue_size,
        };
        let b = Self {
            tx: b_to_a,
            rx: a_to_b,
            max_queue_size,
        };
        (a, b)
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

impl NetworkDriver for LoopbackDriver {
    fn transmit(&mut self, frame: &[u8]) -> NetResult<()> {
        if self.tx.len() >= self.max_queue_size {
            return Err(NetError::OutOfMemory);
        }

        let mut copy = Vec::new();
        copy.try_reserve_exact(frame.len())?;
        copy.extend_from_slice(frame);
        self.tx.push(copy);
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> NetResult<usize> {
        let frame = self.rx.pop().ok_or(NetError::Timeout)?;
        let len = frame.len().min(buffer.len());
        buffer[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }
}
