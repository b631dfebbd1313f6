//! Time source and cooperative waiting
//!
//! Everything that waits for the network (ARP resolution, DNS, DHCP, ping)
//! is an `async fn` bounded by a [`Deadline`]. Each iteration pumps the
//! inbound path once and then yields, so the caller's thread is never
//! pegged in an empty delay loop.

use core::future::Future;
use core::pin::{Pin, pin};
use core::task::{Context, Poll};

use futures_util::task::noop_waker_ref;

/// Monotonic millisecond clock (kernel uptime)
pub trait Clock: Send + Sync {
    fn uptime_ms(&self) -> u64;
}

impl<F> Clock for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn uptime_ms(&self) -> u64 {
        self()
    }
}

/// Point in time after which a wait gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start_ms: u64,
    expires_at: u64,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, timeout_ms: u64) -> Self {
        let start_ms = clock.uptime_ms();
        Self {
            start_ms,
            expires_at: start_ms.saturating_add(timeout_ms),
        }
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.uptime_ms() >= self.expires_at
    }

    /// Milliseconds since the deadline was armed
    pub fn elapsed_ms(&self, clock: &dyn Clock) -> u64 {
        clock.uptime_ms().saturating_sub(self.start_ms)
    }
}

/// Yield control back to the executor once.
///
/// Returns `Pending` on the first poll after waking itself, `Ready` on the
/// next one.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await
}

/// Drive a future to completion on the current thread.
///
/// For kernel threads that want the blocking call shape. The stack's futures
/// only ever wait on [`yield_now`], so busy polling with a no-op waker makes
/// progress on every iteration.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let mut cx = Context::from_waker(noop_waker_ref());
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_closure_clock() {
        let now = AtomicU64::new(100);
        let clock = || now.load(Ordering::Relaxed);
        let deadline = Deadline::after(&clock, 50);
        assert!(!deadline.is_expired(&clock));
        now.store(149, Ordering::Relaxed);
        assert!(!deadline.is_expired(&clock));
        assert_eq!(deadline.elapsed_ms(&clock), 49);
        now.store(150, Ordering::Relaxed);
        assert!(deadline.is_expired(&clock));
    }

    #[test]
    fn test_block_on_runs_through_yields() {
        let value = block_on(async {
            let mut total = 0;
            for step in 1..=3 {
                yield_now().await;
                total += step;
            }
            total
        });
        assert_eq!(value, 6);
    }
}
