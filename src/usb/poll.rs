//! Blocking glue for driving transfer futures from engine threads
//!
//! The engine is thread-based; the underlying USB stack exposes
//! completions as futures. This module parks the calling thread on a
//! future with a deadline, waking on the transfer's own waker. Nothing
//! here knows about executors or reactors: `nusb` completes transfers
//! on its own internal event thread and only needs a waker to poke.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Waker that unparks a captured thread.
pub(crate) struct ThreadWaker(pub(crate) Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Waker for the current thread.
pub(crate) fn current_thread_waker() -> Waker {
    Waker::from(Arc::new(ThreadWaker(thread::current())))
}

/// Block on `future` until it resolves or `timeout` elapses.
///
/// Returns `None` on timeout; the future is dropped, which cancels the
/// underlying transfer.
pub(crate) fn block_on_deadline<F: Future>(future: F, timeout: Duration) -> Option<F::Output> {
    let deadline = Instant::now() + timeout;
    let waker = current_thread_waker();
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return Some(output);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_future_resolves_immediately() {
        let out = block_on_deadline(async { 41 + 1 }, Duration::from_secs(1));
        assert_eq!(out, Some(42));
    }

    #[test]
    fn pending_future_times_out() {
        let forever = std::future::pending::<()>();
        let start = Instant::now();
        assert!(block_on_deadline(forever, Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
