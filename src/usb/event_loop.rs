//! Completion-processing thread
//!
//! One event loop runs per opened device. It is the only thread that
//! processes asynchronous transfer completions: it takes the backend's
//! event-handling lock at startup and holds it for its entire active
//! lifetime, so reader callbacks always execute on this thread and
//! never concurrently with each other.
//!
//! The loop blocks in [`UsbBackend::wait_completion`] with a generous
//! timeout as a liveness safety net; destruction raises a shutdown flag
//! and wakes the wait, then joins the thread. The thread is never
//! forcibly terminated.

use super::backend::UsbBackend;
use super::device::Device;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Liveness safety net for the blocking completion wait
const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dedicated completion-processing thread for one device.
pub struct EventLoop {
    shutdown: Arc<AtomicBool>,
    backend: Arc<dyn UsbBackend>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Spawn the event loop for `device`.
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let backend = device.backend()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_backend = Arc::clone(&backend);
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || {
                // Held for the whole active lifetime of the loop: no
                // other thread may process completions while we run.
                let events_guard = thread_backend.events_mutex().lock();
                log::info!("event loop started");

                while !thread_shutdown.load(Ordering::Acquire) {
                    let Some(completion) = thread_backend.wait_completion(EVENT_WAIT_TIMEOUT)
                    else {
                        // Shutdown wake or liveness timeout; loop re-checks the flag.
                        continue;
                    };
                    match device.completion_sink() {
                        Some(sink) => sink.handle_completion(completion),
                        None => log::debug!(
                            "dropping completion for slot {}: no active reader",
                            completion.slot
                        ),
                    }
                }

                drop(events_guard);
                log::info!("event loop exit");
            })
            .map_err(|e| Error::Other(format!("failed to spawn event loop thread: {e}")))?;

        Ok(Self {
            shutdown,
            backend,
            handle: Some(handle),
        })
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        log::info!("shutting down event loop");
        self.shutdown.store(true, Ordering::Release);
        self.backend.wake();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("event loop thread panicked");
            }
        }
        log::info!("event loop shut down");
    }
}
