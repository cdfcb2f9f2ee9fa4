//! Rate-limited asynchronous message writer
//!
//! A writer owns one background thread that periodically asks a
//! caller-supplied callback for a message and, when the callback yields
//! a non-empty payload, sends it with one asynchronous bulk write.
//! [`Writer::update`] requests an immediate tick; any number of update
//! requests inside one interval collapse into a single tick, so bursty
//! callers cannot flood the bus.

use super::device::Device;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on one condvar wait slice, so the loop stays responsive
/// to shutdown even with very long intervals
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

struct WriterState {
    ok: bool,
    pending: bool,
}

struct WriterShared {
    state: Mutex<WriterState>,
    cond: Condvar,
}

/// Background thread sending callback-produced messages at a bounded rate.
pub struct Writer {
    shared: Arc<WriterShared>,
    handle: Option<JoinHandle<()>>,
}

impl Writer {
    /// Start the writer thread.
    ///
    /// `callback` runs on the writer thread once per tick; an empty
    /// return value skips the write for that tick.
    pub fn new(
        device: Arc<Device>,
        callback: impl Fn() -> Vec<u8> + Send + 'static,
        interval: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(WriterShared {
            state: Mutex::new(WriterState {
                ok: true,
                pending: false,
            }),
            cond: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("usb-writer".to_string())
            .spawn(move || {
                let mut last_tick = Instant::now();
                loop {
                    {
                        let mut state = thread_shared.state.lock();
                        loop {
                            if !state.ok {
                                log::info!("writer thread exiting");
                                return;
                            }
                            if state.pending || Instant::now() >= last_tick + interval {
                                state.pending = false;
                                break;
                            }
                            let deadline =
                                (last_tick + interval).min(Instant::now() + MAX_WAIT_SLICE);
                            thread_shared.cond.wait_until(&mut state, deadline);
                        }
                    }

                    let message = callback();
                    if !message.is_empty() {
                        if let Err(e) = device.write_async(&message) {
                            log::error!("writer send failed: {}", e);
                        }
                    }
                    last_tick = Instant::now();
                }
            })
            .map_err(|e| Error::Other(format!("failed to spawn writer thread: {e}")))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Request an immediate tick. Multiple requests inside one interval
    /// coalesce into a single callback invocation.
    pub fn update(&self) {
        let mut state = self.shared.state.lock();
        state.pending = true;
        self.shared.cond.notify_all();
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        log::info!("shutting down writer");
        {
            let mut state = self.shared.state.lock();
            state.ok = false;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("writer thread panicked");
            }
        }
        log::info!("writer shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::{MockBackend, MockDriver};
    use super::*;
    use crate::usb::Context;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock_device() -> (Arc<Device>, MockBackend) {
        let backend = MockBackend::new();
        let driver = MockDriver::new();
        driver.attach(1, 2, backend.clone());
        let context = Context::with_driver(Arc::new(driver));
        (Arc::new(Device::open(&context, 1, 2).unwrap()), backend)
    }

    #[test]
    fn updates_within_one_interval_coalesce() {
        let (device, backend) = mock_device();
        let calls = Arc::new(AtomicUsize::new(0));
        // The callback announces each tick and then blocks until the
        // test releases it, so the update() burst below provably lands
        // while the first tick is still running.
        let (started_tx, started_rx) = bounded::<()>(0);
        let (release_tx, release_rx) = bounded::<Vec<u8>>(0);

        let writer = {
            let calls = Arc::clone(&calls);
            Writer::new(
                device,
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _ = started_tx.send(());
                    release_rx.recv().unwrap_or_default()
                },
                Duration::from_secs(3600),
            )
            .unwrap()
        };

        writer.update();
        started_rx.recv().unwrap(); // tick 1 entered the callback
        writer.update();
        writer.update();
        writer.update();
        release_tx.send(vec![0xAA, 0xBB]).unwrap(); // finishes tick 1
        started_rx.recv().unwrap(); // the burst coalesced into tick 2
        release_tx.send(Vec::new()).unwrap(); // empty payload: no write

        // Give a hypothetical spurious third tick time to show up.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let writes = backend.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, vec![0xAA, 0xBB]);
        drop(writer);
    }

    #[test]
    fn drop_joins_idle_writer() {
        let (device, _backend) = mock_device();
        let writer = Writer::new(device, Vec::new, Duration::from_secs(3600)).unwrap();
        drop(writer);
    }
}
