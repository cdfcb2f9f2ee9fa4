//! Continuous bulk-in read pipeline
//!
//! The reader owns N pre-allocated transfer slots and keeps them all in
//! flight: every successful completion hands the received bytes to the
//! user callback (synchronously, on the event-loop thread) and then
//! resubmits the same slot. Slots only leave the pipeline when the
//! reader is shutting down or a resubmission fails.
//!
//! # Teardown
//!
//! Dropping the reader is the safety-critical path: hardware may still
//! complete into slot buffers after the drop begins. The destructor
//! sets the exit flag (suppressing any further user callbacks), asks
//! the backend to cancel every in-flight transfer, and then blocks on a
//! live-slot counter until every slot has retired. Only then does it
//! release the slot resources and detach from the device. Progress is
//! logged at a bounded interval while waiting.

use super::backend::{BulkCompletion, TransferStatus, UsbBackend};
use super::device::Device;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bounded interval for teardown progress logging
const RETIRE_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of one transfer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Allocated, never submitted
    Idle,
    /// In flight at the hardware
    Submitted,
    /// Cancellation requested, completion still outstanding
    Canceled,
    /// Out of the pipeline for good
    Retired,
}

/// State shared between the reader handle and the event-loop thread.
pub(crate) struct ReaderShared {
    backend: Arc<dyn UsbBackend>,
    callback: Box<dyn Fn(&[u8]) + Send + Sync>,
    buffer_size: usize,
    slots: Mutex<Vec<SlotState>>,
    live: AtomicUsize,
    exit: AtomicBool,
    retire_mutex: Mutex<()>,
    retire_cond: Condvar,
}

impl ReaderShared {
    /// Process one completion on the event-loop thread.
    pub(crate) fn handle_completion(&self, completion: BulkCompletion) {
        match completion.status {
            TransferStatus::Completed => {
                // The exit check must precede the callback: once teardown
                // has begun, no user code may run.
                if !self.exit.load(Ordering::Acquire) {
                    (self.callback)(&completion.data);
                }
                self.resubmit_or_retire(completion.slot);
            }
            TransferStatus::TimedOut => self.resubmit_or_retire(completion.slot),
            TransferStatus::Cancelled => self.retire(completion.slot),
            status => {
                log::error!(
                    "read transfer on slot {} failed: {:?}",
                    completion.slot,
                    status
                );
                self.retire(completion.slot);
            }
        }
    }

    fn resubmit_or_retire(&self, slot: usize) {
        if self.exit.load(Ordering::Acquire) {
            self.retire(slot);
            return;
        }
        match self.backend.submit_read(slot, self.buffer_size) {
            Ok(()) => self.set_state(slot, SlotState::Submitted),
            Err(e) => {
                log::error!("failed to resubmit read slot {}: {}", slot, e);
                self.retire(slot);
            }
        }
    }

    fn retire(&self, slot: usize) {
        self.set_state(slot, SlotState::Retired);
        let _guard = self.retire_mutex.lock();
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.retire_cond.notify_all();
    }

    fn set_state(&self, slot: usize, state: SlotState) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(slot) {
            *entry = state;
        }
    }

    fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Continuously-resubmitting pipeline of bulk-in transfers.
pub struct Reader {
    device: Arc<Device>,
    shared: Arc<ReaderShared>,
}

impl Reader {
    /// Start the pipeline with `buffer_count` slots of `buffer_size`
    /// bytes each. All slots are submitted before this returns; the
    /// event loop for the device must be running for completions to be
    /// processed.
    pub fn new(
        device: Arc<Device>,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
        buffer_count: usize,
        buffer_size: usize,
    ) -> Result<Self> {
        if buffer_count == 0 || buffer_size == 0 {
            return Err(Error::InvalidParameter(
                "reader needs at least one buffer of nonzero size".into(),
            ));
        }
        let backend = device.backend()?;
        let shared = Arc::new(ReaderShared {
            backend,
            callback: Box::new(callback),
            buffer_size,
            slots: Mutex::new(vec![SlotState::Idle; buffer_count]),
            live: AtomicUsize::new(0),
            exit: AtomicBool::new(false),
            retire_mutex: Mutex::new(()),
            retire_cond: Condvar::new(),
        });
        device.set_completion_sink(Arc::clone(&shared))?;

        log::info!(
            "reader starting {} transfers of {} bytes",
            buffer_count,
            buffer_size
        );
        for slot in 0..buffer_count {
            if let Err(e) = shared.backend.submit_read(slot, buffer_size) {
                log::error!("reader failed to submit slot {}: {}", slot, e);
                let reader = Self {
                    device: Arc::clone(&device),
                    shared,
                };
                // Drop tears down the slots already in flight.
                drop(reader);
                return Err(e);
            }
            shared.set_state(slot, SlotState::Submitted);
            shared.live.fetch_add(1, Ordering::AcqRel);
        }
        log::info!("reader transfers started");

        Ok(Self { device, shared })
    }

    /// Number of slots still in the pipeline.
    pub fn live_transfers(&self) -> usize {
        self.shared.live_count()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        log::info!(
            "reader shutting down, {} transfers live",
            self.shared.live_count()
        );
        self.shared.exit.store(true, Ordering::Release);

        {
            let mut slots = self.shared.slots.lock();
            for state in slots.iter_mut() {
                if *state == SlotState::Submitted {
                    *state = SlotState::Canceled;
                }
            }
        }
        self.shared.backend.cancel_reads();

        let mut guard = self.shared.retire_mutex.lock();
        while self.shared.live_count() > 0 {
            log::info!(
                "reader waiting for {} transfers to retire",
                self.shared.live_count()
            );
            self.shared
                .retire_cond
                .wait_for(&mut guard, RETIRE_WAIT_INTERVAL);
        }
        drop(guard);

        self.device.clear_completion_sink();
        log::info!("reader shut down");
    }
}
