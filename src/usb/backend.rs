//! Hardware backend seam for the transfer engine
//!
//! Everything above this trait (device surface, event loop, reader,
//! writer) is hardware-agnostic and fully testable. The production
//! implementation lives in [`backend_nusb`](super::backend_nusb); the
//! scripted test double lives in [`mock`](super::mock).

use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Final status of one asynchronous bulk-in transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer finished; data is valid (possibly shorter than requested)
    Completed,
    /// Transfer timed out with no data
    TimedOut,
    /// Transfer was cancelled during shutdown
    Cancelled,
    /// Endpoint stalled
    Stall,
    /// Device went away
    Disconnected,
    /// Device delivered more data than the slot buffer could hold
    Overflow,
    /// Any other transport fault
    Fault,
}

/// One finished asynchronous bulk-in transfer.
#[derive(Debug, Clone)]
pub struct BulkCompletion {
    /// Slot token passed to [`UsbBackend::submit_read`]
    pub slot: usize,
    /// Final transfer status
    pub status: TransferStatus,
    /// Received bytes (empty unless `status` is `Completed`)
    pub data: Vec<u8>,
}

/// Low-level operations of one opened USB device.
///
/// Contract notes:
///
/// - Bulk-in completions on one endpoint are delivered in submission
///   order; [`UsbBackend::wait_completion`] must preserve that order.
/// - [`UsbBackend::cancel_reads`] requests cancellation of every
///   in-flight read; each one still produces a completion (with
///   `Cancelled` or its natural final status) so the reader can account
///   for every slot.
/// - [`UsbBackend::wake`] interrupts a concurrent `wait_completion`.
pub trait UsbBackend: Send + Sync {
    /// Obtain exclusive access to a USB interface.
    fn claim_interface(&self, interface: u8) -> Result<()>;

    /// Vendor control transfer, device-to-host.
    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Vendor control transfer, host-to-device.
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Synchronous bulk-in transfer. A short (or empty, on timeout)
    /// result is not an error; transport faults are.
    fn bulk_read(&self, endpoint: u8, len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Synchronous bulk-out transfer; returns the number of bytes the
    /// device accepted. Fails with `WriteTimeout` when the deadline
    /// passes first (the in-flight transfer is cancelled).
    fn bulk_write(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Queue one asynchronous bulk-in transfer on the stream endpoint,
    /// tagged with the caller's slot token.
    fn submit_read(&self, slot: usize, len: usize) -> Result<()>;

    /// Request cancellation of every in-flight asynchronous read.
    fn cancel_reads(&self);

    /// Block until the next asynchronous completion, a [`wake`] call,
    /// or the timeout, whichever comes first.
    ///
    /// [`wake`]: UsbBackend::wake
    fn wait_completion(&self, timeout: Duration) -> Option<BulkCompletion>;

    /// Interrupt a concurrent [`wait_completion`] without delivering a
    /// completion.
    ///
    /// [`wait_completion`]: UsbBackend::wait_completion
    fn wake(&self);

    /// The event-handling lock. The event loop holds this for its whole
    /// active lifetime so no second thread can process completions.
    fn events_mutex(&self) -> &Mutex<()>;

    /// Reset the device port.
    fn reset(&self) -> Result<()>;
}

/// Factory opening devices by vendor/product id.
pub trait UsbDriver: Send + Sync {
    /// Open the first attached device matching the ids.
    fn open(&self, vendor_id: u16, product_id: u16) -> Result<Arc<dyn UsbBackend>>;
}
