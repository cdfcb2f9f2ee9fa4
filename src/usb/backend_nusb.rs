//! Production backend over the `nusb` USB stack

use super::backend::{BulkCompletion, TransferStatus, UsbBackend, UsbDriver};
use super::poll::{block_on_deadline, current_thread_waker};
use super::ENDPOINT_STREAM_IN;
use crate::error::{Error, Result};
use nusb::transfer::{Completion, Control, ControlType, Recipient, RequestBuffer, TransferError};
use nusb::Interface;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

fn usb_error(e: impl std::fmt::Display) -> Error {
    Error::UsbIoFailed(e.to_string())
}

fn map_transfer_error(e: TransferError) -> Error {
    match e {
        TransferError::Stall => Error::ProtocolError("endpoint stalled".into()),
        TransferError::Disconnected => Error::Disconnected,
        other => Error::UsbIoFailed(other.to_string()),
    }
}

fn map_completion_status(status: std::result::Result<(), TransferError>) -> TransferStatus {
    match status {
        Ok(()) => TransferStatus::Completed,
        Err(TransferError::Cancelled) => TransferStatus::Cancelled,
        Err(TransferError::Stall) => TransferStatus::Stall,
        Err(TransferError::Disconnected) => TransferStatus::Disconnected,
        Err(_) => TransferStatus::Fault,
    }
}

struct ReadState {
    queue: nusb::transfer::Queue<RequestBuffer>,
    /// Slot tokens in submission order; bulk-in completions on one
    /// endpoint are delivered in the same order.
    tokens: VecDeque<usize>,
}

/// One opened device on the real USB stack.
pub struct NusbBackend {
    device: nusb::Device,
    interfaces: Mutex<HashMap<u8, Interface>>,
    read_state: Mutex<Option<ReadState>>,
    woken: AtomicBool,
    waiter: Mutex<Option<Thread>>,
    events: Mutex<()>,
}

impl NusbBackend {
    fn new(device: nusb::Device) -> Self {
        Self {
            device,
            interfaces: Mutex::new(HashMap::new()),
            read_state: Mutex::new(None),
            woken: AtomicBool::new(false),
            waiter: Mutex::new(None),
            events: Mutex::new(()),
        }
    }

    /// The command pipe lives on interface 0, the streaming FIFO pipes
    /// on interface 1.
    fn interface_for(&self, endpoint: u8) -> Result<Interface> {
        let number = if endpoint & 0x0F == 1 { 0 } else { 1 };
        self.interfaces
            .lock()
            .get(&number)
            .cloned()
            .ok_or_else(|| Error::UsbIoFailed(format!("interface {number} not claimed")))
    }

    fn notify_waiter(&self) {
        if let Some(thread) = self.waiter.lock().clone() {
            thread.unpark();
        }
    }
}

impl UsbBackend for NusbBackend {
    fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut interfaces = self.interfaces.lock();
        if interfaces.contains_key(&interface) {
            return Ok(());
        }
        let claimed = self
            .device
            .claim_interface(interface)
            .map_err(|e| {
                log::error!("claiming interface {} failed: {}", interface, e);
                Error::InterfaceClaimFailed(interface)
            })?;
        interfaces.insert(interface, claimed);
        Ok(())
    }

    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.device
            .control_in_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                },
                buf,
                timeout,
            )
            .map_err(map_transfer_error)
    }

    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.device
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                },
                data,
                timeout,
            )
            .map_err(map_transfer_error)
    }

    fn bulk_read(&self, endpoint: u8, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let interface = self.interface_for(endpoint)?;
        let future = interface.bulk_in(endpoint, RequestBuffer::new(len));
        match block_on_deadline(future, timeout) {
            // Timeout is end-of-transfer for the synchronous read path,
            // not an error; dropping the future cancelled the transfer.
            None => Ok(Vec::new()),
            Some(Completion { data, status }) => match status {
                Ok(()) => Ok(data),
                Err(e) => Err(map_transfer_error(e)),
            },
        }
    }

    fn bulk_write(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let interface = self.interface_for(endpoint)?;
        let future = interface.bulk_out(endpoint, data.to_vec());
        match block_on_deadline(future, timeout) {
            None => Err(Error::WriteTimeout),
            Some(completion) => match completion.status {
                Ok(()) => Ok(completion.data.actual_length()),
                Err(e) => Err(map_transfer_error(e)),
            },
        }
    }

    fn submit_read(&self, slot: usize, len: usize) -> Result<()> {
        {
            let mut guard = self.read_state.lock();
            if guard.is_none() {
                let interface = self.interface_for(ENDPOINT_STREAM_IN)?;
                *guard = Some(ReadState {
                    queue: interface.bulk_in_queue(ENDPOINT_STREAM_IN),
                    tokens: VecDeque::new(),
                });
            }
            let state = guard.as_mut().expect("read state just initialized");
            state.queue.submit(RequestBuffer::new(len));
            state.tokens.push_back(slot);
        }
        self.notify_waiter();
        Ok(())
    }

    fn cancel_reads(&self) {
        if let Some(state) = self.read_state.lock().as_mut() {
            state.queue.cancel_all();
        }
        self.notify_waiter();
    }

    fn wait_completion(&self, timeout: Duration) -> Option<BulkCompletion> {
        let deadline = Instant::now() + timeout;
        *self.waiter.lock() = Some(thread::current());
        let waker = current_thread_waker();

        let result = loop {
            if self.woken.swap(false, Ordering::AcqRel) {
                break None;
            }
            {
                let mut guard = self.read_state.lock();
                if let Some(state) = guard.as_mut() {
                    if state.queue.pending() > 0 {
                        let mut cx = TaskContext::from_waker(&waker);
                        let mut next = pin!(state.queue.next_complete());
                        if let Poll::Ready(completion) = next.as_mut().poll(&mut cx) {
                            let slot = state.tokens.pop_front().unwrap_or_default();
                            break Some(BulkCompletion {
                                slot,
                                status: map_completion_status(completion.status),
                                data: completion.data,
                            });
                        }
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            thread::park_timeout(deadline - now);
        };

        *self.waiter.lock() = None;
        result
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        self.notify_waiter();
    }

    fn events_mutex(&self) -> &Mutex<()> {
        &self.events
    }

    fn reset(&self) -> Result<()> {
        self.device.reset().map_err(usb_error)
    }
}

/// Driver opening devices through `nusb`.
#[derive(Clone, Copy, Default)]
pub struct NusbDriver;

impl NusbDriver {
    /// Create the driver.
    pub fn new() -> Self {
        Self
    }
}

impl UsbDriver for NusbDriver {
    fn open(&self, vendor_id: u16, product_id: u16) -> Result<Arc<dyn UsbBackend>> {
        let info = nusb::list_devices()
            .map_err(usb_error)?
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or(Error::DeviceNotFound {
                vendor_id,
                product_id,
            })?;
        let device = info.open().map_err(usb_error)?;
        Ok(Arc::new(NusbBackend::new(device)))
    }
}
