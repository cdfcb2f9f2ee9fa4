//! Scripted mock backend for hardware-free testing
//!
//! The mock counts every submitted, completed and cancelled transfer so
//! tests can assert the engine's teardown guarantees (no callback after
//! destruction begins, no resources released while transfers are live).
//! Reads complete only when the test script says so, via
//! [`MockBackend::complete_next_read`] / [`MockBackend::fail_next_read`].

use super::backend::{BulkCompletion, TransferStatus, UsbBackend, UsbDriver};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One recorded control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlLogEntry {
    /// Vendor request code
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// Payload written (empty for reads)
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MockInner {
    claimed: Vec<u8>,
    claim_error: Option<u8>,
    control_log: Vec<ControlLogEntry>,
    control_read_data: VecDeque<Vec<u8>>,
    bulk_read_data: VecDeque<Result<Vec<u8>>>,
    writes: Vec<(u8, Vec<u8>)>,
    write_error: bool,
    submit_error: bool,
    pending: VecDeque<(usize, usize)>,
    completions: VecDeque<BulkCompletion>,
    woken: bool,
    submitted_total: usize,
}

/// Scripted counting double of the USB hardware.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<Mutex<MockInner>>,
    cond: Arc<Condvar>,
    events: Arc<Mutex<()>>,
}

impl MockBackend {
    /// Create a new mock backend with an empty script.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner::default())),
            cond: Arc::new(Condvar::new()),
            events: Arc::new(Mutex::new(())),
        }
    }

    /// Script a control-read response (consumed in order).
    pub fn push_control_read(&self, data: &[u8]) {
        self.inner.lock().control_read_data.push_back(data.to_vec());
    }

    /// Script a synchronous bulk-read result (consumed in order).
    pub fn push_bulk_read(&self, result: Result<Vec<u8>>) {
        self.inner.lock().bulk_read_data.push_back(result);
    }

    /// Make every subsequent bulk write fail.
    pub fn set_write_error(&self, fail: bool) {
        self.inner.lock().write_error = fail;
    }

    /// Make every subsequent `submit_read` fail (forces slot retirement).
    pub fn set_submit_error(&self, fail: bool) {
        self.inner.lock().submit_error = fail;
    }

    /// Make `claim_interface` fail for the given interface.
    pub fn set_claim_error(&self, interface: u8) {
        self.inner.lock().claim_error = Some(interface);
    }

    /// Complete the oldest in-flight read with `data`.
    ///
    /// Panics if nothing is in flight: a test driving the pipeline with
    /// more batches than submitted slots is a bug in the test.
    pub fn complete_next_read(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        let (slot, len) = inner
            .pending
            .pop_front()
            .expect("no in-flight read to complete");
        let mut data = data.to_vec();
        data.truncate(len);
        inner.completions.push_back(BulkCompletion {
            slot,
            status: TransferStatus::Completed,
            data,
        });
        self.cond.notify_all();
    }

    /// Fail the oldest in-flight read with `status`.
    pub fn fail_next_read(&self, status: TransferStatus) {
        let mut inner = self.inner.lock();
        let (slot, _) = inner
            .pending
            .pop_front()
            .expect("no in-flight read to fail");
        inner.completions.push_back(BulkCompletion {
            slot,
            status,
            data: Vec::new(),
        });
        self.cond.notify_all();
    }

    /// Number of reads currently in flight at the "hardware".
    pub fn pending_reads(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Total reads ever submitted.
    pub fn submitted_total(&self) -> usize {
        self.inner.lock().submitted_total
    }

    /// All bulk writes recorded so far, as (endpoint, bytes) pairs.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.lock().writes.clone()
    }

    /// All control transfers recorded so far.
    pub fn control_log(&self) -> Vec<ControlLogEntry> {
        self.inner.lock().control_log.clone()
    }

    /// Interfaces claimed so far.
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.inner.lock().claimed.clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBackend for MockBackend {
    fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.claim_error == Some(interface) {
            return Err(Error::InterfaceClaimFailed(interface));
        }
        inner.claimed.push(interface);
        Ok(())
    }

    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.control_log.push(ControlLogEntry {
            request,
            value,
            index,
            data: Vec::new(),
        });
        let data = inner.control_read_data.pop_front().unwrap_or_default();
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize> {
        self.inner.lock().control_log.push(ControlLogEntry {
            request,
            value,
            index,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn bulk_read(&self, _endpoint: u8, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        let scripted = self.inner.lock().bulk_read_data.pop_front();
        match scripted {
            Some(Ok(mut data)) => {
                data.truncate(len);
                Ok(data)
            }
            Some(Err(e)) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    fn bulk_write(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.write_error {
            return Err(Error::UsbIoFailed("mock write failure".into()));
        }
        inner.writes.push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn submit_read(&self, slot: usize, len: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.submit_error {
            return Err(Error::UsbIoFailed("mock submit failure".into()));
        }
        inner.pending.push_back((slot, len));
        inner.submitted_total += 1;
        Ok(())
    }

    fn cancel_reads(&self) {
        let mut inner = self.inner.lock();
        while let Some((slot, _)) = inner.pending.pop_front() {
            inner.completions.push_back(BulkCompletion {
                slot,
                status: TransferStatus::Cancelled,
                data: Vec::new(),
            });
        }
        self.cond.notify_all();
    }

    fn wait_completion(&self, timeout: Duration) -> Option<BulkCompletion> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(completion) = inner.completions.pop_front() {
                return Some(completion);
            }
            if inner.woken {
                inner.woken = false;
                return None;
            }
            if self.cond.wait_for(&mut inner, timeout).timed_out() {
                return None;
            }
        }
    }

    fn wake(&self) {
        self.inner.lock().woken = true;
        self.cond.notify_all();
    }

    fn events_mutex(&self) -> &Mutex<()> {
        &self.events
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }
}

/// Driver double mapping (vendor, product) ids to mock backends.
#[derive(Clone, Default)]
pub struct MockDriver {
    devices: Arc<Mutex<HashMap<(u16, u16), MockBackend>>>,
}

impl MockDriver {
    /// Create an empty driver (every open fails with `DeviceNotFound`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a mock backend under the given ids.
    pub fn attach(&self, vendor_id: u16, product_id: u16, backend: MockBackend) {
        self.devices
            .lock()
            .insert((vendor_id, product_id), backend);
    }
}

impl UsbDriver for MockDriver {
    fn open(&self, vendor_id: u16, product_id: u16) -> Result<Arc<dyn UsbBackend>> {
        match self.devices.lock().get(&(vendor_id, product_id)) {
            Some(backend) => Ok(Arc::new(backend.clone())),
            None => Err(Error::DeviceNotFound {
                vendor_id,
                product_id,
            }),
        }
    }
}
