//! Device handle and control-plane operations

use super::backend::{UsbBackend, UsbDriver};
use super::backend_nusb::NusbDriver;
use super::device_config::DeviceConfig;
use super::reader::ReaderShared;
use super::{ENDPOINT_DATA_OUT, ENDPOINT_HANDSHAKE_OUT, ENDPOINT_STREAM_IN};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Vendor request: read (wValue 1) / write (wValue 0) the config block
const REQUEST_CONFIG: u8 = 0xCF;
/// Vendor request: GPIO control, wValue 2 = directions, 1 = levels
const REQUEST_GPIO: u8 = 0x02;
const GPIO_VALUE_DIRECTIONS: u16 = 2;
const GPIO_VALUE_LEVELS: u16 = 1;

/// Default timeout for synchronous control/bulk operations
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout for the blocking asynchronous write path
const WRITE_ASYNC_TIMEOUT: Duration = Duration::from_secs(5);
/// Default synchronous bulk read size
const DEFAULT_READ_SIZE: usize = 32 * 1024;

/// Fixed vendor handshake switching the bridge into streaming mode
const STREAM_HANDSHAKE: [u8; 20] = [
    0x00, 0x00, 0x00, 0x00, 0x82, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

/// USB driver context, the factory for device handles.
///
/// [`Context::new`] uses the production `nusb` driver; tests inject a
/// [`MockDriver`](super::mock::MockDriver) with [`Context::with_driver`].
#[derive(Clone)]
pub struct Context {
    driver: Arc<dyn UsbDriver>,
}

impl Context {
    /// Context backed by the real USB stack.
    pub fn new() -> Self {
        Self {
            driver: Arc::new(NusbDriver::new()),
        }
    }

    /// Context backed by a caller-supplied driver.
    pub fn with_driver(driver: Arc<dyn UsbDriver>) -> Self {
        Self { driver }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

struct DeviceIo {
    backend: Arc<dyn UsbBackend>,
    timeout: Duration,
    started: bool,
}

/// One opened FIFO bridge device.
///
/// Every operation acquires the live handle through a scoped lock: it
/// either sees a valid handle or fails with `Error::DeviceClosed`, never
/// a dangling one. A synchronous operation in flight when [`close`] is
/// called finishes first; teardown waits on the same lock.
///
/// [`close`]: Device::close
pub struct Device {
    io: Mutex<Option<DeviceIo>>,
    sink: Mutex<Option<Arc<ReaderShared>>>,
}

impl Device {
    /// Open the first attached device matching `vendor_id:product_id`.
    pub fn open(context: &Context, vendor_id: u16, product_id: u16) -> Result<Self> {
        let backend = context.driver.open(vendor_id, product_id)?;
        log::info!("opened usb device {:04x}:{:04x}", vendor_id, product_id);
        Ok(Self {
            io: Mutex::new(Some(DeviceIo {
                backend,
                timeout: DEFAULT_IO_TIMEOUT,
                started: false,
            })),
            sink: Mutex::new(None),
        })
    }

    /// Close the device handle. Idempotent; any later operation fails
    /// with `Error::DeviceClosed`.
    pub fn close(&self) {
        log::info!("device close begin");
        drop(self.io.lock().take());
        log::info!("device closed");
    }

    /// Whether the handle is still open.
    pub fn is_open(&self) -> bool {
        self.io.lock().is_some()
    }

    fn with_io<T>(&self, f: impl FnOnce(&mut DeviceIo) -> Result<T>) -> Result<T> {
        let mut guard = self.io.lock();
        match guard.as_mut() {
            Some(io) => f(io),
            None => Err(Error::DeviceClosed),
        }
    }

    /// Clone the backend handle without holding the device lock.
    pub(crate) fn backend(&self) -> Result<Arc<dyn UsbBackend>> {
        self.with_io(|io| Ok(Arc::clone(&io.backend)))
    }

    pub(crate) fn set_completion_sink(&self, sink: Arc<ReaderShared>) -> Result<()> {
        let mut guard = self.sink.lock();
        if guard.is_some() {
            return Err(Error::InvalidParameter(
                "device already has an active reader".into(),
            ));
        }
        *guard = Some(sink);
        Ok(())
    }

    pub(crate) fn clear_completion_sink(&self) {
        self.sink.lock().take();
    }

    pub(crate) fn completion_sink(&self) -> Option<Arc<ReaderShared>> {
        self.sink.lock().clone()
    }

    /// Switch the bridge into streaming mode. Idempotent.
    ///
    /// Claims both FIFO interfaces and sends the vendor handshake on the
    /// command endpoint.
    pub fn start(&self) -> Result<()> {
        self.with_io(|io| {
            if io.started {
                return Ok(());
            }
            io.backend.claim_interface(0)?;
            io.backend.claim_interface(1)?;
            let written =
                io.backend
                    .bulk_write(ENDPOINT_HANDSHAKE_OUT, &STREAM_HANDSHAKE, io.timeout)?;
            if written != STREAM_HANDSHAKE.len() {
                return Err(Error::StreamInitFailed);
            }
            io.started = true;
            log::info!("streaming mode started");
            Ok(())
        })
    }

    /// Read the bridge configuration block.
    pub fn read_config(&self) -> Result<DeviceConfig> {
        self.with_io(|io| {
            let mut block = [0u8; DeviceConfig::SIZE];
            let n = io
                .backend
                .control_read(REQUEST_CONFIG, 1, 0, &mut block, io.timeout)?;
            if n != DeviceConfig::SIZE {
                return Err(Error::ConfigIoFailed(format!(
                    "short config read: {} of {} bytes",
                    n,
                    DeviceConfig::SIZE
                )));
            }
            DeviceConfig::decode(&block)
        })
    }

    /// Write the bridge configuration block.
    pub fn write_config(&self, config: &DeviceConfig) -> Result<()> {
        self.with_io(|io| {
            let block = config.encode();
            let n = io
                .backend
                .control_write(REQUEST_CONFIG, 0, 0, &block, io.timeout)?;
            if n != DeviceConfig::SIZE {
                return Err(Error::ConfigIoFailed(format!(
                    "short config write: {} of {} bytes",
                    n,
                    DeviceConfig::SIZE
                )));
            }
            Ok(())
        })
    }

    fn set_gpios(&self, value_selector: u16, mask: u8, bits: u8) -> Result<()> {
        self.with_io(|io| {
            let encoded = encode_gpios(mask, bits).to_le_bytes();
            let n = io
                .backend
                .control_write(REQUEST_GPIO, value_selector, 0, &encoded, io.timeout)?;
            if n != encoded.len() {
                return Err(Error::UsbIoFailed(format!(
                    "short gpio transfer: {} of {} bytes",
                    n,
                    encoded.len()
                )));
            }
            Ok(())
        })
    }

    /// Set GPIO pin directions for the pins selected by `mask`.
    pub fn set_gpio_directions(&self, mask: u8, directions: u8) -> Result<()> {
        self.set_gpios(GPIO_VALUE_DIRECTIONS, mask, directions)
    }

    /// Set GPIO output levels for the pins selected by `mask`.
    pub fn set_gpio_levels(&self, mask: u8, levels: u8) -> Result<()> {
        self.set_gpios(GPIO_VALUE_LEVELS, mask, levels)
    }

    /// Set the direction of a single GPIO pin.
    pub fn set_gpio_direction(&self, pin: u8, output: bool) -> Result<()> {
        self.set_gpio_directions(1 << pin, u8::from(output) << pin)
    }

    /// Set the level of a single GPIO pin.
    pub fn set_gpio_level(&self, pin: u8, high: bool) -> Result<()> {
        self.set_gpio_levels(1 << pin, u8::from(high) << pin)
    }

    /// Synchronous bulk read with default size and timeout.
    ///
    /// Returns fewer bytes than requested only at the end of a transfer;
    /// that is not an error.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.read_with(DEFAULT_READ_SIZE, None)
    }

    /// Synchronous bulk read with explicit size and optional timeout.
    pub fn read_with(&self, count: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.with_io(|io| {
            io.backend
                .bulk_read(ENDPOINT_STREAM_IN, count, timeout.unwrap_or(io.timeout))
        })
    }

    /// Synchronous bulk write on the data endpoint.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.with_io(|io| {
            let written = io.backend.bulk_write(ENDPOINT_DATA_OUT, data, io.timeout)?;
            if written != data.len() {
                return Err(Error::UsbIoFailed(format!(
                    "short bulk write: {} of {} bytes",
                    written,
                    data.len()
                )));
            }
            Ok(())
        })
    }

    /// Asynchronous bulk write.
    ///
    /// Blocks the *calling* thread (never the event loop) until the
    /// transfer completes or times out. Does not hold the device lock
    /// while blocked, so control-plane operations stay available.
    pub fn write_async(&self, data: &[u8]) -> Result<()> {
        let backend = self.backend()?;
        let written = backend.bulk_write(ENDPOINT_DATA_OUT, data, WRITE_ASYNC_TIMEOUT)?;
        if written != data.len() {
            return Err(Error::UsbIoFailed(format!(
                "short async write: {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    }

    /// Reset the device port.
    pub fn reset(&self) -> Result<()> {
        self.with_io(|io| io.backend.reset())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bit-pack up to 2 GPIO pins into one control word.
///
/// 3 bits per pin slot: the pin's value bit at `pin * 3` and an enable
/// bit at `pin * 3 + 2`, for every pin selected in `mask`.
fn encode_gpios(mask: u8, value: u8) -> u16 {
    let mut encoded: u16 = 0;
    for pin in 0..2 {
        if (mask >> pin) & 1 != 0 {
            encoded |= u16::from((value >> pin) & 1) << (pin * 3);
            encoded |= 4 << (pin * 3);
        }
    }
    encoded
}
