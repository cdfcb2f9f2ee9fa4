//! USB transfer engine
//!
//! This module owns all hardware I/O for the rig's SuperSpeed FIFO
//! bridge:
//!
//! - [`Context`] / [`Device`]: open-by-id, configuration and GPIO
//!   control transfers, synchronous bulk I/O and the streaming-mode
//!   handshake. All access to the live handle goes through a scoped
//!   guard that fails fast with [`Error::DeviceClosed`](crate::Error)
//!   once the device is closed.
//! - [`EventLoop`]: the single thread that drives asynchronous transfer
//!   completions for one opened device.
//! - [`Reader`]: the continuously-resubmitting pipeline of bulk-in
//!   transfers feeding raw batches to a callback.
//! - [`Writer`]: a background thread sending caller-produced messages
//!   at a bounded rate.
//!
//! Hardware access is abstracted behind the [`backend::UsbBackend`]
//! trait so the engine's concurrency properties can be exercised
//! against a scripted mock ([`mock`]); the production implementation
//! ([`backend_nusb`]) drives real transfers through `nusb`.

pub mod backend;
pub mod backend_nusb;
pub mod device;
pub mod device_config;
pub mod event_loop;
pub mod mock;
mod poll;
pub mod reader;
pub mod writer;

pub use backend::{BulkCompletion, TransferStatus, UsbBackend, UsbDriver};
pub use device::{Context, Device};
pub use device_config::{ChannelConfig, DeviceConfig, FifoClock, FifoMode, StringDescriptors};
pub use event_loop::EventLoop;
pub use mock::{MockBackend, MockDriver};
pub use reader::Reader;
pub use writer::Writer;

/// Bulk-out endpoint carrying the streaming-mode handshake
pub const ENDPOINT_HANDSHAKE_OUT: u8 = 0x01;
/// Bulk-out endpoint carrying host-to-rig data
pub const ENDPOINT_DATA_OUT: u8 = 0x02;
/// Bulk-in endpoint carrying the multiplexed packet stream
pub const ENDPOINT_STREAM_IN: u8 = 0x82;
