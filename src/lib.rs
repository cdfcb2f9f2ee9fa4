//! SparshIO - Host-side communication stack for a tactile/thermal sensor rig
//!
//! Peripheral boards (thermal cameras, tactile sensors) stream data
//! over a custom packet protocol carried across a SuperSpeed USB bulk
//! link to a hub controller. This crate is the host side of that link:
//!
//! - [`usb`]: the asynchronous transfer engine (device control, event
//!   loop, continuous read pipeline, rate-limited writer)
//! - [`reassembler`]: wire-level framing and per-channel packet
//!   reassembly with a lock-free-dispatch listener fabric
//! - [`hub`]: channel-indexed pub/sub routing of packets to [`Node`]s
//! - [`camera`]: image frame reconstruction from a camera channel
//! - [`protocol`]: the shared wire records and checksums
//!
//! ## Typical wiring
//!
//! ```no_run
//! use sparsh_io::usb::{Context, Device, EventLoop};
//! use sparsh_io::{Camera, Hub, Reassembler, RigConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> sparsh_io::Result<()> {
//! let config = RigConfig::default();
//! let context = Context::new();
//! let device = Arc::new(Device::open(
//!     &context,
//!     config.device.vendor_id,
//!     config.device.product_id,
//! )?);
//! device.start()?;
//!
//! let _events = EventLoop::new(Arc::clone(&device))?;
//! let engine = Arc::new(Reassembler::new(
//!     Arc::clone(&device),
//!     config.transport.buffer_count,
//!     config.transport.buffer_size,
//!     config.reassembly,
//! )?);
//!
//! let hub = Hub::new(Arc::clone(&engine))?;
//! hub.connect(
//!     4,
//!     Camera::shared(|frame| {
//!         if frame.valid {
//!             println!("{}x{} @ {}C", frame.width, frame.height, frame.temperature);
//!         }
//!     }),
//! );
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod reassembler;
pub mod usb;

// Re-export commonly used types
pub use camera::{Camera, ImageFrame};
pub use config::RigConfig;
pub use error::{Error, Result};
pub use hub::{FnNode, Hub, Node, SharedNode};
pub use protocol::{CameraMessage, HubMessage, ImageInfo, Packet};
pub use reassembler::{ListenerToken, Reassembler, ReassemblyLimits};
