//! Wire protocol shared with the peripheral firmware
//!
//! Everything in here is a fixed byte layout agreed with the boards:
//! the framed packet stream multiplexed over the bulk-in endpoint
//! ([`packet`]), the small checksummed configuration/status records
//! exchanged over the command path ([`records`]), and the checksum
//! algorithms both sides compute ([`checksum`]).
//!
//! All multi-byte fields are little-endian. Bit-packed records are
//! encoded and decoded with explicit shifts and masks so the layout is
//! identical on every host platform.

pub mod checksum;
pub mod packet;
pub mod records;

pub use packet::Packet;
pub use records::{CameraMessage, DeviceType, HubMessage, ImageInfo};
