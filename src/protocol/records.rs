//! Fixed-layout control and status records
//!
//! These records travel between host and peripheral firmware as raw
//! little-endian byte blocks. The firmware packs them with C bit-fields;
//! on the host they are encoded and decoded exclusively with shifts and
//! masks so the byte layout is identical regardless of how the target
//! compiler orders bit-fields.
//!
//! `CameraMessage` and `ImageInfo` end in a 16-bit checksum computed
//! over the whole record with the checksum field zeroed (see
//! [`checksum::record_checksum`]).

use super::checksum::record_checksum;

/// Peripheral device type codes reported on the hub's status channel.
pub struct DeviceType;

impl DeviceType {
    /// Port is empty
    pub const NONE: u8 = 0;
    /// Thermal camera module
    pub const CAMERA: u8 = 1;
    /// Tactile sensor module
    pub const TACTILE: u8 = 2;
}

/// Hub port configuration record (4 bytes on the wire).
///
/// Layout: `frametime:20 | port:3 | type:2`, upper 7 bits unused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubMessage {
    /// Frame period in device ticks
    pub frametime: u32,
    /// Hub port index
    pub port: u8,
    /// Expected device type on the port, see [`DeviceType`]
    pub device_type: u8,
}

impl HubMessage {
    /// Encoded size in bytes
    pub const SIZE: usize = 4;

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let word = (self.frametime & 0xF_FFFF)
            | (u32::from(self.port & 0x7) << 20)
            | (u32::from(self.device_type & 0x3) << 23);
        word.to_le_bytes()
    }

    /// Decode from wire bytes; `None` if `bytes` is too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let word = u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?);
        Some(Self {
            frametime: word & 0xF_FFFF,
            port: ((word >> 20) & 0x7) as u8,
            device_type: ((word >> 23) & 0x3) as u8,
        })
    }
}

/// Camera acquisition configuration record (24 bytes on the wire).
///
/// Sent by the host (via the rate-limited writer path) to program
/// exposure, gains, geometry and frame timing for one camera module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraMessage {
    /// Record magic, [`CameraMessage::MAGIC`]
    pub magic: u16,
    /// Shutter (exposure) in line periods
    pub shutter: u16,
    /// Frame start delay in microseconds (20 bits)
    pub delay: u32,
    /// Analog gain, red channel (6 bits)
    pub analog_gain_red: u8,
    /// Analog gain, green channel (6 bits)
    pub analog_gain_green: u8,
    /// Analog gain, blue channel (6 bits)
    pub analog_gain_blue: u8,
    /// Readout window left edge in sensor columns (12 bits)
    pub left: u16,
    /// Readout window width in sensor columns (12 bits)
    pub width: u16,
    /// 2x analog gain multiplier enable
    pub double_gain: bool,
    /// Digital gain code, gain = 1 + code/8 (7 bits)
    pub digital_gain: u8,
    /// Request timestamp echoed back in the matching [`ImageInfo`]
    pub timestamp: u32,
    /// Readout window height in sensor rows (11 bits)
    pub height: u16,
    /// Black level offset (12 bits)
    pub blacklevel: u16,
    /// Row/column skip code, factor = code + 1 (3 bits)
    pub skip: u8,
    /// Binning code (2 bits)
    pub binning: u8,
    /// Readout window top edge in sensor rows (11 bits)
    pub top: u16,
    /// Trailing record checksum
    pub checksum: u16,
}

impl Default for CameraMessage {
    fn default() -> Self {
        Self {
            magic: Self::MAGIC,
            shutter: 0,
            delay: 0,
            analog_gain_red: 0,
            analog_gain_green: 0,
            analog_gain_blue: 0,
            left: 0,
            width: 0,
            double_gain: false,
            digital_gain: 0,
            timestamp: 0,
            height: 0,
            blacklevel: 0,
            skip: 0,
            binning: 0,
            top: 0,
            checksum: 0,
        }
    }
}

impl CameraMessage {
    /// Record magic
    pub const MAGIC: u16 = 0xCA62;
    /// Encoded size in bytes
    pub const SIZE: usize = 24;

    /// Encode to wire bytes. The stored checksum is emitted as-is; use
    /// [`CameraMessage::finalize`] first to stamp a valid one.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.magic.to_le_bytes());
        out[2..4].copy_from_slice(&self.shutter.to_le_bytes());

        let w1 = (self.delay & 0xF_FFFF)
            | (u32::from(self.analog_gain_red & 0x3F) << 20)
            | (u32::from(self.analog_gain_green & 0x3F) << 26);
        out[4..8].copy_from_slice(&w1.to_le_bytes());

        let w2 = u32::from(self.left & 0xFFF)
            | (u32::from(self.width & 0xFFF) << 12)
            | (u32::from(self.double_gain) << 24)
            | (u32::from(self.digital_gain & 0x7F) << 25);
        out[8..12].copy_from_slice(&w2.to_le_bytes());

        out[12..16].copy_from_slice(&self.timestamp.to_le_bytes());

        let w4 = u32::from(self.height & 0x7FF)
            | (u32::from(self.blacklevel & 0xFFF) << 11)
            | (u32::from(self.analog_gain_blue & 0x3F) << 23);
        out[16..20].copy_from_slice(&w4.to_le_bytes());

        let w5 = u32::from(self.skip & 0x7)
            | (u32::from(self.binning & 0x3) << 3)
            | (u32::from(self.top & 0x7FF) << 5)
            | (u32::from(self.checksum) << 16);
        out[20..24].copy_from_slice(&w5.to_le_bytes());
        out
    }

    /// Decode from wire bytes; `None` if `bytes` is too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let b: &[u8; Self::SIZE] = bytes.get(..Self::SIZE)?.try_into().ok()?;
        let w1 = u32::from_le_bytes(b[4..8].try_into().unwrap());
        let w2 = u32::from_le_bytes(b[8..12].try_into().unwrap());
        let w4 = u32::from_le_bytes(b[16..20].try_into().unwrap());
        let w5 = u32::from_le_bytes(b[20..24].try_into().unwrap());
        Some(Self {
            magic: u16::from_le_bytes(b[0..2].try_into().unwrap()),
            shutter: u16::from_le_bytes(b[2..4].try_into().unwrap()),
            delay: w1 & 0xF_FFFF,
            analog_gain_red: ((w1 >> 20) & 0x3F) as u8,
            analog_gain_green: ((w1 >> 26) & 0x3F) as u8,
            left: (w2 & 0xFFF) as u16,
            width: ((w2 >> 12) & 0xFFF) as u16,
            double_gain: (w2 >> 24) & 1 != 0,
            digital_gain: ((w2 >> 25) & 0x7F) as u8,
            timestamp: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            height: (w4 & 0x7FF) as u16,
            blacklevel: ((w4 >> 11) & 0xFFF) as u16,
            analog_gain_blue: ((w4 >> 23) & 0x3F) as u8,
            skip: (w5 & 0x7) as u8,
            binning: ((w5 >> 3) & 0x3) as u8,
            top: ((w5 >> 5) & 0x7FF) as u16,
            checksum: (w5 >> 16) as u16,
        })
    }

    /// Stamp the record checksum.
    pub fn finalize(&mut self) {
        self.checksum = 0;
        self.checksum = record_checksum(&self.encode());
    }

    /// Verify the checksum of an encoded record.
    ///
    /// Operates on the raw bytes so corruption in reserved bits is
    /// caught too (the decoded struct drops them).
    pub fn verify(bytes: &[u8]) -> bool {
        let Some(block) = bytes.get(..Self::SIZE) else {
            return false;
        };
        let stored = u16::from_le_bytes([block[22], block[23]]);
        let mut zeroed = [0u8; Self::SIZE];
        zeroed.copy_from_slice(block);
        zeroed[22] = 0;
        zeroed[23] = 0;
        record_checksum(&zeroed) == stored
    }
}

/// Image frame announcement record (16 bytes on the wire).
///
/// Precedes every image frame on a camera channel and declares the
/// geometry and timing of the payload packets that follow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Record magic, [`ImageInfo::MAGIC`]
    pub magic: u16,
    /// Readout window left edge in sensor columns
    pub left: u16,
    /// Request timestamp from the originating [`CameraMessage`]
    pub timestamp: u32,
    /// Frame width in sensor columns, before skip (12 bits)
    pub width: u16,
    /// Readout window top edge in sensor rows (11 bits)
    pub top: u16,
    /// Raw 6-bit sensor temperature code
    pub temperature: u8,
    /// Skip code, subsampling factor = code + 1 (3 bits)
    pub skip: u8,
    /// Frame height in sensor rows, before skip (11 bits)
    pub height: u16,
    /// Trailing record checksum
    pub checksum: u16,
}

impl ImageInfo {
    /// Record magic
    pub const MAGIC: u16 = 0x8C53;
    /// Encoded size in bytes
    pub const SIZE: usize = 16;

    /// Encode to wire bytes. The stored checksum is emitted as-is; use
    /// [`ImageInfo::finalize`] first to stamp a valid one.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.magic.to_le_bytes());
        out[2..4].copy_from_slice(&self.left.to_le_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        let w2 = u32::from(self.width & 0xFFF)
            | (u32::from(self.top & 0x7FF) << 12)
            | (u32::from(self.temperature & 0x3F) << 23)
            | (u32::from(self.skip & 0x7) << 29);
        out[8..12].copy_from_slice(&w2.to_le_bytes());
        let h = self.height & 0x7FF;
        out[12..14].copy_from_slice(&h.to_le_bytes());
        out[14..16].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    /// Decode from wire bytes; `None` if `bytes` is too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let b: &[u8; Self::SIZE] = bytes.get(..Self::SIZE)?.try_into().ok()?;
        let w2 = u32::from_le_bytes(b[8..12].try_into().unwrap());
        Some(Self {
            magic: u16::from_le_bytes(b[0..2].try_into().unwrap()),
            left: u16::from_le_bytes(b[2..4].try_into().unwrap()),
            timestamp: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            width: (w2 & 0xFFF) as u16,
            top: ((w2 >> 12) & 0x7FF) as u16,
            temperature: ((w2 >> 23) & 0x3F) as u8,
            skip: ((w2 >> 29) & 0x7) as u8,
            height: u16::from_le_bytes(b[12..14].try_into().unwrap()) & 0x7FF,
            checksum: u16::from_le_bytes(b[14..16].try_into().unwrap()),
        })
    }

    /// Stamp the record checksum.
    pub fn finalize(&mut self) {
        self.checksum = 0;
        self.checksum = record_checksum(&self.encode());
    }

    /// Verify the checksum of an encoded record.
    ///
    /// Operates on the raw bytes so corruption in reserved bits is
    /// caught too (the decoded struct drops them).
    pub fn verify(bytes: &[u8]) -> bool {
        let Some(block) = bytes.get(..Self::SIZE) else {
            return false;
        };
        let stored = u16::from_le_bytes([block[14], block[15]]);
        let mut zeroed = [0u8; Self::SIZE];
        zeroed.copy_from_slice(block);
        zeroed[14] = 0;
        zeroed[15] = 0;
        record_checksum(&zeroed) == stored
    }
}
