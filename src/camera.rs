//! Thermal camera frame reconstruction
//!
//! A camera channel carries two packet shapes: a small checksummed
//! [`ImageInfo`] record announcing a frame's geometry, followed by a
//! run of fixed-size payload packets carrying 64 pixel bytes each plus
//! a tail word with a running packet index and a 12-bit checksum.
//!
//! The decoder is deliberately forgiving: any anomaly (checksum
//! mismatch, lost packet, bad geometry, wrong payload size) clears the
//! frame's valid flag and is logged, but accumulation continues where
//! possible so partial frames remain available for diagnostics. The
//! valid flag is re-armed only by the next good info record.

use crate::hub::{Node, SharedNode};
use crate::protocol::checksum::payload_checksum;
use crate::protocol::{ImageInfo, Packet};
use parking_lot::Mutex;
use std::sync::Arc;

/// Sync magic leading every image payload packet
const PAYLOAD_MAGIC: u32 = 0xBA2F_A166;
/// Total payload packet size: 4-byte magic + 64-byte payload + 4-byte tail
const PAYLOAD_PACKET_SIZE: usize = 72;
/// Pixel bytes per payload packet
const PAYLOAD_SIZE: usize = 64;

/// Geometry sanity bounds for declared frame dimensions
const MIN_DIMENSION: u16 = 2;
const MAX_DIMENSION: u16 = 5000;

/// Maps the sensor's raw 6-bit temperature code to degrees Celsius.
const THERMO_TABLE: [i16; 64] = [
    -58, -56, -54, -52, -45, -44, -43, -42, -41, -40, -39, -38, -37, -36, -30, -20, -10, -4, 0, 4,
    10, 21, 22, 23, 24, 25, 26, 27, 28, 29, 40, 50, 60, 70, 76, 80, 81, 82, 83, 84, 85, 86, 87,
    88, 89, 95, 96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 116, 120, 124, 128,
    132,
];

/// One reconstructed image frame.
#[derive(Debug, Clone, Default)]
pub struct ImageFrame {
    /// Row-major pixel bytes, `width * height` long
    pub data: Vec<u8>,
    /// Readout window top edge in sensor rows
    pub top: usize,
    /// Readout window left edge in sensor columns
    pub left: usize,
    /// Frame width in pixels (already divided by skip)
    pub width: usize,
    /// Frame height in pixels (already divided by skip)
    pub height: usize,
    /// Subsampling factor applied by the sensor
    pub skip: u32,
    /// Sensor temperature in degrees Celsius
    pub temperature: i16,
    /// Request timestamp echoed from the originating configuration
    pub request_timestamp: u32,
    /// Channel the frame arrived on
    pub channel: u16,
    /// False if any loss or corruption was seen during accumulation
    pub valid: bool,
}

/// Stateful frame decoder for one camera channel.
///
/// Connect it to the channel via a [`Hub`](crate::hub::Hub); `process`
/// only ever runs on the parsing thread, so the accumulator needs no
/// internal locking beyond the shared-node mutex.
pub struct Camera {
    frame: ImageFrame,
    prev_index: u32,
    frame_started: bool,
    callback: Box<dyn FnMut(&ImageFrame) + Send>,
}

impl Camera {
    /// Create a decoder delivering completed frames to `callback`.
    ///
    /// The callback receives invalid frames too; check
    /// [`ImageFrame::valid`] before trusting the pixels.
    pub fn new(callback: impl FnMut(&ImageFrame) + Send + 'static) -> Self {
        Self {
            frame: ImageFrame::default(),
            prev_index: 0,
            frame_started: false,
            callback: Box::new(callback),
        }
    }

    /// Create a ready-to-connect shared decoder node.
    pub fn shared(callback: impl FnMut(&ImageFrame) + Send + 'static) -> SharedNode {
        Arc::new(Mutex::new(Self::new(callback)))
    }

    fn handle_info(&mut self, packet: &Packet) {
        let Some(info) = ImageInfo::decode(&packet.data) else {
            return;
        };

        if !ImageInfo::verify(&packet.data) {
            log::error!(
                "image info checksum mismatch, raw bytes {:02X?}",
                packet.data
            );
            self.reject_frame();
            return;
        }

        let geometry_ok = (MIN_DIMENSION..MAX_DIMENSION).contains(&info.width)
            && (MIN_DIMENSION..MAX_DIMENSION).contains(&info.height);
        if !geometry_ok {
            log::error!(
                "image info geometry out of range: {}x{}",
                info.width,
                info.height
            );
            self.reject_frame();
            return;
        }

        let skip = u32::from(info.skip) + 1;
        self.frame.skip = skip;
        self.frame.left = usize::from(info.left);
        self.frame.top = usize::from(info.top);
        self.frame.width = usize::from(info.width) / skip as usize;
        self.frame.height = usize::from(info.height) / skip as usize;
        self.frame.channel = packet.channel;
        self.frame.request_timestamp = info.timestamp;
        self.frame.temperature = THERMO_TABLE[usize::from(info.temperature & 0x3F)];
        self.frame.valid = true;
        self.frame.data.clear();
        self.frame
            .data
            .resize(self.frame.width * self.frame.height, 0xFF);

        self.frame_started = true;
        self.prev_index = 0;
    }

    fn reject_frame(&mut self) {
        self.frame.valid = false;
        self.frame_started = false;
        self.prev_index = 0;
    }

    fn handle_payload(&mut self, packet: &Packet) {
        if !self.frame_started {
            return;
        }
        if packet.data.len() != PAYLOAD_PACKET_SIZE {
            log::error!(
                "payload packet size error: {} != {} (flags {:#x})",
                packet.data.len(),
                PAYLOAD_PACKET_SIZE,
                packet.flags
            );
            self.frame.valid = false;
            return;
        }

        let tail = u32::from_le_bytes(packet.data[68..72].try_into().expect("tail word"));
        let index = tail & 0xF_FFFF;
        let expected = payload_checksum(index, &packet.data[4..4 + PAYLOAD_SIZE]);
        let received = tail >> 20;
        if expected != received {
            log::error!(
                "payload checksum error on index {}: {:#05x} != {:#05x}",
                index,
                expected,
                received
            );
            self.frame.valid = false;
            return;
        }

        if index != self.prev_index + 1 {
            log::error!(
                "lost image payload packets between index {} and {}",
                self.prev_index,
                index
            );
            self.frame.valid = false;
        }
        self.prev_index = index;

        match (index as usize).checked_sub(1) {
            Some(offset) if offset * PAYLOAD_SIZE < self.frame.data.len() => {
                let start = offset * PAYLOAD_SIZE;
                let n = PAYLOAD_SIZE.min(self.frame.data.len() - start);
                self.frame.data[start..start + n].copy_from_slice(&packet.data[4..4 + n]);
            }
            _ => {
                log::error!("image payload offset out of range, index {}", index);
            }
        }

        let packet_count =
            1 + (self.frame.width * self.frame.height).div_ceil(PAYLOAD_SIZE) as u32;
        if index + 1 >= packet_count {
            self.frame_started = false;
            deobfuscate(&mut self.frame.data);
            (self.callback)(&self.frame);
            self.frame.data.clear();
        }
    }
}

impl Node for Camera {
    fn process(&mut self, packet: &Packet) {
        if packet.data.len() >= 4 {
            let head = u32::from_le_bytes(packet.data[..4].try_into().expect("head word"));
            if head == PAYLOAD_MAGIC {
                self.handle_payload(packet);
                return;
            }
        }

        if packet.data.len() == ImageInfo::SIZE {
            let magic = u16::from_le_bytes(packet.data[..2].try_into().expect("magic halfword"));
            if magic == ImageInfo::MAGIC {
                self.handle_info(packet);
                return;
            }
        }

        log::error!(
            "unknown packet on camera channel {}: {:02X?}",
            packet.channel,
            &packet.data[..packet.data.len().min(8)]
        );
    }
}

/// Reverse the sensor's pixel whitening in place.
///
/// Byte `i` becomes `(raw[i] - 31 * raw[i-1]) XOR 0xAA`, where `raw` is
/// the pre-transform buffer and `raw[-1]` is 0.
fn deobfuscate(data: &mut [u8]) {
    let mut prev: u8 = 0;
    for byte in data.iter_mut() {
        let next = byte.wrapping_sub(prev.wrapping_mul(31));
        prev = *byte;
        *byte = next ^ 0b1010_1010;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of `deobfuscate`, for building wire-side test vectors.
    fn obfuscate(pixels: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pixels.len());
        let mut prev: u8 = 0;
        for &p in pixels {
            let raw = (p ^ 0b1010_1010).wrapping_add(prev.wrapping_mul(31));
            out.push(raw);
            prev = raw;
        }
        out
    }

    fn info_packet(width: u16, height: u16, skip_code: u8, temperature: u8) -> Packet {
        let mut info = ImageInfo {
            magic: ImageInfo::MAGIC,
            left: 64,
            timestamp: 777,
            width,
            top: 32,
            temperature,
            skip: skip_code,
            height,
            checksum: 0,
        };
        info.finalize();
        Packet {
            channel: 4,
            flags: 0,
            data: info.encode().to_vec(),
        }
    }

    fn payload_packet(index: u32, pixels: &[u8]) -> Packet {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[..pixels.len()].copy_from_slice(pixels);
        let checksum = payload_checksum(index, &payload);
        let tail = (index & 0xF_FFFF) | (checksum << 20);
        let mut data = Vec::with_capacity(PAYLOAD_PACKET_SIZE);
        data.extend_from_slice(&PAYLOAD_MAGIC.to_le_bytes());
        data.extend_from_slice(&payload);
        data.extend_from_slice(&tail.to_le_bytes());
        Packet {
            channel: 4,
            flags: 0,
            data,
        }
    }

    fn collecting_camera() -> (Camera, Arc<Mutex<Vec<ImageFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let camera = Camera::new(move |frame: &ImageFrame| {
            sink.lock().push(frame.clone());
        });
        (camera, frames)
    }

    #[test]
    fn four_by_four_frame_reconstructs() {
        let (mut camera, frames) = collecting_camera();
        let pixels: Vec<u8> = (1u8..=16).collect();
        let wire = obfuscate(&pixels);

        camera.process(&info_packet(4, 4, 0, 18));
        camera.process(&payload_packet(1, &wire));
        // A trailing payload after completion is ignored.
        camera.process(&payload_packet(2, &[0u8; 0]));

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert!(frame.valid);
        assert_eq!((frame.width, frame.height), (4, 4));
        assert_eq!((frame.left, frame.top), (64, 32));
        assert_eq!(frame.skip, 1);
        assert_eq!(frame.channel, 4);
        assert_eq!(frame.request_timestamp, 777);
        assert_eq!(frame.temperature, THERMO_TABLE[18]);
        assert_eq!(frame.data, pixels);
    }

    #[test]
    fn skipped_payload_index_marks_frame_invalid() {
        let (mut camera, frames) = collecting_camera();
        camera.process(&info_packet(4, 4, 0, 0));
        // Index 1 never arrives.
        camera.process(&payload_packet(2, &obfuscate(&[9u8; 16])));

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].valid);
    }

    #[test]
    fn corrupted_payload_checksum_invalidates_without_emitting() {
        let (mut camera, frames) = collecting_camera();
        camera.process(&info_packet(4, 4, 0, 0));

        let mut bad = payload_packet(1, &obfuscate(&[5u8; 16]));
        bad.data[10] ^= 0x01;
        camera.process(&bad);

        assert!(frames.lock().is_empty());
    }

    #[test]
    fn info_checksum_failure_rejects_frame() {
        let (mut camera, frames) = collecting_camera();
        let mut info = info_packet(4, 4, 0, 0);
        info.data[5] ^= 0x80;
        camera.process(&info);
        // Payloads without an armed frame are ignored.
        camera.process(&payload_packet(1, &obfuscate(&[1u8; 16])));
        assert!(frames.lock().is_empty());
    }

    #[test]
    fn out_of_range_geometry_rejects_frame() {
        let (mut camera, frames) = collecting_camera();
        camera.process(&info_packet(1, 4, 0, 0));
        camera.process(&payload_packet(1, &obfuscate(&[1u8; 4])));
        assert!(frames.lock().is_empty());
    }

    #[test]
    fn wrong_payload_size_invalidates_but_decoder_recovers() {
        let (mut camera, frames) = collecting_camera();
        camera.process(&info_packet(4, 4, 0, 0));

        let mut truncated = payload_packet(1, &obfuscate(&[3u8; 16]));
        truncated.data.truncate(40);
        camera.process(&truncated);

        // Next frame decodes cleanly from a fresh info record.
        let pixels: Vec<u8> = (100u8..116).collect();
        camera.process(&info_packet(4, 4, 0, 0));
        camera.process(&payload_packet(1, &obfuscate(&pixels)));

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].valid);
        assert_eq!(frames[0].data, pixels);
    }

    #[test]
    fn skip_factor_scales_dimensions() {
        let (mut camera, frames) = collecting_camera();
        // 8x8 with skip code 1 (factor 2) accumulates as 4x4.
        camera.process(&info_packet(8, 8, 1, 0));
        camera.process(&payload_packet(1, &obfuscate(&[7u8; 16])));

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].width, frames[0].height), (4, 4));
        assert_eq!(frames[0].skip, 2);
    }

    #[test]
    fn multi_payload_frame_assembles_in_order() {
        let (mut camera, frames) = collecting_camera();
        // 16x16 = 256 pixels = 4 payload packets.
        let pixels: Vec<u8> = (0u8..=255).collect();
        let wire = obfuscate(&pixels);

        camera.process(&info_packet(16, 16, 0, 0));
        for (i, chunk) in wire.chunks(PAYLOAD_SIZE).enumerate() {
            camera.process(&payload_packet(i as u32 + 1, chunk));
        }

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].valid);
        assert_eq!(frames[0].data, pixels);
    }

    #[test]
    fn unknown_magic_is_ignored() {
        let (mut camera, frames) = collecting_camera();
        camera.process(&Packet {
            channel: 4,
            flags: 0,
            data: vec![1, 2, 3, 4, 5],
        });
        assert!(frames.lock().is_empty());
    }
}
