//! Full-stack image decode: raw wire bytes in, finished frames out
//!
//! Drives info and payload packets through the mock hardware, the read
//! pipeline, the reassembler and a hub-connected camera node.
//!
//! Run with: `cargo test --test frames`

use crossbeam_channel::{unbounded, Receiver};
use sparsh_io::protocol::checksum::payload_checksum;
use sparsh_io::usb::{Context, Device, EventLoop, MockBackend, MockDriver};
use sparsh_io::{Camera, Hub, ImageFrame, ImageInfo, Reassembler, ReassemblyLimits};
use std::sync::Arc;
use std::time::Duration;

const FRAME_SYNC: u32 = 0x2301_0000;
const PAYLOAD_MAGIC: u32 = 0xBA2F_A166;
const CAMERA_CHANNEL: u16 = 4;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrap a byte block into one wire frame with the end-of-packet flag.
fn frame(channel: u16, payload: &[u8]) -> Vec<u8> {
    assert_eq!(payload.len() % 8, 0, "frames carry whole 64-bit units");
    let header = FRAME_SYNC
        | (payload.len() / 8) as u32
        | (u32::from(channel) << 8)
        | (1 << 12);
    let mut out = header.to_le_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

fn info_bytes(width: u16, height: u16, temperature: u8) -> Vec<u8> {
    let mut info = ImageInfo {
        magic: ImageInfo::MAGIC,
        left: 8,
        timestamp: 321,
        width,
        top: 6,
        temperature,
        skip: 0,
        height,
        checksum: 0,
    };
    info.finalize();
    info.encode().to_vec()
}

fn payload_bytes(index: u32, pixels: &[u8]) -> Vec<u8> {
    let mut payload = [0u8; 64];
    payload[..pixels.len()].copy_from_slice(pixels);
    let tail = (index & 0xF_FFFF) | (payload_checksum(index, &payload) << 20);
    let mut out = PAYLOAD_MAGIC.to_le_bytes().to_vec();
    out.extend_from_slice(&payload);
    out.extend_from_slice(&tail.to_le_bytes());
    out
}

/// Wire-side inverse of the sensor's pixel whitening.
fn obfuscate(pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len());
    let mut prev: u8 = 0;
    for &p in pixels {
        let raw = (p ^ 0xAA).wrapping_add(prev.wrapping_mul(31));
        out.push(raw);
        prev = raw;
    }
    out
}

struct Stack {
    hub: Hub,
    engine: Arc<Reassembler>,
    _events: EventLoop,
    backend: MockBackend,
    _device: Arc<Device>,
}

fn stack() -> (Stack, Receiver<ImageFrame>) {
    let backend = MockBackend::new();
    let driver = MockDriver::new();
    driver.attach(0x0403, 0x601F, backend.clone());
    let context = Context::with_driver(Arc::new(driver));
    let device = Arc::new(Device::open(&context, 0x0403, 0x601F).unwrap());
    device.start().unwrap();
    let events = EventLoop::new(Arc::clone(&device)).unwrap();
    let engine = Arc::new(
        Reassembler::new(Arc::clone(&device), 8, 4096, ReassemblyLimits::default()).unwrap(),
    );
    let hub = Hub::new(Arc::clone(&engine)).unwrap();

    let (tx, rx) = unbounded();
    hub.connect(
        CAMERA_CHANNEL as usize,
        Camera::shared(move |frame: &ImageFrame| {
            let _ = tx.send(frame.clone());
        }),
    );

    (
        Stack {
            hub,
            engine,
            _events: events,
            backend,
            _device: device,
        },
        rx,
    )
}

#[test]
fn frame_decodes_end_to_end() {
    let (stack, frames) = stack();
    let pixels: Vec<u8> = (0u8..16).map(|i| i.wrapping_mul(13)).collect();
    let wire = obfuscate(&pixels);

    stack
        .backend
        .complete_next_read(&frame(CAMERA_CHANNEL, &info_bytes(4, 4, 21)));
    stack
        .backend
        .complete_next_read(&frame(CAMERA_CHANNEL, &payload_bytes(1, &wire)));

    let image = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(image.valid);
    assert_eq!((image.width, image.height), (4, 4));
    assert_eq!((image.left, image.top), (8, 6));
    assert_eq!(image.request_timestamp, 321);
    assert_eq!(image.channel, CAMERA_CHANNEL);
    assert_eq!(image.data, pixels);
}

#[test]
fn lost_payload_yields_invalid_frame_end_to_end() {
    let (stack, frames) = stack();

    stack
        .backend
        .complete_next_read(&frame(CAMERA_CHANNEL, &info_bytes(16, 16, 0)));
    let pixels = vec![0x42u8; 256];
    let wire = obfuscate(&pixels);
    // Payload index 2 goes missing; indices 1, 3 and 4 arrive.
    for (i, chunk) in wire.chunks(64).enumerate() {
        let index = i as u32 + 1;
        if index == 2 {
            continue;
        }
        stack
            .backend
            .complete_next_read(&frame(CAMERA_CHANNEL, &payload_bytes(index, chunk)));
    }

    let image = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(!image.valid);
    assert_eq!((image.width, image.height), (16, 16));
}

#[test]
fn frames_on_other_channels_do_not_reach_the_camera() {
    let (stack, frames) = stack();

    // Same payload shape, wrong channel: the hub must not route it.
    stack
        .backend
        .complete_next_read(&frame(CAMERA_CHANNEL + 1, &info_bytes(4, 4, 0)));
    stack.backend.complete_next_read(&frame(
        CAMERA_CHANNEL + 1,
        &payload_bytes(1, &obfuscate(&[1u8; 16])),
    ));

    assert!(frames.recv_timeout(Duration::from_millis(300)).is_err());
    // The camera channel still works afterwards.
    stack
        .backend
        .complete_next_read(&frame(CAMERA_CHANNEL, &info_bytes(4, 4, 0)));
    let pixels: Vec<u8> = (50u8..66).collect();
    stack
        .backend
        .complete_next_read(&frame(CAMERA_CHANNEL, &payload_bytes(1, &obfuscate(&pixels))));
    let image = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(image.valid);
    assert_eq!(image.data, pixels);

    // Disconnecting the camera stops delivery.
    drop(stack.hub);
    stack
        .backend
        .complete_next_read(&frame(CAMERA_CHANNEL, &info_bytes(4, 4, 0)));
    stack.backend.complete_next_read(&frame(
        CAMERA_CHANNEL,
        &payload_bytes(1, &obfuscate(&[9u8; 16])),
    ));
    assert!(frames.recv_timeout(Duration::from_millis(300)).is_err());
    drop(stack.engine);
}
