//! Packet reassembly engine
//!
//! Raw bulk transfers arrive as byte batches whose boundaries have
//! nothing to do with protocol frame boundaries. The reassembler turns
//! that stream back into whole [`Packet`]s:
//!
//! - The reader callback (event-loop thread) only enqueues batches into
//!   a bounded queue. If the queue ceiling is hit the whole queue is
//!   dropped and the overflow logged: hardware I/O is never blocked,
//!   at the price of losing whole batches under pathological load.
//! - The parsing thread drains one batch at a time, reinterprets it as
//!   a little-endian 32-bit word stream and runs the framing state
//!   machine ([`FrameParser`]).
//! - Completed packets go to the registered listeners. The listener map
//!   is copy-on-write: dispatch takes a momentary lock to clone the
//!   current snapshot pointer and then calls every listener *without*
//!   holding any lock, so a listener may freely add or remove listeners
//!   (the running dispatch keeps using its snapshot).
//!
//! # Wire framing
//!
//! A header word matches frame sync when its high 16 bits equal the
//! magic. The low byte is the frame length in 64-bit units, bits 8..12
//! the channel, bit 12 the end-of-packet flag. Body words accumulate
//! per channel until an end-of-packet frame closes the packet. A word
//! that fails frame sync is logged and skipped; the parser self-heals
//! on the next valid header.

use crate::error::{Error, Result};
use crate::protocol::Packet;
use crate::usb::{Device, Reader};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Frame sync magic in the high 16 bits of a header word
const FRAME_SYNC: u32 = 0x2301_0000;
/// Number of multiplexed channels addressable by the header
const CHANNEL_COUNT: usize = 16;

/// Hard limits on reassembly state.
///
/// The defaults match the wire producer's firmware; both ceilings guard
/// against a corrupted or hostile stream pinning host memory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReassemblyLimits {
    /// Ceiling on one channel's accumulator, in 32-bit words. Exceeding
    /// it is a protocol violation: the accumulator is cleared and no
    /// packet is emitted.
    pub max_packet_words: usize,
    /// Ceiling on the ingestion queue, in batches. Exceeding it drops
    /// the whole queue.
    pub max_queue_batches: usize,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_packet_words: 1_000_000,
            max_queue_batches: 100_000,
        }
    }
}

/// Opaque handle identifying one registered packet listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

type ListenerFn = Arc<dyn Fn(&Packet) + Send + Sync>;
type ListenerMap = HashMap<ListenerToken, ListenerFn>;

struct ListenerRegistry {
    /// Copy-on-write snapshot; replaced wholesale on every mutation so
    /// dispatch can iterate a clone without holding the lock.
    map: Mutex<Arc<ListenerMap>>,
    next_token: AtomicU64,
    down: AtomicBool,
}

impl ListenerRegistry {
    fn new() -> Self {
        Self {
            map: Mutex::new(Arc::new(ListenerMap::new())),
            next_token: AtomicU64::new(1),
            down: AtomicBool::new(false),
        }
    }

    fn add(&self, callback: ListenerFn) -> Result<ListenerToken> {
        if self.down.load(Ordering::Acquire) {
            return Err(Error::EngineShutDown);
        }
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.map.lock();
        let mut next = (**guard).clone();
        next.insert(token, callback);
        *guard = Arc::new(next);
        Ok(token)
    }

    fn remove(&self, token: ListenerToken) -> Result<()> {
        if self.down.load(Ordering::Acquire) {
            return Err(Error::EngineShutDown);
        }
        let mut guard = self.map.lock();
        let mut next = (**guard).clone();
        next.remove(&token);
        *guard = Arc::new(next);
        Ok(())
    }

    fn snapshot(&self) -> Arc<ListenerMap> {
        Arc::clone(&self.map.lock())
    }
}

/// Per-channel accumulation state.
#[derive(Default)]
struct ChannelAccumulator {
    words: Vec<u32>,
    start_batch: u64,
}

/// What the parser is in the middle of.
enum ParseState {
    /// Scanning for the next header word
    Scan,
    /// Consuming `remaining` body words for `channel`
    Body {
        channel: usize,
        remaining: usize,
        end_of_packet: bool,
    },
}

/// Push-driven framing state machine.
///
/// Fed whole batches of bytes; emits completed packets through the
/// `emit` callback. Keeping this free of threads and queues makes the
/// framing semantics directly testable.
pub(crate) struct FrameParser {
    channels: Vec<ChannelAccumulator>,
    state: ParseState,
    batch_index: u64,
    limits: ReassemblyLimits,
}

impl FrameParser {
    pub(crate) fn new(limits: ReassemblyLimits) -> Self {
        Self {
            channels: (0..CHANNEL_COUNT)
                .map(|_| ChannelAccumulator::default())
                .collect(),
            state: ParseState::Scan,
            batch_index: 0,
            limits,
        }
    }

    /// Feed one raw batch. Trailing bytes that do not fill a whole
    /// 32-bit word are dropped; transfers are word-aligned on the wire.
    pub(crate) fn push_batch(&mut self, batch: &[u8], emit: &mut dyn FnMut(Packet)) {
        self.batch_index += 1;
        for word_bytes in batch.chunks_exact(4) {
            let word = u32::from_le_bytes(word_bytes.try_into().expect("chunk of 4"));
            self.push_word(word, emit);
        }
    }

    fn push_word(&mut self, word: u32, emit: &mut dyn FnMut(Packet)) {
        match self.state {
            ParseState::Scan => {
                if word & 0xFFFF_0000 != FRAME_SYNC {
                    log::warn!("frame resync, skipping word {:#010x}", word);
                    return;
                }
                let length_64 = (word & 0xFF) as usize;
                let channel = ((word >> 8) & 0xF) as usize;
                let end_of_packet = (word >> 12) & 1 != 0;

                let accumulator = &mut self.channels[channel];
                if accumulator.words.is_empty() {
                    accumulator.start_batch = self.batch_index;
                }
                if length_64 > 0 {
                    self.state = ParseState::Body {
                        channel,
                        remaining: length_64 * 2,
                        end_of_packet,
                    };
                } else {
                    self.finish_frame(channel, end_of_packet, emit);
                }
            }
            ParseState::Body {
                channel,
                ref mut remaining,
                end_of_packet,
            } => {
                self.channels[channel].words.push(word);
                *remaining -= 1;
                if *remaining == 0 {
                    self.state = ParseState::Scan;
                    self.finish_frame(channel, end_of_packet, emit);
                }
            }
        }
    }

    fn finish_frame(&mut self, channel: usize, end_of_packet: bool, emit: &mut dyn FnMut(Packet)) {
        let accumulator = &mut self.channels[channel];
        if end_of_packet {
            let mut data = Vec::with_capacity(accumulator.words.len() * 4);
            for word in &accumulator.words {
                data.extend_from_slice(&word.to_le_bytes());
            }
            let mut flags = 0;
            if accumulator.start_batch != self.batch_index {
                flags |= Packet::FLAG_MULTI_BATCH;
            }
            accumulator.words.clear();
            emit(Packet {
                channel: channel as u16,
                flags,
                data,
            });
        } else if accumulator.words.len() > self.limits.max_packet_words {
            log::error!(
                "channel {} accumulator overflow ({} words), clearing",
                channel,
                accumulator.words.len()
            );
            accumulator.words.clear();
        }
    }
}

struct IngestQueue {
    batches: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
    exit: AtomicBool,
    max_batches: usize,
}

/// The packet reassembly engine.
///
/// Owns the device's read pipeline and the parsing thread; dispatches
/// completed packets to registered listeners.
pub struct Reassembler {
    queue: Arc<IngestQueue>,
    listeners: Arc<ListenerRegistry>,
    reader: Mutex<Option<Reader>>,
    parse_thread: Mutex<Option<JoinHandle<()>>>,
    down: AtomicBool,
}

impl Reassembler {
    /// Start the engine on an opened, started device.
    ///
    /// `buffer_count` and `buffer_size` size the read pipeline; the
    /// device's event loop must be running.
    pub fn new(
        device: Arc<Device>,
        buffer_count: usize,
        buffer_size: usize,
        limits: ReassemblyLimits,
    ) -> Result<Self> {
        let queue = Arc::new(IngestQueue {
            batches: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            exit: AtomicBool::new(false),
            max_batches: limits.max_queue_batches,
        });
        let listeners = Arc::new(ListenerRegistry::new());

        let ingest = Arc::clone(&queue);
        let reader = Reader::new(
            device,
            move |data| {
                if data.is_empty() {
                    return;
                }
                let mut batches = ingest.batches.lock();
                batches.push_back(data.to_vec());
                if batches.len() > ingest.max_batches {
                    log::error!(
                        "ingestion queue overflow, dropping {} batches",
                        batches.len()
                    );
                    batches.clear();
                }
                ingest.available.notify_all();
            },
            buffer_count,
            buffer_size,
        )?;

        let parse_queue = Arc::clone(&queue);
        let parse_listeners = Arc::clone(&listeners);
        let parse_thread = thread::Builder::new()
            .name("packet-parser".to_string())
            .spawn(move || {
                let mut parser = FrameParser::new(limits);
                loop {
                    let batch = {
                        let mut batches = parse_queue.batches.lock();
                        loop {
                            if parse_queue.exit.load(Ordering::Acquire) {
                                log::info!("parser thread exiting");
                                return;
                            }
                            if let Some(batch) = batches.pop_front() {
                                break batch;
                            }
                            parse_queue.available.wait(&mut batches);
                        }
                    };
                    parser.push_batch(&batch, &mut |packet| {
                        let snapshot = parse_listeners.snapshot();
                        for listener in snapshot.values() {
                            listener(&packet);
                        }
                    });
                }
            })
            .map_err(|e| Error::Other(format!("failed to spawn parser thread: {e}")))?;

        Ok(Self {
            queue,
            listeners,
            reader: Mutex::new(Some(reader)),
            parse_thread: Mutex::new(Some(parse_thread)),
            down: AtomicBool::new(false),
        })
    }

    /// Register a packet listener; the returned token unregisters it.
    ///
    /// Listeners run synchronously on the parsing thread and must not
    /// block for long, or the whole ingestion pipeline backs up into
    /// the queue-overflow drop policy.
    pub fn add_packet_listener(
        &self,
        callback: impl Fn(&Packet) + Send + Sync + 'static,
    ) -> Result<ListenerToken> {
        self.listeners.add(Arc::new(callback))
    }

    /// Unregister a packet listener.
    pub fn remove_packet_listener(&self, token: ListenerToken) -> Result<()> {
        self.listeners.remove(token)
    }

    /// Tear the engine down: stop the read pipeline, drain out of the
    /// parsing thread and join it. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("reassembler shutting down");

        {
            let _batches = self.queue.batches.lock();
            self.queue.exit.store(true, Ordering::Release);
            self.queue.available.notify_all();
        }

        // Stops the feed; blocks until every transfer slot has retired.
        drop(self.reader.lock().take());

        if let Some(handle) = self.parse_thread.lock().take() {
            if handle.join().is_err() {
                log::error!("parser thread panicked");
            }
        }
        self.listeners.down.store(true, Ordering::Release);
        log::info!("reassembler shut down");
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Header word for one frame.
    fn header(length_64: usize, channel: u16, end: bool) -> u32 {
        FRAME_SYNC | (length_64 as u32) | (u32::from(channel) << 8) | (u32::from(end) << 12)
    }

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn collect_packets(batches: &[Vec<u32>]) -> Vec<Packet> {
        let mut parser = FrameParser::new(ReassemblyLimits::default());
        let mut packets = Vec::new();
        for batch in batches {
            parser.push_batch(&words_to_bytes(batch), &mut |p| packets.push(p));
        }
        packets
    }

    #[test]
    fn single_frame_packet_round_trips() {
        let packets = collect_packets(&[vec![header(1, 3, true), 0x1111_1111, 0x2222_2222]]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].channel, 3);
        assert_eq!(packets[0].data, words_to_bytes(&[0x1111_1111, 0x2222_2222]));
        assert!(!packets[0].spans_batches());
    }

    #[test]
    fn multi_frame_packet_accumulates_until_end_flag() {
        let packets = collect_packets(&[vec![
            header(1, 2, false),
            1,
            2,
            header(1, 2, true),
            3,
            4,
        ]]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, words_to_bytes(&[1, 2, 3, 4]));
        assert!(!packets[0].spans_batches());
    }

    #[test]
    fn channels_interleave_independently() {
        let packets = collect_packets(&[vec![
            header(1, 0, false),
            10,
            11,
            header(1, 1, true),
            20,
            21,
            header(1, 0, true),
            12,
            13,
        ]]);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].channel, 1);
        assert_eq!(packets[0].data, words_to_bytes(&[20, 21]));
        assert_eq!(packets[1].channel, 0);
        assert_eq!(packets[1].data, words_to_bytes(&[10, 11, 12, 13]));
    }

    #[test]
    fn batch_boundary_sets_multi_batch_flag() {
        // Same packet split across two batches mid-body.
        let packets = collect_packets(&[
            vec![header(2, 5, true), 1, 2],
            vec![3, 4],
        ]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, words_to_bytes(&[1, 2, 3, 4]));
        assert!(packets[0].spans_batches());
    }

    #[test]
    fn packet_within_one_batch_has_no_flag() {
        let packets = collect_packets(&[
            vec![header(1, 5, true), 1, 2],
            vec![header(1, 5, true), 3, 4],
        ]);
        assert_eq!(packets.len(), 2);
        assert!(!packets[0].spans_batches());
        assert!(!packets[1].spans_batches());
    }

    #[test]
    fn noise_before_header_resyncs_without_losing_packet() {
        let packets = collect_packets(&[vec![
            0xDEAD_BEEF,
            0x0BAD_F00D,
            header(1, 7, true),
            42,
            43,
        ]]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].channel, 7);
        assert_eq!(packets[0].data, words_to_bytes(&[42, 43]));
    }

    #[test]
    fn oversized_accumulator_is_cleared_without_emitting() {
        let limits = ReassemblyLimits {
            max_packet_words: 4,
            max_queue_batches: 100,
        };
        let mut parser = FrameParser::new(limits);
        let mut packets = Vec::new();
        // Three open frames of 2 words each blow the 4-word ceiling.
        for _ in 0..3 {
            parser.push_batch(
                &words_to_bytes(&[header(1, 1, false), 9, 9]),
                &mut |p| packets.push(p),
            );
        }
        assert!(packets.is_empty());
        // The channel recovers: a fresh complete packet still comes out.
        parser.push_batch(
            &words_to_bytes(&[header(1, 1, true), 1, 2]),
            &mut |p| packets.push(p),
        );
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, words_to_bytes(&[1, 2]));
    }

    #[test]
    fn empty_end_frame_emits_empty_packet() {
        let packets = collect_packets(&[vec![header(0, 4, true)]]);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].data.is_empty());
        assert!(!packets[0].spans_batches());
    }
}
