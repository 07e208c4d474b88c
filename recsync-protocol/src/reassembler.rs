//! Stream Reassembler
//!
//! Turns transport-fragmented notification bytes back into frames. Each
//! notify endpoint gets its own receive buffer so that interleaved
//! notifications from the data and status endpoints never corrupt each other.
//!
//! After corruption the buffer is resynchronized on the next magic byte; the
//! skipped bytes are logged, never surfaced.

use crate::packet::{try_decode, Decoded, HEADER_LEN};
use crate::transport::Endpoint;
use crate::Packet;
use tracing::{debug, trace, warn};

/// Counters describing what a receive buffer has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Complete frames decoded
    pub packets: u64,
    /// Times the buffer had to be resynchronized
    pub resyncs: u64,
    /// Bytes dropped while resynchronizing
    pub discarded_bytes: u64,
}

#[derive(Debug, Default)]
struct ReceiveBuffer {
    bytes: Vec<u8>,
    stats: StreamStats,
}

impl ReceiveBuffer {
    fn push(&mut self, endpoint: Endpoint, fragment: &[u8]) -> Vec<Packet> {
        self.bytes.extend_from_slice(fragment);

        let mut packets = Vec::new();
        let mut offset = 0;

        // Every iteration either returns or advances `offset` by at least
        // one byte, so the loop ends within `bytes.len()` iterations.
        while offset < self.bytes.len() {
            match try_decode(&self.bytes[offset..]) {
                Decoded::Packet { packet, consumed } => {
                    trace!(
                        "{} endpoint: decoded {:?} ({} bytes)",
                        endpoint,
                        packet,
                        consumed
                    );
                    self.stats.packets += 1;
                    offset += consumed;
                    packets.push(packet);
                }
                Decoded::Incomplete => break,
                Decoded::Desynced { resync_at } => {
                    let skip = resync_at.unwrap_or(self.bytes.len() - offset);
                    warn!(
                        "{} endpoint: lost frame sync, dropping {} bytes",
                        endpoint, skip
                    );
                    self.stats.resyncs += 1;
                    self.stats.discarded_bytes += skip as u64;
                    offset += skip;
                }
            }
        }

        self.bytes.drain(..offset);

        if !self.bytes.is_empty() && self.bytes.len() >= HEADER_LEN {
            debug!(
                "{} endpoint: {} bytes buffered awaiting rest of frame",
                endpoint,
                self.bytes.len()
            );
        }

        packets
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Per-endpoint frame reassembly
#[derive(Debug, Default)]
pub struct StreamReassembler {
    data: ReceiveBuffer,
    status: ReceiveBuffer,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notification fragment and return every frame it completed,
    /// in arrival order
    pub fn on_fragment(&mut self, endpoint: Endpoint, fragment: &[u8]) -> Vec<Packet> {
        self.buffer_mut(endpoint).push(endpoint, fragment)
    }

    /// Bytes currently waiting for the rest of a frame
    pub fn pending(&self, endpoint: Endpoint) -> usize {
        self.buffer(endpoint).bytes.len()
    }

    pub fn stats(&self, endpoint: Endpoint) -> StreamStats {
        self.buffer(endpoint).stats
    }

    /// Drop all buffered bytes on both endpoints
    pub fn clear(&mut self) {
        self.data.clear();
        self.status.clear();
    }

    fn buffer(&self, endpoint: Endpoint) -> &ReceiveBuffer {
        match endpoint {
            Endpoint::Data => &self.data,
            Endpoint::Status => &self.status,
        }
    }

    fn buffer_mut(&mut self, endpoint: Endpoint) -> &mut ReceiveBuffer {
        match endpoint {
            Endpoint::Data => &mut self.data,
            Endpoint::Status => &mut self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{channel, command, encode, MAGIC};

    fn sample_frame() -> Vec<u8> {
        encode(
            5,
            channel::FILE_TRANSFER,
            command::FILE_DATA,
            b"hello recorder",
        )
    }

    #[test]
    fn test_every_split_size_yields_one_packet() {
        let frame = sample_frame();

        for step in 1..=frame.len() {
            let mut reassembler = StreamReassembler::new();
            let mut packets = Vec::new();
            for piece in frame.chunks(step) {
                packets.extend(reassembler.on_fragment(Endpoint::Data, piece));
            }

            assert_eq!(packets.len(), 1, "split size {}", step);
            assert_eq!(packets[0].payload(), b"hello recorder");
            assert_eq!(reassembler.pending(Endpoint::Data), 0);
        }
    }

    #[test]
    fn test_every_split_point_yields_one_packet() {
        let frame = sample_frame();

        for cut in 0..=frame.len() {
            let mut reassembler = StreamReassembler::new();
            let mut packets = reassembler.on_fragment(Endpoint::Data, &frame[..cut]);
            packets.extend(reassembler.on_fragment(Endpoint::Data, &frame[cut..]));
            assert_eq!(packets.len(), 1, "cut at {}", cut);
        }
    }

    #[test]
    fn test_garbage_prefix_causes_single_resync() {
        let mut stream = vec![0x00, 0x13, 0x37, 0x42, 0x99];
        stream.extend(sample_frame());

        let mut reassembler = StreamReassembler::new();
        let packets = reassembler.on_fragment(Endpoint::Data, &stream);

        assert_eq!(packets.len(), 1);
        let stats = reassembler.stats(Endpoint::Data);
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.discarded_bytes, 5);
    }

    #[test]
    fn test_garbage_without_magic_clears_buffer() {
        let mut reassembler = StreamReassembler::new();
        let packets = reassembler.on_fragment(Endpoint::Status, &[1, 2, 3, 4]);

        assert!(packets.is_empty());
        assert_eq!(reassembler.pending(Endpoint::Status), 0);
        assert_eq!(reassembler.stats(Endpoint::Status).resyncs, 1);
    }

    #[test]
    fn test_stray_magic_byte_waits_for_more_data() {
        // A lone magic byte could be the start of a frame
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler
            .on_fragment(Endpoint::Data, &[0x00, MAGIC])
            .is_empty());
        assert_eq!(reassembler.pending(Endpoint::Data), 1);

        let frame = sample_frame();
        let packets = reassembler.on_fragment(Endpoint::Data, &frame[1..]);
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_back_to_back_frames_in_one_fragment() {
        let mut stream = encode(1, channel::CONTROL, command::BATTERY_REPLY, &[90]);
        stream.extend(encode(2, channel::CONTROL, command::VERSION_REPLY, b"1.2.3"));
        stream.extend(&sample_frame()[..3]);

        let mut reassembler = StreamReassembler::new();
        let packets = reassembler.on_fragment(Endpoint::Data, &stream);

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].sequence(), 1);
        assert_eq!(packets[1].sequence(), 2);
        assert_eq!(reassembler.pending(Endpoint::Data), 3);
    }

    #[test]
    fn test_endpoints_are_independent() {
        let frame = sample_frame();
        let mut reassembler = StreamReassembler::new();

        assert!(reassembler
            .on_fragment(Endpoint::Data, &frame[..4])
            .is_empty());
        let status = encode(1, channel::CONTROL, command::BATTERY_REPLY, &[10]);
        assert_eq!(reassembler.on_fragment(Endpoint::Status, &status).len(), 1);
        assert_eq!(
            reassembler.on_fragment(Endpoint::Data, &frame[4..]).len(),
            1
        );
    }

    #[test]
    fn test_clear_drops_partial_frames() {
        let frame = sample_frame();
        let mut reassembler = StreamReassembler::new();
        reassembler.on_fragment(Endpoint::Data, &frame[..8]);
        reassembler.clear();

        assert_eq!(reassembler.pending(Endpoint::Data), 0);
        // The tail alone has no magic byte at its start
        assert!(reassembler
            .on_fragment(Endpoint::Data, &frame[8..])
            .is_empty());
    }
}
