//! Sync Engine Integration Tests
//!
//! Drives the engine by hand with explicit instants, the way a transport
//! and timer would, and checks what it writes back and what it reports.

use recsync_protocol::file_list::encode_record;
use recsync_protocol::packet::{channel, command, encode, try_decode, Decoded};
use recsync_protocol::wav::{self, AudioFormat};
use recsync_protocol::{
    ChannelWriter, ConnectionState, DeviceFileEntry, DownloadEvent, EngineConfig, Endpoint,
    ListEvent, Packet, ProtocolError, SessionMode, SyncEngine,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const TS_20240102_153000: u32 = 1_704_209_400;
const TS_20240103_090000: u32 = 1_704_272_400;

struct Harness {
    engine: SyncEngine<ChannelWriter>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    start: Instant,
    sequence: u8,
}

impl Harness {
    fn connected() -> Self {
        let (writer, outbound) = ChannelWriter::new(20);
        let mut engine = SyncEngine::new(writer, EngineConfig::default());
        let start = Instant::now();
        engine.connect_requested().unwrap();
        engine.link_established(start).unwrap();

        let mut harness = Self {
            engine,
            outbound,
            start,
            sequence: 0,
        };
        harness.sent_packets();
        harness
    }

    fn at(&self, millis: u64) -> Instant {
        self.start + Duration::from_millis(millis)
    }

    /// Deliver one reply frame in notification fragments of `fragment` bytes
    fn deliver(&mut self, channel: u8, command: u8, payload: &[u8], fragment: usize, now: Instant) {
        let frame = encode(self.sequence, channel, command, payload);
        self.sequence = self.sequence.wrapping_add(1);
        for piece in frame.chunks(fragment) {
            self.engine.on_notification(Endpoint::Data, piece, now);
        }
    }

    /// Everything the engine wrote since the last call, decoded
    fn sent_packets(&mut self) -> Vec<Packet> {
        let mut bytes = Vec::new();
        while let Ok(piece) = self.outbound.try_recv() {
            assert!(piece.len() <= 20);
            bytes.extend(piece);
        }

        let mut packets = Vec::new();
        let mut offset = 0;
        while let Decoded::Packet { packet, consumed } = try_decode(&bytes[offset..]) {
            packets.push(packet);
            offset += consumed;
        }
        assert_eq!(offset, bytes.len());
        packets
    }

    fn list(&mut self) -> mpsc::UnboundedReceiver<ListEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = self.start;
        self.engine.request_file_list(tx, now).unwrap();
        rx
    }

    fn download(&mut self, entry: DeviceFileEntry, now: Instant) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.request_download(entry, tx, now).unwrap();
        rx
    }
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn entry(name: &str, size: u32) -> DeviceFileEntry {
    DeviceFileEntry::new(name, name.as_bytes().to_vec(), size, TS_20240102_153000, 0)
}

#[test]
fn test_listing_finalized_by_quiet_period() {
    let mut h = Harness::connected();
    let mut rx = h.list();

    let request = h.sent_packets();
    assert_eq!(request.len(), 1);
    assert_eq!(request[0].command(), command::LIST_REQUEST);

    let mut records = encode_record(TS_20240102_153000, 2_000_000, b"REC001.WAV").to_vec();
    records.extend(encode_record(TS_20240103_090000, 500_000, b"REC002.WAV"));

    // Three chunks, none aligned to a record boundary
    let last_data = h.at(200);
    h.deliver(channel::FILE_TRANSFER, command::LIST_REPLY, &records[..10], 20, h.at(0));
    h.deliver(channel::FILE_TRANSFER, command::LIST_REPLY, &records[10..40], 7, h.at(100));
    h.deliver(channel::FILE_TRANSFER, command::LIST_REPLY, &records[40..], 3, last_data);
    assert_eq!(h.sent_packets().len(), 3, "every list reply is acknowledged");

    h.engine.poll_timers(last_data + Duration::from_millis(1499));
    assert_eq!(h.engine.state(), ConnectionState::Syncing);

    assert_eq!(
        h.engine.next_deadline(),
        Some(last_data + Duration::from_millis(1500))
    );
    h.engine.poll_timers(last_data + Duration::from_millis(1500));

    let events = drain(&mut rx);
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], ListEvent::Partial(e) if e.len() == 1));
    assert!(matches!(&events[1], ListEvent::Partial(e) if e.len() == 2));

    let ListEvent::Complete(entries) = &events[2] else {
        panic!("expected completion, got {:?}", events[2]);
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].display_name(), "REC001.WAV");
    assert_eq!(entries[0].size_bytes(), 2_000_000);
    assert_eq!(entries[0].capture_epoch_seconds(), TS_20240102_153000);
    assert_eq!(entries[1].display_name(), "REC002.WAV");
    assert_eq!(entries[1].size_bytes(), 500_000);
    assert_eq!(entries[1].capture_epoch_seconds(), TS_20240103_090000);

    assert_eq!(h.engine.state(), ConnectionState::Connected);
    assert_eq!(h.engine.mode(), SessionMode::Idle);
}

#[test]
fn test_late_list_complete_is_a_no_op() {
    let mut h = Harness::connected();
    let mut rx = h.list();
    let record = encode_record(TS_20240102_153000, 10, b"A.WAV");
    h.deliver(channel::FILE_TRANSFER, command::LIST_REPLY, &record, 20, h.at(0));

    h.engine.poll_timers(h.at(1500));
    h.deliver(channel::FILE_TRANSFER, command::LIST_COMPLETE, &[], 20, h.at(1600));

    let completions = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ListEvent::Complete(_)))
        .count();
    assert_eq!(completions, 1);
    assert!(matches!(
        rx.try_recv(),
        Err(mpsc::error::TryRecvError::Disconnected)
    ));
}

#[test]
fn test_list_complete_before_quiet_period() {
    let mut h = Harness::connected();
    let mut rx = h.list();
    let record = encode_record(TS_20240102_153000, 10, b"A.WAV");
    h.deliver(channel::FILE_TRANSFER, command::LIST_REPLY, &record, 20, h.at(0));
    h.deliver(channel::FILE_TRANSFER, command::LIST_COMPLETE, &[], 20, h.at(10));

    assert!(matches!(drain(&mut rx).last(), Some(ListEvent::Complete(e)) if e.len() == 1));
    assert!(h.engine.next_deadline().is_none());

    // The quiet period passing afterwards changes nothing
    h.engine.poll_timers(h.at(5000));
    assert_eq!(h.engine.state(), ConnectionState::Connected);
}

#[test]
fn test_duplicate_entries_collapse() {
    let mut h = Harness::connected();
    let mut rx = h.list();

    let record = encode_record(TS_20240102_153000, 4096, b"DUP.WAV");
    let mut first = record.to_vec();
    first.extend(record);
    h.deliver(channel::FILE_TRANSFER, command::LIST_REPLY, &first, 20, h.at(0));
    h.deliver(channel::FILE_TRANSFER, command::FILE_DATA, &record, 20, h.at(10));
    h.deliver(channel::FILE_TRANSFER, command::LIST_COMPLETE, &[], 20, h.at(20));

    let Some(ListEvent::Complete(entries)) = drain(&mut rx).pop() else {
        panic!("listing did not complete");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].display_name(), "DUP.WAV");
}

#[test]
fn test_every_fragmentation_dispatches_once() {
    let frame = encode(3, channel::CONTROL, command::BATTERY_REPLY, &[42]);

    for size in 1..=frame.len() {
        let mut h = Harness::connected();
        let mut status_rx = h.engine.subscribe_status();
        drain(&mut status_rx);

        for piece in frame.chunks(size) {
            h.engine.on_notification(Endpoint::Status, piece, h.start);
        }

        let updates = drain(&mut status_rx);
        assert_eq!(updates.len(), 1, "fragment size {}", size);
        assert_eq!(updates[0].battery_percent, Some(42));
        assert_eq!(h.engine.stream_stats(Endpoint::Status).packets, 1);
    }
}

#[test]
fn test_garbage_causes_single_resync() {
    let mut h = Harness::connected();
    let mut bytes = vec![0x00, 0x13, 0x37, 0xFF, 0x42];
    bytes.extend(encode(0, channel::CONTROL, command::BATTERY_REPLY, &[55]));

    h.engine.on_notification(Endpoint::Status, &bytes, h.start);

    let stats = h.engine.stream_stats(Endpoint::Status);
    assert_eq!(stats.resyncs, 1);
    assert_eq!(stats.discarded_bytes, 5);
    assert_eq!(h.engine.status().battery_percent, Some(55));
}

#[test]
fn test_endpoints_have_independent_buffers() {
    let mut h = Harness::connected();
    let battery = encode(0, channel::CONTROL, command::BATTERY_REPLY, &[10]);
    let version = encode(1, channel::CONTROL, command::VERSION_REPLY, b"V1.0");

    // Interleave half-frames from both endpoints
    h.engine.on_notification(Endpoint::Status, &battery[..3], h.start);
    h.engine.on_notification(Endpoint::Data, &version[..4], h.start);
    h.engine.on_notification(Endpoint::Status, &battery[3..], h.start);
    h.engine.on_notification(Endpoint::Data, &version[4..], h.start);

    assert_eq!(h.engine.status().battery_percent, Some(10));
    assert_eq!(h.engine.status().firmware_version.as_deref(), Some("V1.0"));
}

#[test]
fn test_download_progress_reaches_100() {
    let mut h = Harness::connected();
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 200) as u8).collect();
    let mut rx = h.download(entry("memo.mp3", 1000), h.start);

    let request = h.sent_packets();
    assert_eq!(request[0].command(), command::IMPORT_REQUEST);
    assert_eq!(&request[0].payload()[..8], b"memo.mp3");
    assert_eq!(request[0].payload().len(), 20);

    h.deliver(channel::FILE_TRANSFER, command::IMPORT_STARTED, &[], 20, h.at(1));
    for (i, chunk) in content.chunks(96).enumerate() {
        h.deliver(channel::FILE_TRANSFER, command::FILE_DATA, chunk, 20, h.at(2 + i as u64));
    }
    h.deliver(channel::FILE_TRANSFER, command::IMPORT_COMPLETE, &[0], 20, h.at(50));

    let events = drain(&mut rx);
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));

    let Some(DownloadEvent::Complete(file)) = events.last() else {
        panic!("download did not complete: {:?}", events.last());
    };
    assert_eq!(file.mime_type, "audio/mpeg");
    assert_eq!(file.data, content);
    assert_eq!(h.engine.state(), ConnectionState::Connected);
}

#[test]
fn test_stall_fails_once_and_frees_engine() {
    let mut h = Harness::connected();
    let mut rx = h.download(entry("A.WAV", 100), h.start);
    h.deliver(channel::FILE_TRANSFER, command::FILE_DATA, &[0; 30], 20, h.at(500));

    h.engine.poll_timers(h.at(10_499));
    assert!(drain(&mut rx).iter().all(|e| !e.is_terminal()));

    h.engine.poll_timers(h.at(10_500));
    h.engine.poll_timers(h.at(30_000));

    let failures: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(DownloadEvent::is_terminal)
        .collect();
    assert_eq!(
        failures,
        vec![DownloadEvent::Failed(ProtocolError::Stalled {
            received: 30,
            total: 100
        })]
    );
    assert_eq!(h.engine.state(), ConnectionState::Connected);

    // A new download can start right away
    let _rx = h.download(entry("B.WAV", 10), h.at(10_500));
    assert_eq!(h.engine.mode(), SessionMode::Downloading);
}

#[test]
fn test_headerless_wav_is_repaired() {
    let mut h = Harness::connected();
    let samples = vec![0x5Au8; 640];
    let mut rx = h.download(entry("20240102-153000.WAV", 640), h.start);

    for chunk in samples.chunks(100) {
        h.deliver(channel::FILE_TRANSFER, command::FILE_DATA, chunk, 20, h.start);
    }
    h.deliver(channel::FILE_TRANSFER, command::IMPORT_COMPLETE, &[], 20, h.start);

    let Some(DownloadEvent::Complete(file)) = drain(&mut rx).pop() else {
        panic!("download did not complete");
    };
    assert!(file.header_synthesized);
    assert!(wav::has_header(&file.data));
    let data_len = u32::from_le_bytes([file.data[40], file.data[41], file.data[42], file.data[43]]);
    assert_eq!(data_len, 640);
    assert_eq!(&file.data[wav::HEADER_LEN..], samples.as_slice());
}

#[test]
fn test_wav_with_header_passes_through() {
    let mut h = Harness::connected();
    let mut content = wav::synthesize_header(64, AudioFormat::default()).to_vec();
    content.extend([7u8; 64]);
    let mut rx = h.download(entry("REC002.WAV", content.len() as u32), h.start);

    h.deliver(channel::FILE_TRANSFER, command::FILE_DATA, &content, 20, h.start);
    h.deliver(channel::FILE_TRANSFER, command::IMPORT_COMPLETE, &[0], 20, h.start);

    let Some(DownloadEvent::Complete(file)) = drain(&mut rx).pop() else {
        panic!("download did not complete");
    };
    assert!(!file.header_synthesized);
    assert_eq!(file.data, content);
}

#[test]
fn test_device_error_status() {
    let mut h = Harness::connected();
    let mut rx = h.download(entry("A.WAV", 100), h.start);
    h.deliver(channel::FILE_TRANSFER, command::IMPORT_COMPLETE, &[5], 20, h.start);

    assert_eq!(
        drain(&mut rx),
        vec![DownloadEvent::Failed(ProtocolError::Device { status: 5 })]
    );
    assert_eq!(h.engine.state(), ConnectionState::Connected);
    assert!(h.engine.next_deadline().is_none());
}

#[test]
fn test_empty_file_reports_full_progress() {
    let mut h = Harness::connected();
    let mut rx = h.download(entry("EMPTY.MP3", 0), h.start);
    h.deliver(channel::FILE_TRANSFER, command::IMPORT_STARTED, &[], 20, h.start);
    h.deliver(channel::FILE_TRANSFER, command::IMPORT_COMPLETE, &[0], 20, h.start);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0],
        DownloadEvent::Progress(p) if p.percent == 100 && p.received == 0 && p.total == 0
    ));
    let DownloadEvent::Complete(file) = &events[1] else {
        panic!("download did not complete: {:?}", events[1]);
    };
    assert!(file.data.is_empty());
}

#[test]
fn test_file_transfer_packets_acknowledged_with_same_header() {
    let mut h = Harness::connected();
    let _rx = h.download(entry("A.WAV", 4), h.start);
    h.sent_packets();

    h.sequence = 200;
    h.deliver(channel::FILE_TRANSFER, command::IMPORT_STARTED, &[], 20, h.start);
    h.deliver(channel::FILE_TRANSFER, command::FILE_DATA, &[1, 2, 3, 4], 2, h.start);
    h.deliver(channel::CONTROL, command::BATTERY_REPLY, &[9], 20, h.start);

    let acks = h.sent_packets();
    assert_eq!(acks.len(), 2);
    assert_eq!(
        (acks[0].sequence(), acks[0].channel(), acks[0].command()),
        (200, channel::FILE_TRANSFER, command::IMPORT_STARTED)
    );
    assert_eq!(
        (acks[1].sequence(), acks[1].channel(), acks[1].command()),
        (201, channel::FILE_TRANSFER, command::FILE_DATA)
    );
    assert!(acks.iter().all(|a| a.payload().is_empty()));
}

#[test]
fn test_link_loss_fails_download_and_allows_reconnect() {
    let mut h = Harness::connected();
    let mut state_rx = h.engine.subscribe_state();
    let mut rx = h.download(entry("A.WAV", 100), h.start);
    h.deliver(channel::FILE_TRANSFER, command::FILE_DATA, &[0; 10], 20, h.start);

    h.engine.link_lost(None);

    let events = drain(&mut rx);
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Failed(ProtocolError::LinkLost(_)))
    ));
    assert_eq!(
        drain(&mut state_rx),
        vec![
            ConnectionState::Connected,
            ConnectionState::Syncing,
            ConnectionState::Disconnected
        ]
    );
    assert!(h.engine.next_deadline().is_none());

    h.engine.connect_requested().unwrap();
    h.engine.link_established(h.at(100)).unwrap();
    assert_eq!(h.engine.state(), ConnectionState::Connected);
}

#[test]
fn test_requests_rejected_while_syncing() {
    let mut h = Harness::connected();
    let _rx = h.download(entry("A.WAV", 100), h.start);

    let (tx, _list_rx) = mpsc::unbounded_channel();
    assert!(matches!(
        h.engine.request_file_list(tx, h.start),
        Err(ProtocolError::InvalidState(_))
    ));

    let (tx, _dl_rx) = mpsc::unbounded_channel();
    assert!(matches!(
        h.engine.request_download(entry("B.WAV", 1), tx, h.start),
        Err(ProtocolError::InvalidState(_))
    ));
    assert_eq!(
        h.engine.mode(),
        SessionMode::Downloading,
        "the active download is untouched"
    );
}
