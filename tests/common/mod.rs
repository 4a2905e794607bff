//! Helpers shared by the integration tests.

use std::net::SocketAddr;
use std::sync::Once;

use switchyard::frame::{self, serial, signature, LowLevelPacket};
use switchyard::socket::memory;
use switchyard::{Config, ConnectionId, ConnectionManager, ReceivedPacketRef};

static INIT_LOGGING: Once = Once::new();

pub const TEST_SEED: u64 = 0x5eed;

/// Installs a trace-level subscriber writing to the test harness.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

pub fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 1], port))
}

pub fn seeded_config() -> Config {
    Config {
        seed: Some(TEST_SEED),
        ..Default::default()
    }
}

/// A manager over an in-memory socket.
pub fn memory_manager(config: Config) -> (ConnectionManager, memory::Handle) {
    init_test_logging();

    let (tx, rx, handle) = memory::new();
    let manager = ConnectionManager::with_socket(tx, rx, config).unwrap();

    (manager, handle)
}

/// Builds a datagram the way a peer would send it: its own ID first, then the ID it
/// addresses.
pub fn datagram(
    signature: frame::Signature,
    sender_local: ConnectionId,
    sender_remote: ConnectionId,
    body: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::new();
    let wr = &mut frame::Writer::new(&mut buf);
    serial::write_header(wr, signature, sender_local, sender_remote);
    wr.write_slice(body);
    buf
}

pub fn packet_datagram<P: LowLevelPacket>(
    packet: &P,
    sender_local: ConnectionId,
    sender_remote: ConnectionId,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let wr = &mut frame::Writer::new(&mut buf);
    serial::write_header(wr, packet.signature(), sender_local, sender_remote);
    packet.serialize(wr, frame::LOWLEVEL_PROTOCOL_VERSIONS.minimum);
    buf
}

pub fn start_connection(sender_local: ConnectionId) -> Vec<u8> {
    let packet = frame::StartConnectionPacket {
        lowlevel_versions: frame::VersionRange::new(1, 1),
        highlevel_versions: frame::VersionRange::new(1, 1),
    };
    packet_datagram(&packet, sender_local, 0)
}

/// Syncs, then takes every queued packet and returns (signature, connection, content) for
/// each, releasing them.
pub fn collect(
    manager: &mut ConnectionManager,
) -> Vec<(frame::Signature, Option<ConnectionId>, Vec<u8>)> {
    manager.sync();

    let mut refs: Vec<ReceivedPacketRef> = Vec::new();
    while let Some(packet_ref) = manager.get_next() {
        refs.push(packet_ref);
    }

    let mut out = Vec::new();
    for packet_ref in refs {
        let packet = manager.received(packet_ref).unwrap();
        out.push((
            packet.signature(),
            packet.connection(),
            packet.content().to_vec(),
        ));
        manager.release(packet_ref).unwrap();
    }

    out
}

/// Decodes an outbound error reply into (replier's local ID, replier's remote ID, code).
pub fn decode_error_reply(datagram: &[u8]) -> (ConnectionId, ConnectionId, frame::ErrorCode) {
    // read_header takes the receiving side's point of view, so the fields are swapped
    let header = serial::read_header(datagram).unwrap();
    assert_eq!(header.signature, signature::ERROR);

    let mut rd = frame::Reader::new(serial::payload(datagram));
    let packet = frame::ErrorPacket::deserialize(&mut rd, 1).unwrap();

    (header.remote_id, header.local_id, packet.code)
}
