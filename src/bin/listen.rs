use std::thread;
use std::time;

use switchyard::frame::{self, serial, signature, LowLevelPacket};

static WAIT_TIMEOUT: time::Duration = time::Duration::from_millis(100);
static ERROR_BACKOFF: time::Duration = time::Duration::from_millis(500);
static SYNC_INTERVAL: time::Duration = time::Duration::from_millis(10);

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut manager = switchyard::ConnectionManager::bind(("127.0.0.1", 8888), Default::default())
        .expect("failed to bind socket");

    let mut receiver = manager.take_receiver().expect("receiver already taken");

    thread::spawn(move || loop {
        if let Err(err) = receiver.wait_and_drain(Some(WAIT_TIMEOUT)) {
            tracing::error!(%err, "receive failed");
            thread::sleep(ERROR_BACKOFF);
        }
    });

    tracing::info!(addr = ?manager.local_addr(), "listening");

    loop {
        manager.sync();

        while let Some(packet_ref) = manager.get_next() {
            let Some(packet) = manager.received(packet_ref) else {
                continue;
            };

            let sender_addr = *packet.sender_addr();
            let sender_key = packet.sender_key();
            let content = packet.content().to_vec();

            tracing::info!(
                %sender_addr,
                signature = format_args!("{:#06x}", packet.signature()),
                connection = ?packet.connection(),
                "received {:02X?}",
                content
            );

            manager.release(packet_ref).expect("packet released twice");

            if serial::read_signature(&content) == Some(signature::START_CONNECTION) {
                accept(&mut manager, &content, sender_addr, sender_key);
            }
        }

        thread::sleep(SYNC_INTERVAL);
    }
}

fn accept(
    manager: &mut switchyard::ConnectionManager,
    content: &[u8],
    sender_addr: std::net::SocketAddr,
    sender_key: switchyard::SenderKey,
) {
    let Some(header) = serial::read_header(content) else {
        return;
    };

    let mut rd = frame::Reader::new(serial::payload(content));
    let Some(request) = frame::StartConnectionPacket::deserialize(&mut rd, 1) else {
        tracing::warn!(%sender_addr, "malformed start connection");
        return;
    };

    let Some(reply) = manager.negotiate(&request) else {
        tracing::warn!(%sender_addr, "no common protocol version");
        return;
    };

    // A repeated request gets the existing connection
    let local_id = match manager.lookup_by_sender_key(sender_key) {
        Some(record) => record.local_id,
        None => match manager.allocate_connection(sender_key) {
            Ok(local_id) => local_id,
            Err(err) => {
                tracing::warn!(%sender_addr, %err, "failed to allocate connection");
                return;
            }
        },
    };

    if let Err(err) = manager.set_remote_id(local_id, header.remote_id) {
        tracing::warn!(%err, "failed to set remote id");
        return;
    }

    if let Err(err) = manager.send_connectionless(&reply, &sender_addr, local_id, header.remote_id)
    {
        tracing::warn!(%sender_addr, %err, "failed to send accept");
    }
}
