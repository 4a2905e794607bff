#[allow(dead_code)]
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

use switchyard::frame::signature;
use switchyard::Config;

use common::{datagram, memory_manager, peer, seeded_config, start_connection};

#[test]
fn manager_and_receiver_are_send() {
    fn assert_send<T: Send>() {}

    assert_send::<switchyard::ConnectionManager>();
    assert_send::<switchyard::Receiver>();
}

#[test]
fn receiver_on_worker_thread() {
    let (mut manager, handle) = memory_manager(seeded_config());

    let sender_key = manager.sender_key(&peer(5000));
    let local_id = manager.allocate_connection(sender_key).unwrap();
    manager.set_remote_id(local_id, 40).unwrap();

    let mut receiver = manager.take_receiver().unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let worker = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                receiver.drain_socket().unwrap();
                thread::yield_now();
            }
        })
    };

    const COUNT: u16 = 200;

    for i in 0..COUNT {
        if i % 2 == 0 {
            handle.push(&start_connection(i + 1), peer(5000));
        } else {
            handle.push(&datagram(0x1234, 40, local_id, &i.to_be_bytes()), peer(5000));
        }
    }

    let mut seen = Vec::new();
    let deadline = time::Instant::now() + time::Duration::from_secs(10);

    while seen.len() < COUNT as usize && time::Instant::now() < deadline {
        manager.sync();

        while let Some(packet_ref) = manager.get_next() {
            let packet = manager.received(packet_ref).unwrap();
            seen.push((packet.signature(), packet.connection()));
            manager.release(packet_ref).unwrap();
        }

        thread::sleep(time::Duration::from_millis(1));
    }

    stop.store(true, Ordering::Relaxed);
    worker.join().unwrap();

    assert_eq!(seen.len(), COUNT as usize);
    for (i, &(sig, connection)) in seen.iter().enumerate() {
        if i % 2 == 0 {
            assert_eq!((sig, connection), (signature::START_CONNECTION, None));
        } else {
            assert_eq!((sig, connection), (0x1234, Some(local_id)));
        }
    }

    // Everything went back to the pool
    manager.sync();
    let stats = manager.received_pool_stats();
    assert_eq!(stats.allocated, stats.available);
}

#[test]
fn connections_freed_while_receiving() {
    let (mut manager, handle) = memory_manager(Config {
        error_reply_limit: 64,
        ..seeded_config()
    });
    let mut receiver = manager.take_receiver().unwrap();

    let ids: Vec<u16> = (0..50)
        .map(|i| {
            let sender_key = manager.sender_key(&peer(6000 + i));
            let id = manager.allocate_connection(sender_key).unwrap();
            manager.set_remote_id(id, 1).unwrap();
            id
        })
        .collect();

    for &id in &ids {
        handle.push(&datagram(0x1234, 1, id, &[]), peer(6000));
    }

    let worker = thread::spawn(move || {
        while receiver.drain_socket().unwrap() {}
    });

    for &id in &ids {
        manager.free_connection(id).unwrap();
    }

    worker.join().unwrap();
    manager.sync();

    // Each datagram was either delivered or answered, never both
    let mut delivered = 0;
    while let Some(packet_ref) = manager.get_next() {
        delivered += 1;
        manager.release(packet_ref).unwrap();
    }

    assert_eq!(manager.connection_count(), 0);
    assert_eq!(delivered + handle.take_sent().len(), ids.len());
}
