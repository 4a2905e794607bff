#[cfg(debug_assertions)]
mod loss;
mod receiver;

use std::collections::VecDeque;
use std::net;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{
    self, serial, AcceptConnectionPacket, ErrorCode, ErrorPacket, LowLevelPacket,
    StartConnectionPacket,
};
use crate::packet::{ReceivedPacket, ReceivedPacketRef, SentPacket, SentPacketRef};
use crate::pool::{Leases, Pool};
use crate::sender_key::SenderKeyHasher;
use crate::socket::{self, DatagramRx, DatagramTx};
use crate::table::{ConnectionId, ConnectionRecord, ConnectionTable, SenderKey};

#[cfg(debug_assertions)]
use loss::LossSimulator;
pub use receiver::Receiver;

// Seed perturbations, so that seeded runs use independent streams per purpose
const SEED_SALT_RECEIVE_LOSS: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_SALT_SEND_LOSS: u64 = 0xc2b2_ae3d_27d4_eb4f;

// An error reply which the receiver wants sent
struct ErrorNotice {
    addr: net::SocketAddr,
    local_id: ConnectionId,
    remote_id: ConnectionId,
    code: ErrorCode,
}

// Everything the receive side touches
struct SharedState {
    // Active connections
    table: ConnectionTable,
    // Free inbound packets
    pool: Pool<ReceivedPacket>,
    // Accepted packets not yet seen by the consumer
    worker_queue: VecDeque<Box<ReceivedPacket>>,
    // Error replies to be sent during the next sync
    error_notices: Vec<ErrorNotice>,
}

type Shared = Mutex<SharedState>;

fn lock(shared: &Shared) -> MutexGuard<'_, SharedState> {
    // Every critical section leaves the state consistent, so a panic elsewhere does not
    // invalidate it
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn rng_from_seed(seed: Option<u64>, salt: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ salt),
        None => StdRng::from_entropy(),
    }
}

// Returns every queued packet routed to `local_id` to the pool, keeping the order of the rest
fn discard_routed(
    queue: &mut VecDeque<Box<ReceivedPacket>>,
    pool: &mut Pool<ReceivedPacket>,
    local_id: ConnectionId,
) -> usize {
    let mut discarded = 0;
    let mut i = 0;

    while i < queue.len() {
        if queue[i].connection() == Some(local_id) {
            if let Some(packet) = queue.remove(i) {
                pool.restore(packet);
                discarded += 1;
            }
        } else {
            i += 1;
        }
    }

    discarded
}

/// Occupancy of a packet pool.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Objects ever allocated by the pool.
    pub allocated: usize,
    /// Objects ready to be rented.
    pub available: usize,
    /// Objects currently held by the consumer.
    pub leased: usize,
}

// Socket send handle plus send-side loss simulation
struct Transmitter {
    socket_tx: Arc<dyn DatagramTx>,
    #[cfg(debug_assertions)]
    loss: LossSimulator,
}

impl Transmitter {
    fn send(&mut self, datagram: &[u8], addr: &net::SocketAddr) -> Result<()> {
        #[cfg(debug_assertions)]
        if self.loss.should_drop() {
            // Indistinguishable from a datagram lost in transit
            tracing::trace!(%addr, "simulated send loss");
            return Ok(());
        }

        self.socket_tx.send_to(datagram, addr)?;

        Ok(())
    }
}

/// Owns the active connections of one socket and routes its datagrams.
///
/// The consumer side (everything except the [`Receiver`]) is meant to be driven from a single
/// thread:
///
/// ```no_run
/// # fn main() -> switchyard::Result<()> {
/// let mut manager = switchyard::ConnectionManager::bind(("0.0.0.0", 21094), Default::default())?;
///
/// loop {
///     manager.drain_socket()?;
///     manager.sync();
///
///     while let Some(packet_ref) = manager.get_next() {
///         if let Some(packet) = manager.received(packet_ref) {
///             println!("{:?} from {}", packet.connection(), packet.sender_addr());
///         }
///         manager.release(packet_ref)?;
///     }
/// }
/// # }
/// ```
pub struct ConnectionManager {
    // Saved configuration
    config: Config,
    // State shared with the receiver
    shared: Arc<Shared>,
    // Present until moved out with take_receiver
    receiver: Option<Receiver>,
    // Cached from socket initialization
    local_addr: Option<net::SocketAddr>,
    // Derives sender keys, identical to the receiver's
    sender_key_hasher: SenderKeyHasher,
    transmitter: Transmitter,
    // Packets moved over from the worker queue, in arrival order
    synced_queue: VecDeque<Box<ReceivedPacket>>,
    // Packets handed out by get_next
    received: Leases<ReceivedPacket>,
    // Released packets, returned to the pool during the next sync
    to_be_returned: Vec<Box<ReceivedPacket>>,
    // Always-allocated buffer of notices being answered
    notice_buffer: Vec<ErrorNotice>,
    // Outbound packets
    sent_pool: Pool<SentPacket>,
    sent: Leases<SentPacket>,
    // Always-allocated serialization buffer
    send_buffer: Vec<u8>,
}

impl ConnectionManager {
    /// Binds a UDP socket at the provided address and returns a new manager for it.
    pub fn bind<A>(bind_addr: A, config: Config) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate()?;

        let (socket_tx, socket_rx) = socket::new(bind_addr, config.datagram_size_max)?;

        Self::with_socket(socket_tx, socket_rx, config)
    }

    /// Creates a manager over arbitrary socket halves.
    pub fn with_socket<T, R>(socket_tx: T, socket_rx: R, config: Config) -> Result<Self>
    where
        T: DatagramTx + 'static,
        R: DatagramRx + 'static,
    {
        config.validate()?;

        let table = ConnectionTable::new(
            config.lookup_capacity_initial,
            config.connection_count_max,
            Box::new(rng_from_seed(config.seed, 0)),
        );

        let shared = Arc::new(Mutex::new(SharedState {
            table,
            pool: Pool::new(),
            worker_queue: VecDeque::new(),
            error_notices: Vec::new(),
        }));

        let sender_key_hasher = SenderKeyHasher::default();
        let local_addr = socket_rx.local_addr();

        let receiver = Receiver::new(
            Box::new(socket_rx),
            Arc::clone(&shared),
            &config,
            sender_key_hasher.clone(),
            #[cfg(debug_assertions)]
            LossSimulator::new(
                config.debug.receive_loss,
                rng_from_seed(config.seed, SEED_SALT_RECEIVE_LOSS),
            ),
        );

        let transmitter = Transmitter {
            socket_tx: Arc::new(socket_tx),
            #[cfg(debug_assertions)]
            loss: LossSimulator::new(
                config.debug.send_loss,
                rng_from_seed(config.seed, SEED_SALT_SEND_LOSS),
            ),
        };

        Ok(Self {
            config,
            shared,
            receiver: Some(receiver),
            local_addr,
            sender_key_hasher,
            transmitter,
            synced_queue: VecDeque::new(),
            received: Leases::new(),
            to_be_returned: Vec::new(),
            notice_buffer: Vec::new(),
            sent_pool: Pool::new(),
            sent: Leases::new(),
            send_buffer: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the local address of the underlying socket, if it has one.
    pub fn local_addr(&self) -> Option<net::SocketAddr> {
        self.local_addr
    }

    /// Moves the receive side out of the manager, e.g. onto an I/O thread. Returns `None` if
    /// it was already taken.
    pub fn take_receiver(&mut self) -> Option<Receiver> {
        self.receiver.take()
    }

    /// Reads and routes pending datagrams; see [`Receiver::drain_socket`].
    pub fn drain_socket(&mut self) -> Result<bool> {
        self.receiver
            .as_mut()
            .ok_or(Error::ReceiverDetached)?
            .drain_socket()
    }

    /// Makes packets accepted by the receiver available to [`ConnectionManager::get_next`],
    /// returns released packets to the pool and sends queued error replies.
    pub fn sync(&mut self) {
        {
            let ref mut state = *lock(&self.shared);

            self.synced_queue.extend(state.worker_queue.drain(..));

            for packet in self.to_be_returned.drain(..) {
                state.pool.restore(packet);
            }

            std::mem::swap(&mut state.error_notices, &mut self.notice_buffer);
        }

        let mut notices = std::mem::take(&mut self.notice_buffer);

        for notice in notices.drain(..) {
            let packet = ErrorPacket { code: notice.code };

            if let Err(err) =
                self.send_connectionless(&packet, &notice.addr, notice.local_id, notice.remote_id)
            {
                tracing::warn!(addr = %notice.addr, %err, "failed to send error reply");
            }
        }

        self.notice_buffer = notices;
    }

    /// Takes the oldest synchronized packet. The caller holds one reference to it and must
    /// pass the handle to [`ConnectionManager::release`] when done.
    pub fn get_next(&mut self) -> Option<ReceivedPacketRef> {
        let packet = self.synced_queue.pop_front()?;

        Some(ReceivedPacketRef(self.received.insert(packet)))
    }

    /// Number of synchronized packets not yet taken with `get_next`.
    pub fn queued_len(&self) -> usize {
        self.synced_queue.len()
    }

    pub fn received(&self, packet_ref: ReceivedPacketRef) -> Option<&ReceivedPacket> {
        self.received.get(packet_ref.0)
    }

    /// Adds a holder to a received packet and returns the new reference count.
    pub fn add_ref(&mut self, packet_ref: ReceivedPacketRef) -> Result<u32> {
        self.received.add_ref(packet_ref.0)
    }

    /// Number of holders of a received packet, `None` once it has been released.
    pub fn ref_count(&self, packet_ref: ReceivedPacketRef) -> Option<u32> {
        self.received.ref_count(packet_ref.0)
    }

    /// Drops a holder. The packet goes back to its pool during the `sync` following the
    /// release of its last holder.
    pub fn release(&mut self, packet_ref: ReceivedPacketRef) -> Result<()> {
        if let Some(packet) = self.received.release(packet_ref.0)? {
            self.to_be_returned.push(packet);
        }

        Ok(())
    }

    pub fn received_pool_stats(&self) -> PoolStats {
        let ref state = *lock(&self.shared);

        PoolStats {
            allocated: state.pool.allocated(),
            available: state.pool.available(),
            leased: self.received.len(),
        }
    }

    /// Assigns a fresh local ID to a new connection.
    pub fn allocate_connection(&mut self, sender_key: SenderKey) -> Result<ConnectionId> {
        let local_id = lock(&self.shared).table.allocate(sender_key)?;

        tracing::debug!(local_id, sender_key, "allocated connection");

        Ok(local_id)
    }

    /// Removes a connection. Its ID may be handed out again by a later allocation.
    ///
    /// Packets routed to the connection which have not been taken with `get_next` yet are
    /// discarded, so that a later connection reusing the ID never sees them. Packets already
    /// taken stay valid until released.
    pub fn free_connection(&mut self, local_id: ConnectionId) -> Result<ConnectionRecord> {
        let ref mut state = *lock(&self.shared);

        let record = state
            .table
            .release(local_id)
            .ok_or(Error::UnknownConnection(local_id))?;

        let discarded = discard_routed(&mut state.worker_queue, &mut state.pool, local_id)
            + discard_routed(&mut self.synced_queue, &mut state.pool, local_id);

        tracing::debug!(local_id, discarded, "freed connection");

        Ok(record)
    }

    /// Records the ID the peer assigned to a connection. Until this is called, only accept
    /// connection packets are routed to it.
    pub fn set_remote_id(&mut self, local_id: ConnectionId, remote_id: ConnectionId) -> Result<()> {
        lock(&self.shared).table.set_remote_id(local_id, remote_id)
    }

    pub fn lookup_by_local_id(&self, local_id: ConnectionId) -> Option<ConnectionRecord> {
        lock(&self.shared).table.get(local_id).copied()
    }

    pub fn lookup_by_sender_key(&self, sender_key: SenderKey) -> Option<ConnectionRecord> {
        lock(&self.shared).table.find_by_sender(sender_key).copied()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared).table.len()
    }

    /// Returns a snapshot of all active connections, in no particular order.
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        lock(&self.shared).table.iter().copied().collect()
    }

    /// Size of the connection lookup array.
    pub fn lookup_capacity(&self) -> usize {
        lock(&self.shared).table.capacity()
    }

    /// Derives the sender key used to tag packets from `addr`.
    pub fn sender_key(&self, addr: &net::SocketAddr) -> SenderKey {
        self.sender_key_hasher.compute(addr)
    }

    /// Picks the versions to answer a start connection request with, or `None` if the
    /// initiator shares no version with us.
    pub fn negotiate(&self, request: &StartConnectionPacket) -> Option<AcceptConnectionPacket> {
        let lowlevel_version = frame::LOWLEVEL_PROTOCOL_VERSIONS
            .lowest_common(&request.lowlevel_versions)?;
        let highlevel_version = self
            .config
            .highlevel_versions
            .lowest_common(&request.highlevel_versions)?;

        Some(AcceptConnectionPacket {
            lowlevel_version,
            highlevel_version,
        })
    }

    /// Writes a datagram to the socket. In debug builds it may be dropped silently, according
    /// to [`DebugSettings::send_loss`](crate::DebugSettings::send_loss).
    pub fn send_raw(&mut self, datagram: &[u8], addr: &net::SocketAddr) -> Result<()> {
        self.transmitter.send(datagram, addr)
    }

    /// Serializes a low-level header (signature, local ID, remote ID) followed by the packet
    /// body at the lowest supported low-level version, and sends it.
    pub fn send_connectionless<P>(
        &mut self,
        packet: &P,
        addr: &net::SocketAddr,
        local_id: ConnectionId,
        remote_id: ConnectionId,
    ) -> Result<()>
    where
        P: LowLevelPacket,
    {
        let mut buffer = std::mem::take(&mut self.send_buffer);
        buffer.clear();

        let wr = &mut frame::Writer::new(&mut buffer);
        serial::write_header(wr, packet.signature(), local_id, remote_id);
        packet.serialize(wr, frame::LOWLEVEL_PROTOCOL_VERSIONS.minimum);

        let result = self.transmitter.send(&buffer, addr);

        self.send_buffer = buffer;

        result
    }

    /// Rents an outbound packet with an empty body, holding one reference.
    pub fn rent_sent_packet(
        &mut self,
        target_addr: net::SocketAddr,
        connection: Option<ConnectionId>,
    ) -> SentPacketRef {
        let mut packet = self.sent_pool.rent();
        packet.reset(target_addr, connection);

        SentPacketRef(self.sent.insert(packet))
    }

    pub fn sent_packet(&self, packet_ref: SentPacketRef) -> Option<&SentPacket> {
        self.sent.get(packet_ref.0)
    }

    pub fn sent_packet_mut(&mut self, packet_ref: SentPacketRef) -> Option<&mut SentPacket> {
        self.sent.get_mut(packet_ref.0)
    }

    /// Sends the contents of a rented packet to its target. The packet stays rented.
    pub fn send_rented(&mut self, packet_ref: SentPacketRef) -> Result<()> {
        let packet = self.sent.get(packet_ref.0).ok_or(Error::StaleHandle)?;

        match packet.target_addr() {
            Some(addr) => self.transmitter.send(packet.content(), addr),
            None => Err(Error::StaleHandle),
        }
    }

    pub fn add_sent_ref(&mut self, packet_ref: SentPacketRef) -> Result<u32> {
        self.sent.add_ref(packet_ref.0)
    }

    /// Drops a holder of an outbound packet. The last holder returns it to the pool
    /// immediately.
    pub fn release_sent_packet(&mut self, packet_ref: SentPacketRef) -> Result<()> {
        if let Some(packet) = self.sent.release(packet_ref.0)? {
            self.sent_pool.restore(packet);
        }

        Ok(())
    }

    pub fn sent_pool_stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.sent_pool.allocated(),
            available: self.sent_pool.available(),
            leased: self.sent.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{signature, VersionRange};
    use crate::socket::memory;

    const PEER: ([u8; 4], u16) = ([10, 0, 0, 2], 4000);

    fn peer() -> net::SocketAddr {
        net::SocketAddr::from(PEER)
    }

    fn new_manager(config: Config) -> (ConnectionManager, memory::Handle) {
        let (tx, rx, handle) = memory::new();
        let manager = ConnectionManager::with_socket(tx, rx, config).unwrap();
        (manager, handle)
    }

    fn seeded() -> Config {
        Config {
            seed: Some(7),
            ..Default::default()
        }
    }

    fn datagram(signature: u16, sender_local: u16, sender_remote: u16, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let wr = &mut frame::Writer::new(&mut buf);
        serial::write_header(wr, signature, sender_local, sender_remote);
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (tx, rx, _) = memory::new();
        let config = Config {
            lookup_capacity_initial: 12,
            ..Default::default()
        };

        assert!(matches!(
            ConnectionManager::with_socket(tx, rx, config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn released_packets_return_on_sync() {
        let (mut manager, handle) = new_manager(seeded());

        handle.push(&datagram(signature::START_CONNECTION, 5, 0, &[]), peer());
        assert!(manager.drain_socket().unwrap());
        manager.sync();

        let packet_ref = manager.get_next().unwrap();
        assert_eq!(manager.received_pool_stats().leased, 1);

        manager.release(packet_ref).unwrap();
        assert_eq!(manager.received_pool_stats().available, 0);
        assert!(manager.received(packet_ref).is_none());

        manager.sync();
        let stats = manager.received_pool_stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.leased, 0);
    }

    #[test]
    fn double_release_is_stale() {
        let (mut manager, handle) = new_manager(seeded());

        handle.push(&datagram(signature::START_CONNECTION, 5, 0, &[]), peer());
        manager.drain_socket().unwrap();
        manager.sync();

        let packet_ref = manager.get_next().unwrap();
        assert_eq!(manager.add_ref(packet_ref).unwrap(), 2);
        manager.release(packet_ref).unwrap();
        assert_eq!(manager.ref_count(packet_ref), Some(1));
        manager.release(packet_ref).unwrap();
        assert_eq!(manager.ref_count(packet_ref), None);

        assert!(matches!(manager.release(packet_ref), Err(Error::StaleHandle)));
        assert!(matches!(manager.add_ref(packet_ref), Err(Error::StaleHandle)));
    }

    #[test]
    fn connection_lifecycle() {
        let (mut manager, _) = new_manager(seeded());
        let sender_key = manager.sender_key(&peer());

        let id = manager.allocate_connection(sender_key).unwrap();
        assert_ne!(id, 0);
        assert_eq!(manager.connection_count(), 1);

        manager.set_remote_id(id, 77).unwrap();

        let record = manager.lookup_by_local_id(id).unwrap();
        assert_eq!(record.remote_id, 77);
        assert_eq!(manager.lookup_by_sender_key(sender_key), Some(record));
        assert_eq!(manager.connections(), vec![record]);

        assert_eq!(manager.free_connection(id).unwrap(), record);
        assert!(manager.lookup_by_local_id(id).is_none());
        assert!(manager.lookup_by_sender_key(sender_key).is_none());
        assert!(matches!(
            manager.free_connection(id),
            Err(Error::UnknownConnection(freed)) if freed == id
        ));
    }

    #[test]
    fn detached_receiver() {
        let (mut manager, _) = new_manager(seeded());

        assert!(manager.take_receiver().is_some());
        assert!(manager.take_receiver().is_none());
        assert!(matches!(manager.drain_socket(), Err(Error::ReceiverDetached)));
    }

    #[test]
    fn send_connectionless_header_order() {
        let (mut manager, handle) = new_manager(seeded());

        let packet = AcceptConnectionPacket {
            lowlevel_version: 1,
            highlevel_version: 3,
        };
        manager.send_connectionless(&packet, &peer(), 0x0102, 0x0304).unwrap();

        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&*sent[0].0, &[0x8a, 0x02, 0x01, 0x02, 0x03, 0x04, 1, 3]);
        assert_eq!(sent[0].1, peer());
    }

    #[test]
    fn rented_packets_are_reused() {
        let (mut manager, handle) = new_manager(seeded());

        for round in 0..3u8 {
            let packet_ref = manager.rent_sent_packet(peer(), Some(9));

            let packet = manager.sent_packet_mut(packet_ref).unwrap();
            assert!(packet.content().is_empty());
            packet.content_mut().extend_from_slice(&[round; 8]);

            manager.send_rented(packet_ref).unwrap();
            assert_eq!(manager.add_sent_ref(packet_ref).unwrap(), 2);
            manager.release_sent_packet(packet_ref).unwrap();
            assert!(manager.sent_packet(packet_ref).is_some());
            manager.release_sent_packet(packet_ref).unwrap();
            assert!(manager.sent_packet(packet_ref).is_none());
        }

        assert_eq!(
            manager.sent_pool_stats(),
            PoolStats {
                allocated: 1,
                available: 1,
                leased: 0,
            }
        );
        assert_eq!(handle.take_sent().len(), 3);
    }

    #[test]
    fn negotiation() {
        let (manager, _) = new_manager(Config {
            highlevel_versions: VersionRange::new(2, 4),
            ..seeded()
        });

        let accept = manager
            .negotiate(&StartConnectionPacket {
                lowlevel_versions: VersionRange::new(1, 3),
                highlevel_versions: VersionRange::new(3, 9),
            })
            .unwrap();
        assert_eq!(accept.lowlevel_version, 1);
        assert_eq!(accept.highlevel_version, 3);

        assert!(manager
            .negotiate(&StartConnectionPacket {
                lowlevel_versions: VersionRange::new(1, 1),
                highlevel_versions: VersionRange::new(5, 6),
            })
            .is_none());
    }
}
