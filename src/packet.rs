use std::net::SocketAddr;

use crate::frame::Signature;
use crate::pool::Lease;
use crate::table::{ConnectionId, SenderKey};

/// An inbound datagram which passed classification.
pub struct ReceivedPacket {
    content: Vec<u8>,
    signature: Signature,
    sender_addr: SocketAddr,
    sender_key: SenderKey,
    connection: Option<ConnectionId>,
}

impl Default for ReceivedPacket {
    fn default() -> Self {
        Self {
            content: Vec::new(),
            signature: 0,
            sender_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            sender_key: 0,
            connection: None,
        }
    }
}

impl ReceivedPacket {
    /// Overwrites every field of a freshly rented packet. The content buffer keeps its
    /// capacity.
    pub(crate) fn fill(
        &mut self,
        datagram: &[u8],
        signature: Signature,
        sender_addr: SocketAddr,
        sender_key: SenderKey,
        connection: Option<ConnectionId>,
    ) {
        self.content.clear();
        self.content.extend_from_slice(datagram);
        self.signature = signature;
        self.sender_addr = sender_addr;
        self.sender_key = sender_key;
        self.connection = connection;
    }

    /// The complete datagram, header included.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn sender_addr(&self) -> &SocketAddr {
        &self.sender_addr
    }

    pub fn sender_key(&self) -> SenderKey {
        self.sender_key
    }

    /// The local connection this packet was routed to. `None` for connectionless packets
    /// (start connection).
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }
}

/// An outbound datagram kept around by a connection, e.g. for resending.
#[derive(Default)]
pub struct SentPacket {
    content: Vec<u8>,
    target_addr: Option<SocketAddr>,
    connection: Option<ConnectionId>,
}

impl SentPacket {
    /// Clears the packet for reuse. Must be called by the renter, the pool does not.
    pub fn reset(&mut self, target_addr: SocketAddr, connection: Option<ConnectionId>) {
        self.content.clear();
        self.target_addr = Some(target_addr);
        self.connection = connection;
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Buffer to serialize into; see [`frame::Writer`](crate::frame::Writer).
    pub fn content_mut(&mut self) -> &mut Vec<u8> {
        &mut self.content
    }

    pub fn target_addr(&self) -> Option<&SocketAddr> {
        self.target_addr.as_ref()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }
}

/// Handle to a [`ReceivedPacket`] handed out by
/// [`ConnectionManager::get_next`](crate::ConnectionManager::get_next). Each holder must
/// eventually pass it to [`ConnectionManager::release`](crate::ConnectionManager::release).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ReceivedPacketRef(pub(crate) Lease);

/// Handle to a [`SentPacket`] rented with
/// [`ConnectionManager::rent_sent_packet`](crate::ConnectionManager::rent_sent_packet).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SentPacketRef(pub(crate) Lease);
