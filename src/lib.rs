/*

Switchyard sits between a UDP socket and a set of logical connections. It does not deliver
anything reliably on its own; it decides which connection a datagram belongs to, owns the
identifiers used to make that decision, and moves packets from the receive side to the
application without allocating per packet.

# Low-level header

Every datagram starts with a 16-bit signature. Datagrams addressed to a connection follow it
with two 16-bit connection IDs, giving a minimum size of 6 bytes:

  +-----------+------------+-----------+---------
  | signature | remote id  | local id  | payload
  +-----------+------------+-----------+---------

The IDs are written from the sender's point of view (sender's local ID first), so the
receiver reads the first as its remote ID and the second as its local ID. All integers are in
network byte order.

# Connection IDs

Local IDs are 16-bit and nonzero. They are kept in an open-addressed array whose size is a
power of two, indexed by `id & (size - 1)`. Allocation picks a random candidate and walks
forward until the candidate's slot is empty, so a slot holds at most one ID and lookup is a
single array access. The array is grown before it would become more than 75% full:

  size 8, 5 IDs  -> allocate -> 6 >= 8 * 3/4 -> grow to 32, rehash, then allocate

Rehashing in place is safe because an occupant of old slot k can only move to a slot of the
form k + n * old_size, all of which lie in the newly added region.

Candidates are random rather than sequential so that a recently freed ID is unlikely to be
handed out again while a slow peer may still be sending to it.

# Receive path

The receiver reads at most a handful of datagrams per call, classifies each one and appends
accepted packets to a producer queue:

  start connection      -> deliver with no connection
  local id == 0         -> drop (error packets are logged)
  unknown local id      -> drop or reply with an error packet
  remote id mismatch    -> same as unknown, except for accept connection
  otherwise             -> deliver to the connection

Accept connection is exempt from the remote ID check because it is the packet which tells
this side the remote ID in the first place.

# Queue handoff

The receiver may run on its own thread. The connection table, the inbound packet pool and the
producer queue share a single mutex. The consumer calls `sync`, which under that mutex moves
the producer queue into the consumer queue and returns released packets to the pool. Packets
handed out by `get_next` carry a reference count; a packet whose count drops to zero is parked
until the next `sync`.

*/

mod config;
mod error;
pub mod frame;
mod manager;
mod packet;
mod pool;
mod sender_key;
pub mod socket;
mod table;

pub use config::{Config, DebugSettings, ErrorReplyPolicy};
pub use error::{Error, Result};
pub use manager::{ConnectionManager, PoolStats, Receiver};
pub use packet::{ReceivedPacket, ReceivedPacketRef, SentPacket, SentPacketRef};
pub use sender_key::SenderKeyHasher;
pub use table::{ConnectionId, ConnectionRecord, SenderKey};
