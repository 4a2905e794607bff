//! Low-level packet framing.
//!
//! Everything which is sent or received by a [`ConnectionManager`](crate::ConnectionManager)
//! begins with the header described here. The payload following the header belongs to the
//! connection layer, except for the handful of connection-management packets defined in this
//! module.

pub mod serial;

use crate::table::ConnectionId;

pub use serial::{Reader, Writer};

/// 16-bit tag identifying the type of a low-level packet.
pub type Signature = u16;

/// Signatures reserved by the connection layer. These must stay identical across every peer
/// of a deployment.
pub mod signature {
    use super::Signature;

    pub const START_CONNECTION: Signature = 0x8a01;
    pub const ACCEPT_CONNECTION: Signature = 0x8a02;
    pub const ERROR: Signature = 0x8aff;
}

/// Size of the signature field.
pub const SIGNATURE_SIZE: usize = 2;

/// Size of a header carrying both connection IDs. Anything shorter is discarded.
pub const HEADER_SIZE: usize = SIGNATURE_SIZE + 2 + 2;

/// Low-level protocol versions supported by this implementation.
pub const LOWLEVEL_PROTOCOL_VERSIONS: VersionRange<u8> = VersionRange::new(1, 1);

/// A decoded low-level header, as seen by the receiver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub signature: Signature,
    /// The sender's local ID, i.e. the receiver's remote ID.
    pub remote_id: ConnectionId,
    /// The ID the sender addressed, i.e. the receiver's local ID.
    pub local_id: ConnectionId,
}

/// Inclusive range of protocol versions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VersionRange<T> {
    pub minimum: T,
    pub maximum: T,
}

impl<T> VersionRange<T>
where
    T: Copy + Ord,
{
    pub const fn new(minimum: T, maximum: T) -> Self {
        Self { minimum, maximum }
    }

    /// Returns the range of versions supported by both sides, if any.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let minimum = self.minimum.max(other.minimum);
        let maximum = self.maximum.min(other.maximum);

        if minimum <= maximum {
            Some(Self { minimum, maximum })
        } else {
            None
        }
    }

    /// Returns the lowest version supported by both sides.
    pub fn lowest_common(&self, other: &Self) -> Option<T> {
        self.intersect(other).map(|range| range.minimum)
    }
}

/// A connection-management packet with a fixed signature.
///
/// `serialize` writes only the body; the header is written by the send path.
pub trait LowLevelPacket {
    const SIGNATURE: Signature;

    fn serialize(&self, wr: &mut Writer, version: u8);

    fn deserialize(rd: &mut Reader, version: u8) -> Option<Self>
    where
        Self: Sized;

    fn signature(&self) -> Signature {
        Self::SIGNATURE
    }
}

/// Sent by a peer to open a connection. Its header carries the sender's freshly allocated
/// local ID and a zero remote ID.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartConnectionPacket {
    pub lowlevel_versions: VersionRange<u8>,
    pub highlevel_versions: VersionRange<u8>,
}

/// Reply to [`StartConnectionPacket`]. Its header tells the initiator which ID the responder
/// allocated for the connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcceptConnectionPacket {
    pub lowlevel_version: u8,
    pub highlevel_version: u8,
}

/// Reason carried by an [`ErrorPacket`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// The addressed local ID is not in use.
    UnknownConnection,
    /// The addressed connection belongs to a different remote ID.
    RemoteIdMismatch,
    /// A code this implementation does not know.
    Other(u32),
}

/// Tells a peer that one of its packets could not be routed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorPacket {
    pub code: ErrorCode,
}
