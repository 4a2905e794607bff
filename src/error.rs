use std::io;

use thiserror::Error;

use crate::table::ConnectionId;

/// Errors reported by a [`ConnectionManager`](crate::ConnectionManager).
///
/// Malformed or misrouted datagrams are not errors; they are dropped by the receive path and
/// never surface here.
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying socket reported a failure.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No free connection ID could be found. Indicates a saturated or corrupted lookup table.
    #[error("connection table is full ({0} connections)")]
    TableFull(usize),

    /// The configured maximum number of connections has been reached.
    #[error("connection limit of {0} reached")]
    Capacity(usize),

    /// No live connection holds the given ID.
    #[error("unknown connection id {0}")]
    UnknownConnection(ConnectionId),

    /// The packet handle was already released back to its pool.
    #[error("packet handle is stale")]
    StaleHandle,

    /// The receiver was moved out of the manager with `take_receiver`.
    #[error("receiver has been detached from the connection manager")]
    ReceiverDetached,
}

pub type Result<T> = std::result::Result<T, Error>;
