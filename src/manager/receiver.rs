use std::net::SocketAddr;
use std::sync::Arc;
use std::time;

use crate::config::ErrorReplyPolicy;
use crate::error::Result;
use crate::frame::{self, serial, signature, ErrorCode, ErrorPacket, LowLevelPacket};
use crate::sender_key::SenderKeyHasher;
use crate::socket::DatagramRx;
use crate::table::ConnectionId;

#[cfg(debug_assertions)]
use super::loss::LossSimulator;
use super::{lock, ErrorNotice, Shared, SharedState};

// Classifies datagrams and appends accepted ones to the producer queue
struct Router {
    shared: Arc<Shared>,
    sender_key_hasher: SenderKeyHasher,
    error_reply: ErrorReplyPolicy,
    error_reply_limit: usize,
    #[cfg(debug_assertions)]
    loss: LossSimulator,
}

/// Receive side of a [`ConnectionManager`](super::ConnectionManager).
///
/// A receiver starts out owned by its manager, which drives it through
/// [`ConnectionManager::drain_socket`](super::ConnectionManager::drain_socket). It can be
/// moved to an I/O thread with
/// [`ConnectionManager::take_receiver`](super::ConnectionManager::take_receiver), in which case
/// the manager's consumer side still sees its packets after each `sync`.
pub struct Receiver {
    // Socket receive handle
    socket_rx: Box<dyn DatagramRx>,
    // Maximum number of datagrams read per drain
    attempts_max: usize,
    router: Router,
}

impl Router {
    fn enqueue(
        &self,
        state: &mut SharedState,
        datagram: &[u8],
        signature: frame::Signature,
        sender_addr: SocketAddr,
        connection: Option<ConnectionId>,
    ) {
        let sender_key = self.sender_key_hasher.compute(&sender_addr);

        let mut packet = state.pool.rent();
        packet.fill(datagram, signature, sender_addr, sender_key, connection);

        state.worker_queue.push_back(packet);
    }

    fn reject(
        &self,
        state: &mut SharedState,
        header: &frame::Header,
        sender_addr: SocketAddr,
        code: ErrorCode,
    ) {
        if self.error_reply != ErrorReplyPolicy::Reply {
            tracing::trace!(
                %sender_addr,
                local_id = header.local_id,
                ?code,
                "dropped misrouted datagram"
            );
            return;
        }

        if state.error_notices.len() >= self.error_reply_limit {
            tracing::trace!(%sender_addr, "error reply limit reached, dropping notice");
            return;
        }

        // Echo both IDs so that the reply routes back to the sender's connection
        state.error_notices.push(ErrorNotice {
            addr: sender_addr,
            local_id: header.local_id,
            remote_id: header.remote_id,
            code,
        });
    }

    fn handle_datagram(&mut self, datagram: &[u8], sender_addr: SocketAddr) {
        if !serial::verify_minimum_size(datagram) {
            tracing::trace!(%sender_addr, len = datagram.len(), "dropped short datagram");
            return;
        }

        #[cfg(debug_assertions)]
        if self.loss.should_drop() {
            tracing::trace!(%sender_addr, "simulated receive loss");
            return;
        }

        let header = match serial::read_header(datagram) {
            Some(header) => header,
            None => return,
        };

        if header.signature == signature::START_CONNECTION {
            // Connectionless, the IDs are evaluated by whoever handles the handshake
            let ref mut state = *lock(&self.shared);
            self.enqueue(state, datagram, header.signature, sender_addr, None);
            return;
        }

        if header.local_id == 0 {
            if header.signature == signature::ERROR {
                let mut rd = frame::Reader::new(serial::payload(datagram));
                let version = frame::LOWLEVEL_PROTOCOL_VERSIONS.minimum;
                let code = ErrorPacket::deserialize(&mut rd, version).map(|packet| packet.code);

                tracing::warn!(%sender_addr, ?code, "received error packet without connection");
            }
            return;
        }

        let ref mut state = *lock(&self.shared);

        let verdict = match state.table.get(header.local_id) {
            None => Err(ErrorCode::UnknownConnection),
            // Accept connection is what tells us the remote ID in the first place
            Some(record)
                if record.remote_id != header.remote_id
                    && header.signature != signature::ACCEPT_CONNECTION =>
            {
                Err(ErrorCode::RemoteIdMismatch)
            }
            Some(_) => Ok(()),
        };

        match verdict {
            Ok(()) => {
                self.enqueue(
                    state,
                    datagram,
                    header.signature,
                    sender_addr,
                    Some(header.local_id),
                );
            }
            Err(code) => {
                if header.signature == signature::ERROR {
                    // Never answer an error with an error
                    tracing::trace!(
                        %sender_addr,
                        local_id = header.local_id,
                        "dropped error packet for unknown connection"
                    );
                } else {
                    self.reject(state, &header, sender_addr, code);
                }
            }
        }
    }
}

impl Receiver {
    pub(super) fn new(
        socket_rx: Box<dyn DatagramRx>,
        shared: Arc<Shared>,
        config: &crate::Config,
        sender_key_hasher: SenderKeyHasher,
        #[cfg(debug_assertions)] loss: LossSimulator,
    ) -> Self {
        Self {
            socket_rx,
            attempts_max: config.receive_attempts_max,
            router: Router {
                shared,
                sender_key_hasher,
                error_reply: config.error_reply,
                error_reply_limit: config.error_reply_limit,
                #[cfg(debug_assertions)]
                loss,
            },
        }
    }

    // Reads and routes up to `limit` datagrams. Returns whether any were read.
    fn drain_up_to(&mut self, limit: usize) -> Result<bool> {
        for attempt in 0..limit {
            match self.socket_rx.try_recv()? {
                Some((datagram, sender_addr)) => {
                    self.router.handle_datagram(datagram, sender_addr);
                }
                None => {
                    // Nothing left, report whether anything arrived at all
                    return Ok(attempt > 0);
                }
            }
        }

        Ok(limit > 0)
    }

    /// Reads up to the configured number of datagrams without blocking and routes them.
    ///
    /// Returns whether at least one datagram was read. Socket errors other than "would block"
    /// are returned as [`Error::Io`](crate::Error::Io).
    pub fn drain_socket(&mut self) -> Result<bool> {
        self.drain_up_to(self.attempts_max)
    }

    /// Waits up to `timeout` for a datagram, then drains the socket as in
    /// [`Receiver::drain_socket`]. The datagram waited for counts towards the per-call limit.
    pub fn wait_and_drain(&mut self, timeout: Option<time::Duration>) -> Result<bool> {
        match self.socket_rx.wait(timeout)? {
            Some((datagram, sender_addr)) => {
                self.router.handle_datagram(datagram, sender_addr);
            }
            None => return Ok(false),
        }

        self.drain_up_to(self.attempts_max - 1)?;

        Ok(true)
    }
}
