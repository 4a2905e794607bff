//! Datagram socket seams.
//!
//! A [`ConnectionManager`](crate::ConnectionManager) sends through a shared [`DatagramTx`] and
//! receives through an exclusively owned [`DatagramRx`], which may live on another thread.
//! [`new`] creates both halves over a non-blocking UDP socket; [`memory`] provides an
//! in-process pair for tests.

use std::io;
use std::net;
use std::sync::Arc;
use std::time;

const SOCKET_POLLING_KEY: usize = 0;

/// Sending half of a datagram socket.
pub trait DatagramTx: Send + Sync {
    fn send_to(&self, datagram: &[u8], addr: &net::SocketAddr) -> io::Result<()>;
}

/// Receiving half of a datagram socket.
pub trait DatagramRx: Send {
    /// If a datagram can be read without blocking, returns it. Returns `Ok(None)` otherwise.
    fn try_recv(&mut self) -> io::Result<Option<(&[u8], net::SocketAddr)>>;

    /// Blocks for up to `timeout` for a datagram and returns it. Returns `Ok(None)` if nothing
    /// arrived in the alloted time.
    fn wait(
        &mut self,
        _timeout: Option<time::Duration>,
    ) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
        self.try_recv()
    }

    fn local_addr(&self) -> Option<net::SocketAddr> {
        None
    }
}

pub struct SocketTx {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
}

pub struct SocketRx {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

impl DatagramTx for SocketTx {
    fn send_to(&self, datagram: &[u8], addr: &net::SocketAddr) -> io::Result<()> {
        let bytes_sent = self.socket.send_to(datagram, addr)?;

        if bytes_sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram was truncated",
            ));
        }

        Ok(())
    }
}

impl DatagramRx for SocketRx {
    fn try_recv(&mut self) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((datagram_len, sender_addr)) => {
                let datagram = &self.recv_buffer[..datagram_len];
                Ok(Some((datagram, sender_addr)))
            }
            Err(err) => match err.kind() {
                // The only acceptable error is WouldBlock, indicating no datagram
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            },
        }
    }

    fn wait(
        &mut self,
        timeout: Option<time::Duration>,
    ) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
        // Interest must be re-armed prior to each wait() call
        self.poller
            .modify(&*self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

        self.poller_events.clear();

        let n = self.poller.wait(&mut self.poller_events, timeout)?;

        if n > 0 {
            self.try_recv()
        } else {
            Ok(None)
        }
    }

    fn local_addr(&self) -> Option<net::SocketAddr> {
        Some(self.local_addr)
    }
}

/// Binds a non-blocking UDP socket and splits it into sending and receiving halves.
pub fn new<A>(bind_address: A, datagram_size_max: usize) -> io::Result<(SocketTx, SocketRx)>
where
    A: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;

    let local_addr = socket.local_addr()?;

    let poller = polling::Poller::new()?;

    // SAFETY: the socket is owned by `SocketRx` together with the poller, and is deleted from
    // the poller in `SocketRx::drop` before it can be closed
    unsafe {
        poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
    }

    let socket_rc = Arc::new(socket);

    let tx = SocketTx {
        socket: Arc::clone(&socket_rc),
    };

    let rx = SocketRx {
        socket: socket_rc,
        local_addr,
        poller,
        poller_events: polling::Events::new(),
        recv_buffer: vec![0; datagram_size_max].into_boxed_slice(),
    };

    Ok((tx, rx))
}

impl Drop for SocketRx {
    fn drop(&mut self) {
        let _ = self.poller.delete(&*self.socket);
    }
}

pub mod memory {
    //! In-process socket halves, driven through a [`Handle`].

    use std::collections::VecDeque;
    use std::io;
    use std::net;
    use std::sync::{Arc, Mutex};

    use super::{DatagramRx, DatagramTx};

    enum Incoming {
        Datagram(Box<[u8]>, net::SocketAddr),
        Error(io::ErrorKind),
    }

    type Inbox = Arc<Mutex<VecDeque<Incoming>>>;
    type Outbox = Arc<Mutex<Vec<(Box<[u8]>, net::SocketAddr)>>>;

    pub struct MemoryTx {
        outbox: Outbox,
    }

    pub struct MemoryRx {
        inbox: Inbox,
        recv_buffer: Vec<u8>,
    }

    /// Injects inbound datagrams and inspects outbound ones.
    #[derive(Clone)]
    pub struct Handle {
        inbox: Inbox,
        outbox: Outbox,
    }

    pub fn new() -> (MemoryTx, MemoryRx, Handle) {
        let inbox: Inbox = Default::default();
        let outbox: Outbox = Default::default();

        let tx = MemoryTx {
            outbox: Arc::clone(&outbox),
        };
        let rx = MemoryRx {
            inbox: Arc::clone(&inbox),
            recv_buffer: Vec::new(),
        };

        (tx, rx, Handle { inbox, outbox })
    }

    impl DatagramTx for MemoryTx {
        fn send_to(&self, datagram: &[u8], addr: &net::SocketAddr) -> io::Result<()> {
            self.outbox
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "outbox poisoned"))?
                .push((datagram.into(), *addr));
            Ok(())
        }
    }

    impl DatagramRx for MemoryRx {
        fn try_recv(&mut self) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
            let next = self
                .inbox
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "inbox poisoned"))?
                .pop_front();

            match next {
                Some(Incoming::Datagram(datagram, sender_addr)) => {
                    self.recv_buffer.clear();
                    self.recv_buffer.extend_from_slice(&datagram);
                    Ok(Some((self.recv_buffer.as_slice(), sender_addr)))
                }
                Some(Incoming::Error(kind)) => Err(kind.into()),
                None => Ok(None),
            }
        }
    }

    impl Handle {
        /// Queues a datagram to be received.
        pub fn push(&self, datagram: &[u8], sender_addr: net::SocketAddr) {
            if let Ok(mut inbox) = self.inbox.lock() {
                inbox.push_back(Incoming::Datagram(datagram.into(), sender_addr));
            }
        }

        /// Queues a receive error.
        pub fn push_error(&self, kind: io::ErrorKind) {
            if let Ok(mut inbox) = self.inbox.lock() {
                inbox.push_back(Incoming::Error(kind));
            }
        }

        /// Number of datagrams (and errors) not yet received.
        pub fn pending(&self) -> usize {
            self.inbox.lock().map(|inbox| inbox.len()).unwrap_or(0)
        }

        /// Removes and returns everything sent so far.
        pub fn take_sent(&self) -> Vec<(Box<[u8]>, net::SocketAddr)> {
            self.outbox
                .lock()
                .map(|mut outbox| std::mem::take(&mut *outbox))
                .unwrap_or_default()
        }
    }
}
