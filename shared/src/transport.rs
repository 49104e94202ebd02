//! Datagram transports a [`Connection`](crate::connection::Connection) can
//! run over.
//!
//! Production code uses a non-blocking [`tokio::net::UdpSocket`]. Tests and
//! simulations use [`MemoryNetwork`], which delivers instantly inside one
//! thread and can drop datagrams through a filter.

use log::trace;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::UdpSocket;

pub trait Transport {
    /// Sends one datagram without blocking. `WouldBlock` means it was not sent.
    fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Receives one datagram without blocking; `Ok(None)` when none is waiting.
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for UdpSocket {
    fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        self.try_send_to(bytes, to).map(|_| ())
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.try_recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Receive errors an unconnected UDP socket raises for an earlier send, such
/// as an ICMP port unreachable from a peer that went away. The socket itself
/// stays usable.
pub fn is_transient_receive_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

/// Transient receive errors tolerated in one drain before giving up on it.
pub const MAX_TRANSIENT_ERRORS: usize = 64;

/// Returns `true` to drop a datagram travelling `from` → `to`.
pub type DropFilter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool>;

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    filter: Option<DropFilter>,
    delivered: u64,
    dropped: u64,
}

/// An in-process datagram network. Cloning shares the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an endpoint at `addr`. Datagrams sent to an address with no
    /// endpoint vanish, as they would over UDP.
    pub fn bind(&self, addr: SocketAddr) -> MemoryEndpoint {
        self.state.borrow_mut().inboxes.insert(addr, VecDeque::new());
        MemoryEndpoint {
            addr,
            network: self.clone(),
        }
    }

    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + 'static,
    {
        self.state.borrow_mut().filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.state.borrow_mut().filter = None;
    }

    pub fn delivered(&self) -> u64 {
        self.state.borrow().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.state.borrow().dropped
    }

    /// Injects raw bytes as if `from` had sent them.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        if let Some(inbox) = self.state.borrow_mut().inboxes.get_mut(&to) {
            inbox.push_back((from, bytes.to_vec()));
        }
    }
}

pub struct MemoryEndpoint {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl MemoryEndpoint {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Transport for MemoryEndpoint {
    fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        let mut guard = self.network.state.borrow_mut();
        let state = &mut *guard;

        if let Some(filter) = state.filter.as_mut() {
            if filter(self.addr, to, bytes) {
                trace!("memory network dropped {} bytes {} -> {}", bytes.len(), self.addr, to);
                state.dropped += 1;
                return Ok(());
            }
        }
        if let Some(inbox) = state.inboxes.get_mut(&to) {
            inbox.push_back((self.addr, bytes.to_vec()));
            state.delivered += 1;
        }
        Ok(())
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut state = self.network.state.borrow_mut();
        let Some((from, bytes)) = state.inboxes.get_mut(&self.addr).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.network.state.borrow_mut().inboxes.remove(&self.addr);
    }
}
