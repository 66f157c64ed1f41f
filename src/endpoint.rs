use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::testing::Simulator;

/// A nonblocking, message-oriented socket handle: the unreliable datagram
/// service everything above it is built on. Endpoints carry a process-unique
/// id so the reactor can address them in its handler registry.
///
/// Sends are routed through the fault-injection [`Simulator`]; receives are
/// untouched.
#[derive(Debug)]
pub(crate) struct Endpoint {
    socket: UdpSocket,
    id: u32,
}

static NEXT_ENDPOINT_ID: AtomicU32 = AtomicU32::new(0);

impl Endpoint {
    pub(crate) fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        Simulator::global().send_to(&self.socket, buf, to)
    }

    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
