//! The user-visible socket API: a BSD-shaped façade over the descriptor
//! table, wiring argument validation to the protocol engine underneath.
//!
//! Validation happens before any state is touched; a call that fails leaves
//! the table exactly as it was.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use log::trace;
use once_cell::sync::Lazy;
use slotmap::SlotMap;

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::listener::Listener;
use crate::reactor::{HandlerKind, Reactor};
use crate::{Error, Result};

/// Largest accepted backlog; larger requests saturate here.
const MAX_BACKLOG: u16 = libc::SOMAXCONN as u16;
static_assertions::const_assert!(libc::SOMAXCONN <= u16::MAX as i32);

slotmap::new_key_type! {
    struct SocketKey;
}

/// An opaque handle into the socket table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Socket(SocketKey);

/// What a handle currently is. A socket progresses
/// Created → Bound → (Listening | Connected); `close` tears down whichever
/// variant is live.
enum SocketState {
    Created,
    Bound(Arc<Endpoint>),
    Listening(Arc<Listener>),
    Connected(Arc<Connection>),
}

static SOCKETS: Lazy<Mutex<SlotMap<SocketKey, SocketState>>> =
    Lazy::new(|| Mutex::new(SlotMap::with_key()));

/// Creates a new socket handle in the created state. The underlying endpoint
/// is not allocated until `bind` or `connect`.
pub fn socket() -> Socket {
    let key = SOCKETS.lock().unwrap().insert(SocketState::Created);
    let handle = Socket(key);
    trace!("created socket {handle:?}");
    handle
}

/// Allocates the underlying datagram endpoint and binds it to `addr`.
pub fn bind(socket: Socket, addr: Option<SocketAddr>) -> Result<()> {
    let addr = require_inet(addr)?;

    let mut table = SOCKETS.lock().unwrap();
    let state = table.get_mut(socket.0).ok_or(Error::BadHandle)?;
    if !matches!(state, SocketState::Created) {
        return Err(Error::OperationNotSupportedInState);
    }

    let endpoint = Endpoint::bind(SocketAddr::V4(addr)).map_err(|err| {
        trace!("bind({addr}) failed: {err}");
        Error::from_io(&err)
    })?;
    trace!("socket {socket:?} bound to {:?}", endpoint.local_addr().ok());
    *state = SocketState::Bound(Arc::new(endpoint));
    Ok(())
}

/// Starts accepting handshakes on a bound socket. `backlog` caps the queue
/// of completed-but-unaccepted connections; it must be nonzero and saturates
/// at the system maximum.
pub fn listen(socket: Socket, backlog: u32) -> Result<()> {
    if backlog == 0 {
        return Err(Error::InvalidArgument);
    }
    let backlog = backlog.min(u32::from(MAX_BACKLOG)) as u16;

    let reactor = Reactor::global()?;

    let mut table = SOCKETS.lock().unwrap();
    let state = table.get_mut(socket.0).ok_or(Error::BadHandle)?;
    let endpoint = match state {
        SocketState::Bound(endpoint) => Arc::clone(endpoint),
        _ => return Err(Error::OperationNotSupportedInState),
    };

    let listener = Listener::new(endpoint, backlog);
    let dispatch = Arc::clone(&listener);
    reactor
        .add_handler(
            HandlerKind::Listener,
            listener.endpoint(),
            Arc::new(move |event| Listener::on_event(&dispatch, event)),
        )
        .map_err(|err| {
            trace!("listener registration failed: {err}");
            Error::NoMemory
        })?;

    *state = SocketState::Listening(listener);
    Ok(())
}

/// Blocks until a peer completes its handshake, then returns the new
/// connected handle and the peer's address.
pub fn accept(socket: Socket) -> Result<(Socket, SocketAddr)> {
    let listener = {
        let table = SOCKETS.lock().unwrap();
        match table.get(socket.0).ok_or(Error::BadHandle)? {
            SocketState::Listening(listener) => Arc::clone(listener),
            _ => return Err(Error::OperationNotSupportedInState),
        }
    };

    let (handle, peer) = listener.wait_and_accept();
    Ok((handle, SocketAddr::V4(peer)))
}

/// Performs the active handshake toward `addr`, binding an ephemeral
/// endpoint first if the socket was never bound. Returns once the
/// connection is established.
pub fn connect(socket: Socket, addr: Option<SocketAddr>) -> Result<()> {
    let peer = require_inet(addr)?;

    let reactor = Reactor::global()?;

    let connection = {
        let mut table = SOCKETS.lock().unwrap();
        let state = table.get_mut(socket.0).ok_or(Error::BadHandle)?;
        let endpoint = match state {
            SocketState::Created => {
                let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
                Arc::new(Endpoint::bind(any).map_err(|err| {
                    trace!("implicit bind failed: {err}");
                    Error::from_io(&err)
                })?)
            }
            SocketState::Bound(endpoint) => Arc::clone(endpoint),
            _ => return Err(Error::OperationNotSupportedInState),
        };

        let connection = Connection::new(endpoint);
        let dispatch = Arc::clone(&connection);
        reactor
            .add_handler(
                HandlerKind::Connection,
                connection.endpoint(),
                Arc::new(move |event| dispatch.on_event(event)),
            )
            .map_err(|err| {
                trace!("connection registration failed: {err}");
                Error::NoMemory
            })?;

        *state = SocketState::Connected(Arc::clone(&connection));
        connection
    };

    connection.active_open(peer);
    connection.wait_established()
}

/// Copies bytes into the connection's send buffer, blocking while it is
/// full. Returns the number of bytes accepted.
pub fn send(socket: Socket, buf: &[u8]) -> Result<usize> {
    connected(socket)?.send(buf)
}

/// Blocks until at least one byte is available, then copies out as much as
/// fits in `buf`.
pub fn recv(socket: Socket, buf: &mut [u8]) -> Result<usize> {
    connected(socket)?.recv(buf)
}

/// Releases the handle and tears down whichever state it was in. Connections
/// are dropped abruptly; there is no graceful teardown exchange.
pub fn close(socket: Socket) -> Result<()> {
    let state = SOCKETS
        .lock()
        .unwrap()
        .remove(socket.0)
        .ok_or(Error::BadHandle)?;

    match state {
        SocketState::Created | SocketState::Bound(_) => {}
        SocketState::Listening(listener) => {
            if let Ok(reactor) = Reactor::global() {
                reactor.remove_handler(listener.handler_id());
            }
        }
        SocketState::Connected(connection) => {
            if let Ok(reactor) = Reactor::global() {
                reactor.remove_handler(connection.handler_id());
            }
        }
    }
    trace!("closed socket {socket:?}");
    Ok(())
}

/// Mints a handle for a connection the listener established passively. Runs
/// on the reactor thread from the established-callback.
pub(crate) fn install_connection(connection: Arc<Connection>) -> Socket {
    let key = SOCKETS
        .lock()
        .unwrap()
        .insert(SocketState::Connected(connection));
    Socket(key)
}

fn connected(socket: Socket) -> Result<Arc<Connection>> {
    let table = SOCKETS.lock().unwrap();
    match table.get(socket.0).ok_or(Error::BadHandle)? {
        SocketState::Connected(connection) => Ok(Arc::clone(connection)),
        _ => Err(Error::OperationNotSupportedInState),
    }
}

fn require_inet(addr: Option<SocketAddr>) -> Result<SocketAddrV4> {
    match addr {
        None => Err(Error::Fault),
        Some(SocketAddr::V4(addr)) => Ok(addr),
        Some(SocketAddr::V6(_)) => Err(Error::AddressFamilyUnsupported),
    }
}

/// The local address of the handle's endpoint, if it has one. Test-only
/// peek used by scenarios that bind to an ephemeral port.
#[cfg(test)]
pub(crate) fn local_addr(socket: Socket) -> Option<SocketAddr> {
    let table = SOCKETS.lock().unwrap();
    match table.get(socket.0)? {
        SocketState::Created => None,
        SocketState::Bound(endpoint) => endpoint.local_addr().ok(),
        SocketState::Listening(listener) => listener.endpoint().local_addr().ok(),
        SocketState::Connected(connection) => connection.endpoint().local_addr().ok(),
    }
}

/// Test-only peek at the peer address of a connected handle.
#[cfg(test)]
pub(crate) fn peer_addr(socket: Socket) -> Option<SocketAddrV4> {
    let table = SOCKETS.lock().unwrap();
    match table.get(socket.0)? {
        SocketState::Connected(connection) => connection.peer_addr(),
        _ => None,
    }
}
