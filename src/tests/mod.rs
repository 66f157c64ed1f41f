//! Scenario tests driving the public API over real loopback endpoints. The
//! reactor and the fault simulator are process-global, so every test that
//! opens sockets is serialized.

mod api;
mod simulation;

use std::net::{Ipv4Addr, SocketAddr};

use crate as rudp;
use crate::testing::Simulator;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Resets the fault simulator on construction and again on drop, so a
/// panicking test cannot leak its knobs into the next one.
struct SimGuard;

impl SimGuard {
    fn new() -> Self {
        Simulator::global().reset();
        SimGuard
    }

    fn sim(&self) -> &'static Simulator {
        Simulator::global()
    }
}

impl Drop for SimGuard {
    fn drop(&mut self) {
        Simulator::global().reset();
    }
}

/// A server listening on an ephemeral loopback port, a connected client and
/// the accepted server-side connection.
struct Pair {
    server: rudp::Socket,
    client: rudp::Socket,
    accepted: rudp::Socket,
}

impl Pair {
    fn establish() -> Self {
        init_logging();

        let server = rudp::socket();
        rudp::bind(server, Some(any_port())).unwrap();
        rudp::listen(server, 1).unwrap();

        let client = rudp::socket();
        rudp::connect(client, Some(loopback_addr_of(server))).unwrap();

        let (accepted, peer) = rudp::accept(server).unwrap();
        assert!(matches!(peer, SocketAddr::V4(v4) if v4.port() != 0));

        Pair {
            server,
            client,
            accepted,
        }
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        let _ = rudp::close(self.accepted);
        let _ = rudp::close(self.client);
        let _ = rudp::close(self.server);
    }
}

fn any_port() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

/// The loopback address a client should connect to for a bound socket.
fn loopback_addr_of(socket: rudp::Socket) -> SocketAddr {
    let port = crate::api::local_addr(socket)
        .expect("socket must be bound")
        .port();
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// `len` bytes cycling through the alphabet starting at `first`.
fn cycling(first: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| first + (i % 26) as u8).collect()
}

fn send_all(socket: rudp::Socket, data: &[u8]) {
    let mut offset = 0;
    while offset < data.len() {
        let sent = rudp::send(socket, &data[offset..]).unwrap();
        assert!(sent > 0, "send must make progress");
        offset += sent;
    }
}

fn recv_all(socket: rudp::Socket, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut received = 0;
    while received < len {
        let count = rudp::recv(socket, &mut data[received..]).unwrap();
        assert!(count > 0, "recv must make progress");
        received += count;
    }
    data
}
