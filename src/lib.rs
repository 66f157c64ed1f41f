//! A reliable, connection-oriented transport over unreliable datagrams, with
//! a blocking, BSD-like socket API: listeners accept handshakes, connections
//! deliver a byte stream in order and exactly once, even across a link that
//! drops, reorders, duplicates or delays packets.
//!
//! Internally a single reactor thread polls readiness across every endpoint
//! and drives the whole protocol — three-way handshake, sequence-numbered
//! reassembly, cumulative acknowledgment and timed retransmission — while
//! user threads block on per-connection condition variables.
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddr};
//!
//! # fn main() -> rudp::Result<()> {
//! let server = rudp::socket();
//! rudp::bind(server, Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 1234))))?;
//! rudp::listen(server, 16)?;
//!
//! let client = rudp::socket();
//! rudp::connect(client, Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 1234))))?;
//!
//! let (peer, peer_addr) = rudp::accept(server)?;
//! println!("accepted {peer_addr}");
//!
//! rudp::send(client, b"hello")?;
//! let mut buf = [0u8; 16];
//! let received = rudp::recv(peer, &mut buf)?;
//! assert_eq!(&buf[..received], b"hello");
//!
//! rudp::close(client)?;
//! rudp::close(peer)?;
//! rudp::close(server)?;
//! # Ok(())
//! # }
//! ```
//!
//! The [`testing`] module exposes a process-global fault injector for
//! exercising the transport over hostile links.

mod api;
mod connection;
mod endpoint;
mod error;
mod listener;
mod packet;
mod reactor;
mod state;

pub mod testing;

#[cfg(test)]
mod tests;

pub use api::{accept, bind, close, connect, listen, recv, send, socket, Socket};
pub use error::{Error, Result};
