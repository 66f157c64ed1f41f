//! Argument and state validation across the socket API: every entry point
//! rejects bad input before touching any state.

use std::net::{Ipv6Addr, SocketAddr};

use serial_test::serial;

use super::*;
use crate::Error;

#[test]
#[serial]
fn bind_rejects_null_addr_and_leaves_socket_usable() {
    init_logging();
    let socket = rudp::socket();

    assert_eq!(rudp::bind(socket, None), Err(Error::Fault));

    // still in the created state, so a proper bind succeeds
    rudp::bind(socket, Some(any_port())).unwrap();
    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn bind_rejects_non_inet_family() {
    init_logging();
    let socket = rudp::socket();

    let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, 0));
    assert_eq!(rudp::bind(socket, Some(v6)), Err(Error::AddressFamilyUnsupported));

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn bind_rejects_stale_handle() {
    init_logging();
    let socket = rudp::socket();
    rudp::close(socket).unwrap();

    assert_eq!(rudp::bind(socket, Some(any_port())), Err(Error::BadHandle));
}

#[test]
#[serial]
fn bind_rejects_double_bind() {
    init_logging();
    let socket = rudp::socket();
    rudp::bind(socket, Some(any_port())).unwrap();

    assert_eq!(
        rudp::bind(socket, Some(any_port())),
        Err(Error::OperationNotSupportedInState)
    );

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn bind_reports_address_in_use() {
    init_logging();
    let first = rudp::socket();
    rudp::bind(first, Some(any_port())).unwrap();
    let taken = crate::api::local_addr(first).unwrap();

    let second = rudp::socket();
    assert_eq!(rudp::bind(second, Some(taken)), Err(Error::AddressInUse));

    rudp::close(second).unwrap();
    rudp::close(first).unwrap();
}

#[test]
#[serial]
fn listen_requires_a_bound_socket() {
    init_logging();
    let socket = rudp::socket();

    assert_eq!(
        rudp::listen(socket, 1),
        Err(Error::OperationNotSupportedInState)
    );

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn listen_rejects_zero_backlog() {
    init_logging();
    let socket = rudp::socket();
    rudp::bind(socket, Some(any_port())).unwrap();

    assert_eq!(rudp::listen(socket, 0), Err(Error::InvalidArgument));

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn listen_saturates_oversized_backlog() {
    init_logging();
    let socket = rudp::socket();
    rudp::bind(socket, Some(any_port())).unwrap();

    rudp::listen(socket, libc::SOMAXCONN as u32 + 1).unwrap();

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn listen_rejects_listening_twice() {
    init_logging();
    let socket = rudp::socket();
    rudp::bind(socket, Some(any_port())).unwrap();
    rudp::listen(socket, 1).unwrap();

    assert_eq!(
        rudp::listen(socket, 1),
        Err(Error::OperationNotSupportedInState)
    );

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn accept_requires_a_listening_socket() {
    init_logging();

    let created = rudp::socket();
    assert_eq!(
        rudp::accept(created).map(|_| ()),
        Err(Error::OperationNotSupportedInState)
    );
    rudp::close(created).unwrap();

    let bound = rudp::socket();
    rudp::bind(bound, Some(any_port())).unwrap();
    assert_eq!(
        rudp::accept(bound).map(|_| ()),
        Err(Error::OperationNotSupportedInState)
    );
    rudp::close(bound).unwrap();
}

#[test]
#[serial]
fn accept_rejects_a_connected_socket() {
    let pair = Pair::establish();

    assert_eq!(
        rudp::accept(pair.client).map(|_| ()),
        Err(Error::OperationNotSupportedInState)
    );
}

#[test]
#[serial]
fn accept_fills_in_the_peer_address() {
    let pair = Pair::establish();

    // the accepted connection's peer is the client's ephemeral endpoint
    let client_local = crate::api::local_addr(pair.client).unwrap();
    let accepted_peer = crate::api::peer_addr(pair.accepted).unwrap();
    assert_eq!(accepted_peer.port(), client_local.port());
}

#[test]
#[serial]
fn connect_rejects_null_addr() {
    init_logging();
    let socket = rudp::socket();

    assert_eq!(rudp::connect(socket, None), Err(Error::Fault));

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn connect_rejects_non_inet_family() {
    init_logging();
    let socket = rudp::socket();

    let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, 1234));
    assert_eq!(
        rudp::connect(socket, Some(v6)),
        Err(Error::AddressFamilyUnsupported)
    );

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn connect_rejects_a_listening_socket() {
    init_logging();
    let socket = rudp::socket();
    rudp::bind(socket, Some(any_port())).unwrap();
    rudp::listen(socket, 1).unwrap();

    let target = loopback_addr_of(socket);
    assert_eq!(
        rudp::connect(socket, Some(target)),
        Err(Error::OperationNotSupportedInState)
    );

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn connect_rejects_connecting_twice() {
    let pair = Pair::establish();

    let target = loopback_addr_of(pair.server);
    assert_eq!(
        rudp::connect(pair.client, Some(target)),
        Err(Error::OperationNotSupportedInState)
    );
}

#[test]
#[serial]
fn connect_succeeds_from_an_explicitly_bound_socket() {
    init_logging();
    let server = rudp::socket();
    rudp::bind(server, Some(any_port())).unwrap();
    rudp::listen(server, 1).unwrap();

    let client = rudp::socket();
    rudp::bind(client, Some(any_port())).unwrap();
    rudp::connect(client, Some(loopback_addr_of(server))).unwrap();

    let (accepted, _) = rudp::accept(server).unwrap();

    rudp::close(accepted).unwrap();
    rudp::close(client).unwrap();
    rudp::close(server).unwrap();
}

#[test]
#[serial]
fn send_requires_a_connected_socket() {
    init_logging();

    let created = rudp::socket();
    assert_eq!(
        rudp::send(created, b"hello"),
        Err(Error::OperationNotSupportedInState)
    );
    rudp::close(created).unwrap();

    let bound = rudp::socket();
    rudp::bind(bound, Some(any_port())).unwrap();
    assert_eq!(
        rudp::send(bound, b"hello"),
        Err(Error::OperationNotSupportedInState)
    );
    rudp::close(bound).unwrap();
}

#[test]
#[serial]
fn recv_requires_a_connected_socket() {
    init_logging();
    let socket = rudp::socket();
    rudp::bind(socket, Some(any_port())).unwrap();
    rudp::listen(socket, 1).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(
        rudp::recv(socket, &mut buf),
        Err(Error::OperationNotSupportedInState)
    );

    rudp::close(socket).unwrap();
}

#[test]
#[serial]
fn zero_length_transfers_are_noops() {
    let pair = Pair::establish();

    assert_eq!(rudp::send(pair.client, b""), Ok(0));
    assert_eq!(rudp::recv(pair.accepted, &mut []), Ok(0));
}

#[test]
#[serial]
fn close_rejects_a_stale_handle() {
    init_logging();
    let socket = rudp::socket();

    rudp::close(socket).unwrap();
    assert_eq!(rudp::close(socket), Err(Error::BadHandle));
}
