//! Accepts one connection on port 1234 and prints whatever arrives.

use std::net::{Ipv4Addr, SocketAddr};

fn main() -> rudp::Result<()> {
    env_logger::init();

    let server = rudp::socket();
    rudp::bind(server, Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 1234))))?;
    rudp::listen(server, 1)?;
    println!("listening on 0.0.0.0:1234");

    let (peer, peer_addr) = rudp::accept(server)?;
    println!("accepted connection from {peer_addr}");

    // teardown is abrupt (no goodbye exchange), so expect a fixed amount
    const EXPECTED: usize = 5 * 1024;
    let mut total = 0usize;
    let mut buf = [0u8; 4096];
    while total < EXPECTED {
        let received = rudp::recv(peer, &mut buf)?;
        total += received;
        println!(
            "received {received} bytes ({total} total): {:?}",
            String::from_utf8_lossy(&buf[..received.min(64)])
        );
    }
    println!("done");

    rudp::close(peer)?;
    rudp::close(server)?;
    Ok(())
}
