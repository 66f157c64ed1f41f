//! Connects to the demo server on localhost and streams it the alphabet.

use std::net::{Ipv4Addr, SocketAddr};

fn main() -> rudp::Result<()> {
    env_logger::init();

    let client = rudp::socket();
    rudp::connect(
        client,
        Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 1234))),
    )?;
    println!("connected");

    let message: Vec<u8> = (0..5 * 1024).map(|i| b'A' + (i % 26) as u8).collect();
    let mut offset = 0;
    while offset < message.len() {
        offset += rudp::send(client, &message[offset..])?;
    }
    println!("sent {} bytes", message.len());

    rudp::close(client)?;
    Ok(())
}
