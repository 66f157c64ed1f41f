//! Stream integrity over hostile links, driven through the fault simulator.
//! The handshake runs on a clean link (the fixtures establish first, as the
//! knobs are meant to stress the data path), then each scenario dials in its
//! faults.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_test::serial;

use super::*;

const MESSAGE_BYTES: usize = 5 * 1024;

#[test]
#[serial]
fn packet_loss_30() {
    let pair = Pair::establish();
    let guard = SimGuard::new();
    guard.sim().set_drop(0.3);

    let data = cycling(b'A', MESSAGE_BYTES);
    send_all(pair.client, &data);
    let received = recv_all(pair.accepted, MESSAGE_BYTES);

    assert_eq!(received, data);
}

#[test]
#[serial]
fn latency_1000_to_5000() {
    let pair = Pair::establish();
    let guard = SimGuard::new();
    guard.sim().set_latency(1000, 5000);

    let started = Instant::now();
    let data = cycling(b'A', MESSAGE_BYTES);
    send_all(pair.client, &data);
    let received = recv_all(pair.accepted, MESSAGE_BYTES);

    assert_eq!(received, data);
    assert!(
        started.elapsed().as_millis() > 1000,
        "a second of injected latency cannot be invisible"
    );
}

#[test]
#[serial]
fn packet_loss_30_latency_1000_to_5000() {
    let pair = Pair::establish();
    let guard = SimGuard::new();
    guard.sim().set_drop(0.3);
    guard.sim().set_latency(1000, 5000);

    let data = cycling(b'A', MESSAGE_BYTES);
    send_all(pair.client, &data);
    let received = recv_all(pair.accepted, MESSAGE_BYTES);

    assert_eq!(received, data);
}

#[test]
#[serial]
fn handshake_completes_under_loss() {
    init_logging();
    let guard = SimGuard::new();
    guard.sim().set_drop(0.3);

    let server = rudp::socket();
    rudp::bind(server, Some(any_port())).unwrap();
    rudp::listen(server, 1).unwrap();

    let client = rudp::socket();
    rudp::connect(client, Some(loopback_addr_of(server))).unwrap();
    let (accepted, _) = rudp::accept(server).unwrap();

    // the link is still lossy; a small transfer proves the pair is usable
    let data = cycling(b'A', 1024);
    send_all(client, &data);
    assert_eq!(recv_all(accepted, data.len()), data);

    rudp::close(accepted).unwrap();
    rudp::close(client).unwrap();
    rudp::close(server).unwrap();
}

#[test]
#[serial]
fn duplication_never_delivers_a_byte_twice() {
    let pair = Pair::establish();
    let guard = SimGuard::new();
    guard.sim().set_duplication(1.0);

    let data = cycling(b'A', 2048);
    send_all(pair.client, &data);
    let received = recv_all(pair.accepted, data.len());
    assert_eq!(received, data);

    // the next byte of the stream must line up exactly; any duplicate
    // delivery above would have shifted it
    send_all(pair.client, b"Z");
    let tail = recv_all(pair.accepted, 1);
    assert_eq!(tail, b"Z");
}

#[test]
#[serial]
fn randomized_fault_sweep() {
    let mut rng = StdRng::seed_from_u64(0x52554450);

    for round in 0..3 {
        let drop = rng.gen_range(0.0..0.3f32);
        let duplication = rng.gen_range(0.0..0.5f32);
        let max_latency = rng.gen_range(0..40u16);
        let sizes = [1usize, 1023, 1024, 1025, 3072];
        let len = sizes[rng.gen_range(0..sizes.len())];

        let pair = Pair::establish();
        let guard = SimGuard::new();
        guard.sim().set_drop(drop);
        guard.sim().set_duplication(duplication);
        guard.sim().set_latency(0, max_latency);

        let data = cycling(b'A', len);
        send_all(pair.client, &data);
        let received = recv_all(pair.accepted, len);

        assert_eq!(
            received, data,
            "round {round}: drop={drop} duplication={duplication} \
             max_latency={max_latency}ms len={len}"
        );
    }
}
