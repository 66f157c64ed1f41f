//! Fault injection for exercising the transport over hostile links.
//!
//! The [`Simulator`] is a process-global interposer on the datagram send
//! path. With all knobs at their defaults it is a pass-through; tests dial in
//! loss, corruption, duplication and latency to model a bad network. The
//! receive path is never touched, so a dropped packet is indistinguishable
//! from one lost by the link itself.

use std::borrow::Cow;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::trace;
use once_cell::sync::Lazy;
use rand::Rng;

#[derive(Copy, Clone, Debug, Default)]
struct Knobs {
    drop: f32,
    corruption: f32,
    duplication: f32,
    min_latency_ms: u16,
    max_latency_ms: u16,
}

pub struct Simulator {
    knobs: Mutex<Knobs>,
}

static SIMULATOR: Lazy<Simulator> = Lazy::new(|| Simulator {
    knobs: Mutex::new(Knobs::default()),
});

impl Simulator {
    pub fn global() -> &'static Simulator {
        &SIMULATOR
    }

    /// Restores the pass-through configuration.
    pub fn reset(&self) {
        *self.knobs.lock().unwrap() = Knobs::default();
    }

    /// Probability in `[0, 1]` that a send reports success without
    /// transmitting anything.
    pub fn set_drop(&self, probability: f32) {
        assert!((0.0..=1.0).contains(&probability));
        self.knobs.lock().unwrap().drop = probability;
    }

    /// Probability in `[0, 1]` that a transmitted datagram has one random
    /// bit flipped.
    pub fn set_corruption(&self, probability: f32) {
        assert!((0.0..=1.0).contains(&probability));
        self.knobs.lock().unwrap().corruption = probability;
    }

    /// Probability in `[0, 1]` that a transmitted datagram is sent a second
    /// time after a small random delay.
    pub fn set_duplication(&self, probability: f32) {
        assert!((0.0..=1.0).contains(&probability));
        self.knobs.lock().unwrap().duplication = probability;
    }

    /// Uniform per-send latency window. The sending thread sleeps for the
    /// drawn duration, which also models head-of-line blocking on a slow
    /// link.
    pub fn set_latency(&self, min_ms: u16, max_ms: u16) {
        assert!(min_ms <= max_ms);
        let mut knobs = self.knobs.lock().unwrap();
        knobs.min_latency_ms = min_ms;
        knobs.max_latency_ms = max_ms;
    }

    pub(crate) fn send_to(
        &self,
        socket: &UdpSocket,
        buf: &[u8],
        to: SocketAddr,
    ) -> io::Result<usize> {
        let knobs = *self.knobs.lock().unwrap();
        let mut rng = rand::thread_rng();

        if knobs.max_latency_ms > 0 {
            let ms = rng.gen_range(knobs.min_latency_ms..=knobs.max_latency_ms);
            thread::sleep(Duration::from_millis(u64::from(ms)));
        }

        if knobs.drop > 0.0 && rng.gen::<f32>() < knobs.drop {
            trace!("dropping {} bytes to {to}", buf.len());
            return Ok(buf.len());
        }

        let wire: Cow<[u8]> = if knobs.corruption > 0.0 && rng.gen::<f32>() < knobs.corruption {
            let mut mangled = buf.to_vec();
            let index = rng.gen_range(0..mangled.len());
            mangled[index] ^= 1 << rng.gen_range(0..8);
            trace!("corrupting byte {index} of {} to {to}", mangled.len());
            Cow::Owned(mangled)
        } else {
            Cow::Borrowed(buf)
        };

        let sent = socket.send_to(&wire, to)?;

        if knobs.duplication > 0.0 && rng.gen::<f32>() < knobs.duplication {
            // re-send from a clone of the socket so the duplicate keeps the
            // original source address
            if let Ok(clone) = socket.try_clone() {
                let copy = wire.into_owned();
                let delay = Duration::from_millis(rng.gen_range(1..=50));
                thread::spawn(move || {
                    thread::sleep(delay);
                    if let Err(err) = clone.send_to(&copy, to) {
                        trace!("duplicate send to {to} failed: {err}");
                    }
                });
            }
        }

        Ok(sent)
    }
}
