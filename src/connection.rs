use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};
use rand::Rng;

use crate::endpoint::Endpoint;
use crate::packet::{self, Packet, PacketFlags, MAX_DATA_BYTES};
use crate::reactor::{self, Event, HandlerKind, Reactor};
use crate::state::{ConnState, StateMachine};
use crate::{Error, Result};

/// Age at which an unacknowledged packet is sent again.
const RETRANSMIT_TIME: Duration = Duration::from_secs(5);

/// Retransmission attempts before the connection is declared dead.
const MAX_RETRANSMITS: u32 = 5;

/// Bytes the send buffer accepts before `send` blocks.
pub(crate) const MAX_SEND_BUFFER_BYTES: usize = 8 * MAX_DATA_BYTES;
static_assertions::const_assert!(MAX_SEND_BUFFER_BYTES >= 4 * MAX_DATA_BYTES);

/// Initial sequence numbers stay in the lower half of the space. Sequence
/// arithmetic is plain `u32` ordering, so this leaves at least 2 GiB of
/// stream before the numbers could wrap.
const ISN_CEILING: u32 = 1 << 31;

/// Ran when a passively-opened connection completes its handshake; installed
/// by the listener before `passive_open`, handed the learned peer address.
pub(crate) type EstablishedCallback = Box<dyn FnOnce(SocketAddrV4) + Send>;

/// An unacknowledged packet awaiting a cumulative ack, keyed in the sent map
/// by its sequence number. `to` is pinned at first transmission: a handshake
/// SYN keeps retargeting the listener's well-known address even though the
/// peer learned later is the spawned child endpoint.
struct SentRecord {
    packet: Packet,
    to: SocketAddrV4,
    sent_at: Instant,
    retransmits: u32,
}

/// A packet accepted into the reassembly map, waiting to become the next
/// in-order sequence number.
struct ReceivedRecord {
    packet: Packet,
    from: SocketAddrV4,
}

struct Shared {
    machine: StateMachine,
    /// Sequence number stamped on the next slot-consuming send.
    seqnum: u32,
    /// The next sequence number expected from the peer; doubles as the
    /// cumulative acknowledgment we advertise.
    acknum: u32,
    /// `None` until learned: set by `passive_open`, or adopted from the
    /// first SYN+ACK on the active side (which is how the ephemeral child
    /// port is discovered).
    peer: Option<SocketAddrV4>,
    sent: BTreeMap<u32, SentRecord>,
    received: BTreeMap<u32, ReceivedRecord>,
    send_buf: VecDeque<u8>,
    recv_buf: VecDeque<u8>,
    on_established: Option<EstablishedCallback>,
    /// Sticky fatal error; once set, user calls fail with it.
    error: Option<Error>,
    /// The emit phase owes the peer a cumulative acknowledgment.
    need_to_ack: bool,
}

/// A per-peer protocol engine: handshake state machine, sequence-numbered
/// reassembly, cumulative acknowledgment and timed retransmission over one
/// datagram endpoint.
///
/// The reactor thread drives the protocol through [`on_event`]; user threads
/// call [`send`], [`recv`] and the wait helpers. Both sides serialize on the
/// single mutex, and every waiter shares the single condvar, re-checking its
/// own predicate after wakeup.
///
/// [`on_event`]: Self::on_event
/// [`send`]: Self::send
/// [`recv`]: Self::recv
pub(crate) struct Connection {
    endpoint: Arc<Endpoint>,
    shared: Mutex<Shared>,
    cond: Condvar,
}

impl Connection {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            shared: Mutex::new(Shared {
                machine: StateMachine::new(),
                seqnum: rand::thread_rng().gen_range(0..ISN_CEILING),
                acknum: 0,
                peer: None,
                sent: BTreeMap::new(),
                received: BTreeMap::new(),
                send_buf: VecDeque::new(),
                recv_buf: VecDeque::new(),
                on_established: None,
                error: None,
                need_to_ack: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub(crate) fn handler_id(&self) -> u64 {
        reactor::handler_id(HandlerKind::Connection, self.endpoint.id())
    }

    #[cfg(test)]
    pub(crate) fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.shared.lock().unwrap().peer
    }

    pub(crate) fn set_established_callback(&self, callback: EstablishedCallback) {
        let mut shared = self.shared.lock().unwrap();
        assert!(
            shared.on_established.is_none(),
            "a connection takes at most one established-callback"
        );
        shared.on_established = Some(callback);
    }

    /// Reactor entry point. Ticks also run the receive path: readiness
    /// registration is edge-triggered, so the periodic drain picks up any
    /// datagrams that raced an early-terminated drain.
    pub(crate) fn on_event(&self, event: Event) {
        match event {
            Event::Readable => self.service_receive(),
            Event::Tick => {
                self.service_receive();
                self.service_transmit();
            }
        }
    }

    // -- handshake ----------------------------------------------------------

    /// Begins the client side of the handshake: transition to SynSent and
    /// emit the SYN toward `to`. The caller then blocks in
    /// [`wait_established`](Self::wait_established); the reactor finishes
    /// the handshake when the SYN+ACK arrives.
    pub(crate) fn active_open(&self, to: SocketAddrV4) {
        let mut shared = self.shared.lock().unwrap();
        assert!(
            shared.peer.is_none(),
            "active open requires a peer not yet learned"
        );
        shared.machine.transition(ConnState::SynSent);
        let flags = shared.machine.derive_flags();
        self.transmit_control(&mut shared, flags, to);
    }

    /// Begins the server side of the handshake for `syn`, received on the
    /// listener and replayed onto this connection's fresh endpoint: learn
    /// the peer, transition to SynRcvd and emit the SYN+ACK.
    pub(crate) fn passive_open(&self, peer: SocketAddrV4, syn: &Packet) {
        let mut shared = self.shared.lock().unwrap();
        assert!(
            shared.peer.is_none(),
            "passive open requires a peer not yet learned"
        );
        assert_eq!(
            syn.header.flags,
            PacketFlags::SYN,
            "passive open consumes exactly a SYN"
        );
        shared.acknum = syn.header.seqnum.wrapping_add(1);
        shared.peer = Some(peer);
        shared.machine.transition(ConnState::SynRcvd);
        let flags = shared.machine.derive_flags();
        self.transmit_control(&mut shared, flags, peer);
    }

    /// Blocks the calling user thread until the handshake completes or the
    /// connection fails.
    pub(crate) fn wait_established(&self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        loop {
            if let Some(error) = shared.error {
                return Err(error);
            }
            if shared.machine.current() == ConnState::Established {
                return Ok(());
            }
            shared = self.cond.wait(shared).unwrap();
        }
    }

    // -- user API -----------------------------------------------------------

    /// Copies up to buffer-space bytes into the send buffer, blocking while
    /// the buffer is full (or the handshake is still in flight). Returns the
    /// number of bytes accepted.
    pub(crate) fn send(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut shared = self.shared.lock().unwrap();
        loop {
            if let Some(error) = shared.error {
                return Err(error);
            }
            if shared.machine.current() == ConnState::Established
                && shared.send_buf.len() < MAX_SEND_BUFFER_BYTES
            {
                break;
            }
            shared = self.cond.wait(shared).unwrap();
        }
        let space = MAX_SEND_BUFFER_BYTES - shared.send_buf.len();
        let accepted = buf.len().min(space);
        shared.send_buf.extend(buf[..accepted].iter().copied());
        Ok(accepted)
    }

    /// Blocks until at least one byte is available, then copies out as much
    /// as fits. Buffered data is delivered even after a fatal error.
    pub(crate) fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut shared = self.shared.lock().unwrap();
        loop {
            if !shared.recv_buf.is_empty() {
                break;
            }
            if let Some(error) = shared.error {
                return Err(error);
            }
            shared = self.cond.wait(shared).unwrap();
        }
        let count = buf.len().min(shared.recv_buf.len());
        for (dst, src) in buf.iter_mut().zip(shared.recv_buf.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }

    // -- receive path (reactor thread) --------------------------------------

    /// Drains the endpoint, consumes whatever became in-order, then emits
    /// any owed control packet.
    fn service_receive(&self) {
        let mut shared = self.shared.lock().unwrap();

        if shared.error.is_some() {
            // drain and discard so the dead endpoint cannot hold readiness
            while let Ok(Some(_)) = packet::recv_datagram(&self.endpoint) {}
            return;
        }

        // drain: accept everything addressed to us into the reassembly map
        loop {
            match packet::recv_datagram(&self.endpoint) {
                Ok(Some((pkt, from))) => {
                    let SocketAddr::V4(from) = from else {
                        // only INET peers exist on this transport
                        continue;
                    };
                    if let Some(peer) = shared.peer {
                        if from != peer {
                            trace!("dropping packet from foreign sender {from}");
                            continue;
                        }
                    }

                    // the active opener cannot know the peer's initial
                    // sequence number until the SYN+ACK arrives; adopt it
                    if shared.machine.current() == ConnState::SynSent
                        && pkt
                            .header
                            .flags
                            .contains(PacketFlags::SYN | PacketFlags::ACK)
                        && shared.peer.is_none()
                    {
                        shared.acknum = pkt.header.seqnum;
                    }

                    if pkt.header.seqnum < shared.acknum {
                        // a retransmission of data we already consumed; its
                        // acknowledgment must have been lost, so owe a new one
                        trace!(
                            "re-acking duplicate seq {} (expecting {})",
                            pkt.header.seqnum,
                            shared.acknum
                        );
                        shared.need_to_ack = true;
                        continue;
                    }

                    shared.insert_received(pkt, from);
                }
                Ok(None) => break,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    self.fail(&mut shared, Error::ConnectionReset);
                    return;
                }
                Err(err) => {
                    debug!("transient receive failure: {err}");
                    break;
                }
            }
        }

        // consume: deliver the contiguous run starting at acknum
        let mut delivered_data = false;
        while let Some((&seq, _)) = shared.received.first_key_value() {
            if seq != shared.acknum {
                break;
            }
            let record = shared.received.remove(&seq).unwrap();
            let pkt = record.packet;
            let flags = pkt.header.flags;

            if flags.contains(PacketFlags::SYN | PacketFlags::ACK)
                && shared.machine.current() == ConnState::SynSent
            {
                shared.peer = Some(record.from);
                shared.machine.transition(ConnState::Established);
                self.cond.notify_all();
            }

            if flags.contains(PacketFlags::ACK) {
                assert!(
                    shared.peer.is_some(),
                    "an acknowledgment implies the peer is known"
                );
                // cumulative: everything below the peer's acknum is delivered
                shared.sent = shared.sent.split_off(&pkt.header.acknum);

                if shared.machine.current() == ConnState::SynRcvd {
                    shared.machine.transition(ConnState::Established);
                    if let Some(callback) = shared.on_established.take() {
                        let peer = shared.peer.unwrap();
                        callback(peer);
                    }
                    self.cond.notify_all();
                }
            }

            if !pkt.payload.is_empty() {
                shared.recv_buf.extend(pkt.payload.iter().copied());
                delivered_data = true;
            }

            shared.acknum = shared
                .acknum
                .checked_add(pkt.seq_len())
                .expect("sequence space exhausted");
        }

        if delivered_data {
            shared.need_to_ack = true;
        }

        // emit: whatever the state machine owes, plus any owed ack
        let mut flags = shared.machine.derive_flags();
        if shared.need_to_ack {
            flags |= PacketFlags::ACK;
        }
        if !flags.is_empty() {
            match shared.peer {
                Some(to) => {
                    self.transmit_control(&mut shared, flags, to);
                    shared.need_to_ack = false;
                }
                // an owed ack with no learned peer can only come from
                // mid-handshake noise; the peer's retransmission re-arms it
                None => debug!("holding control {flags:?} until the peer is learned"),
            }
        }

        if delivered_data {
            self.cond.notify_all();
        }
    }

    // -- transmit path (reactor thread) --------------------------------------

    fn service_transmit(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.error.is_some() {
            return;
        }
        self.flush_send_buffer(&mut shared);
        self.retransmit_expired(&mut shared);
    }

    /// Packetizes the send buffer. Stops on transient send failure; the
    /// bytes stay buffered for the next tick.
    fn flush_send_buffer(&self, shared: &mut MutexGuard<'_, Shared>) {
        if shared.machine.current() != ConnState::Established {
            return;
        }
        let peer = shared
            .peer
            .expect("an established connection has a learned peer");

        let mut drained = false;
        while !shared.send_buf.is_empty() {
            let take = shared.send_buf.len().min(MAX_DATA_BYTES);
            let chunk: Vec<u8> = shared.send_buf.iter().take(take).copied().collect();
            let pkt = Packet::data(shared.seqnum, shared.acknum, Bytes::from(chunk));

            match packet::send_datagram(&self.endpoint, &pkt, peer) {
                Ok(()) => {
                    let seqnum = shared.seqnum;
                    shared.sent.insert(
                        seqnum,
                        SentRecord {
                            packet: pkt,
                            to: peer,
                            sent_at: Instant::now(),
                            retransmits: 0,
                        },
                    );
                    shared.seqnum = seqnum
                        .checked_add(take as u32)
                        .expect("sequence space exhausted");
                    shared.send_buf.drain(..take);
                    drained = true;
                }
                Err(err) if is_transient(&err) => break,
                Err(err) => {
                    warn!("fatal send failure: {err}");
                    self.fail(shared, Error::from_io(&err));
                    return;
                }
            }
        }

        if drained {
            // send-buffer space opened up
            self.cond.notify_all();
        }
    }

    /// Re-sends every record past [`RETRANSMIT_TIME`], failing the
    /// connection once a record exhausts [`MAX_RETRANSMITS`].
    fn retransmit_expired(&self, shared: &mut MutexGuard<'_, Shared>) {
        let now = Instant::now();
        let mut fatal = None;

        for (&seq, record) in shared.sent.iter_mut() {
            if now.duration_since(record.sent_at) < RETRANSMIT_TIME {
                continue;
            }
            if record.retransmits >= MAX_RETRANSMITS {
                warn!("seq {seq} unacknowledged after {MAX_RETRANSMITS} retransmissions");
                fatal = Some(Error::RetransmitExhausted);
                break;
            }
            record.retransmits += 1;
            record.sent_at = now;
            debug!(
                "retransmitting seq {seq} to {} (attempt {})",
                record.to, record.retransmits
            );
            match packet::send_datagram(&self.endpoint, &record.packet, record.to) {
                Ok(()) => {}
                Err(err) if is_transient(&err) => {}
                Err(err) => {
                    warn!("fatal send failure during retransmission: {err}");
                    fatal = Some(Error::from_io(&err));
                    break;
                }
            }
        }

        if let Some(error) = fatal {
            self.fail(shared, error);
        }
    }

    /// Emits a control packet (no payload) stamped with the current sequence
    /// numbers. SYN-carrying packets consume a sequence slot and enter the
    /// sent map *before* the send is attempted, so a transiently failed send
    /// is simply picked up by the retransmission timer.
    fn transmit_control(
        &self,
        shared: &mut MutexGuard<'_, Shared>,
        flags: PacketFlags,
        to: SocketAddrV4,
    ) {
        let pkt = Packet::control(flags, shared.seqnum, shared.acknum);
        if pkt.needs_ack() {
            let seqnum = shared.seqnum;
            shared.sent.insert(
                seqnum,
                SentRecord {
                    packet: pkt.clone(),
                    to,
                    sent_at: Instant::now(),
                    retransmits: 0,
                },
            );
            shared.seqnum = seqnum
                .checked_add(pkt.seq_len())
                .expect("sequence space exhausted");
        }

        match packet::send_datagram(&self.endpoint, &pkt, to) {
            Ok(()) => trace!("sent control {flags:?} to {to}"),
            Err(err) if is_transient(&err) => {
                debug!("deferred control {flags:?} to {to}: {err}")
            }
            Err(err) => {
                warn!("fatal send failure on control packet: {err}");
                self.fail(shared, Error::from_io(&err));
            }
        }
    }

    // -- failure -------------------------------------------------------------

    /// Records the sticky error and wakes every waiter. A passively-opened
    /// connection that never reached its established-callback has no user
    /// handle and never will; it unhooks itself from the reactor so it is
    /// dropped.
    fn fail(&self, shared: &mut MutexGuard<'_, Shared>, error: Error) {
        if shared.error.is_none() {
            warn!("connection to {:?} failed: {error}", shared.peer);
            shared.error = Some(error);
        }
        let orphaned = shared.on_established.take().is_some();
        self.cond.notify_all();

        if orphaned {
            if let Ok(reactor) = Reactor::global() {
                reactor.remove_handler(self.handler_id());
            }
        }
    }
}

impl Shared {
    /// Accepts a packet into the reassembly map. Re-insertion under the same
    /// sequence number merges: a pure acknowledgment legitimately shares its
    /// sequence number with the first data packet (acks consume no slot), so
    /// control flags are unioned and a payload is never displaced by an
    /// empty one.
    fn insert_received(&mut self, pkt: Packet, from: SocketAddrV4) {
        match self.received.entry(pkt.header.seqnum) {
            Entry::Vacant(slot) => {
                slot.insert(ReceivedRecord { packet: pkt, from });
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                record.packet.header.flags |= pkt.header.flags;
                record.packet.header.acknum = record.packet.header.acknum.max(pkt.header.acknum);
                if record.packet.payload.is_empty() && !pkt.payload.is_empty() {
                    record.packet.payload = pkt.payload;
                }
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::OutOfMemory
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_send_sync() {
        static_assertions::assert_impl_all!(Connection: Send, Sync);
    }
}
