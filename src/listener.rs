use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace, warn};

use crate::api::Socket;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::packet::{self, Packet, PacketFlags};
use crate::reactor::{self, Event, HandlerKind, Reactor};

/// Demultiplexes raw SYNs arriving on a well-known endpoint. Each accepted
/// SYN gets a dedicated connection on a fresh ephemeral endpoint; the peer
/// discovers the ephemeral port from the source address of the SYN+ACK. Once
/// a child completes its handshake, its established-callback mints a user
/// handle and queues it for [`wait_and_accept`](Self::wait_and_accept).
pub(crate) struct Listener {
    endpoint: Arc<Endpoint>,
    backlog: u16,
    ready: Mutex<VecDeque<(Socket, SocketAddrV4)>>,
    cond: Condvar,
}

impl Listener {
    pub(crate) fn new(endpoint: Arc<Endpoint>, backlog: u16) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            backlog,
            ready: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub(crate) fn handler_id(&self) -> u64 {
        reactor::handler_id(HandlerKind::Listener, self.endpoint.id())
    }

    /// Reactor entry point. Ticks drain too: registration is edge-triggered,
    /// so the periodic pass picks up anything a previous drain left behind.
    pub(crate) fn on_event(this: &Arc<Self>, event: Event) {
        match event {
            Event::Readable | Event::Tick => Self::service_syns(this),
        }
    }

    fn service_syns(this: &Arc<Self>) {
        loop {
            match packet::recv_datagram(&this.endpoint) {
                Ok(Some((pkt, from))) => {
                    let SocketAddr::V4(from) = from else {
                        // only INET peers exist on this transport
                        continue;
                    };
                    if pkt.header.flags != PacketFlags::SYN {
                        trace!("listener ignoring non-SYN packet from {from}");
                        continue;
                    }
                    Self::spawn_child(this, pkt, from);
                }
                Ok(None) => break,
                Err(err) => {
                    // a listener has no single peer whose reset could matter
                    debug!("listener receive failure treated as transient: {err}");
                    break;
                }
            }
        }
    }

    /// Sets up the dedicated endpoint + connection for one handshake. Any
    /// failure releases whatever was set up and moves on to the next SYN.
    fn spawn_child(this: &Arc<Self>, syn: Packet, from: SocketAddrV4) {
        {
            let ready = this.ready.lock().unwrap();
            if ready.len() >= usize::from(this.backlog) {
                debug!("backlog full ({}); dropping SYN from {from}", this.backlog);
                return;
            }
        }

        let endpoint = match Endpoint::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))) {
            Ok(endpoint) => Arc::new(endpoint),
            Err(err) => {
                warn!("failed to bind a child endpoint for {from}: {err}");
                return;
            }
        };

        let connection = Connection::new(Arc::clone(&endpoint));

        // the listener exists, so the reactor does too
        let reactor = Reactor::global().expect("the reactor is running");
        let dispatch = Arc::clone(&connection);
        if let Err(err) = reactor.add_handler(
            HandlerKind::Connection,
            &endpoint,
            Arc::new(move |event| dispatch.on_event(event)),
        ) {
            warn!("failed to register a child connection for {from}: {err}");
            return;
        }

        // the callback closes a strong reference cycle through the
        // connection, so it goes in only once nothing below can fail; the
        // cycle is broken when the callback fires or the connection dies.
        // Nothing can establish before passive_open sends the SYN+ACK.
        let listener = Arc::clone(this);
        let child = Arc::clone(&connection);
        connection.set_established_callback(Box::new(move |peer| {
            let handle = crate::api::install_connection(child);
            let mut ready = listener.ready.lock().unwrap();
            ready.push_back((handle, peer));
            listener.cond.notify_all();
        }));

        trace!(
            "spawned child endpoint {:?} for {from}",
            endpoint.local_addr().ok()
        );
        connection.passive_open(from, &syn);
    }

    /// Blocks the calling user thread until a child connection completes its
    /// handshake, then pops and returns its handle and peer address.
    pub(crate) fn wait_and_accept(&self) -> (Socket, SocketAddrV4) {
        let mut ready = self.ready.lock().unwrap();
        loop {
            if let Some(entry) = ready.pop_front() {
                return entry;
            }
            ready = self.cond.wait(ready).unwrap();
        }
    }
}
