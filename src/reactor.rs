use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, trace};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use once_cell::sync::OnceCell;

use crate::endpoint::Endpoint;
use crate::{Error, Result};

/// How long one readiness poll may block. Bounded so the per-tick work
/// (flushing send buffers, expiring retransmission timers) runs even on a
/// quiet link.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// How long to wait for the reactor thread to confirm startup before
/// declaring creation failed. Thread creation is a once-per-process
/// operation; a machine too loaded to schedule it within this window is not
/// going to run a transport either.
const STARTUP_TIMEOUT: Duration = Duration::from_millis(200);

const EVENTS_CAPACITY: usize = 64;

/// What a handler is being asked to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// The endpoint has datagrams waiting.
    Readable,
    /// One poll interval elapsed; flush buffers and expire timers.
    Tick,
}

/// Handlers are dispatch closures, keeping the reactor unaware of what is
/// registered behind an id.
pub(crate) type Handler = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    Listener = 0,
    Connection = 1,
}

/// Packs a handler id: high half is the kind, low half the endpoint id.
/// Sorting ids therefore groups every listener ahead of every connection,
/// so new child connections spawned while dispatching a tick are already
/// registered by the time the connection group runs.
pub(crate) fn handler_id(kind: HandlerKind, endpoint_id: u32) -> u64 {
    ((kind as u64) << 32) | u64::from(endpoint_id)
}

struct Registration {
    handler: Handler,
    fd: RawFd,
}

/// The process-singleton event reactor: one dedicated thread polling
/// readiness across every registered endpoint and dispatching to handlers.
/// Handlers run exclusively on the reactor thread; the user-facing API only
/// ever synchronizes with them through per-connection mutexes and condvars.
pub(crate) struct Reactor {
    registry: mio::Registry,
    handlers: Arc<Mutex<HashMap<u64, Registration>>>,
    _thread: thread::JoinHandle<()>,
}

static REACTOR: OnceCell<Reactor> = OnceCell::new();

impl Reactor {
    /// The singleton, created lazily on first use and never torn down.
    /// Creation failures (the readiness primitive or the thread) surface as
    /// [`Error::NoMemory`]; details go to the log.
    pub(crate) fn global() -> Result<&'static Reactor> {
        REACTOR.get_or_try_init(Reactor::new)
    }

    fn new() -> Result<Reactor> {
        let poll = Poll::new().map_err(|err| {
            error!("failed to create readiness primitive: {err}");
            Error::NoMemory
        })?;
        let registry = poll.registry().try_clone().map_err(|err| {
            error!("failed to clone readiness registry: {err}");
            Error::NoMemory
        })?;

        let handlers = Arc::new(Mutex::new(HashMap::new()));
        let (started_tx, started_rx) = mpsc::channel();

        let thread_handlers = Arc::clone(&handlers);
        let thread = thread::Builder::new()
            .name("rudp-reactor".into())
            .spawn(move || run(poll, thread_handlers, started_tx))
            .map_err(|err| {
                error!("failed to spawn reactor thread: {err}");
                Error::NoMemory
            })?;

        if started_rx.recv_timeout(STARTUP_TIMEOUT).is_err() {
            error!("reactor thread did not start within {STARTUP_TIMEOUT:?}");
            return Err(Error::NoMemory);
        }

        Ok(Reactor {
            registry,
            handlers,
            _thread: thread,
        })
    }

    /// Registers `handler` for readiness and tick dispatch on `endpoint`.
    /// Callable from any thread, including a handler already running on the
    /// reactor thread (a listener registering the child it just spawned).
    pub(crate) fn add_handler(
        &self,
        kind: HandlerKind,
        endpoint: &Endpoint,
        handler: Handler,
    ) -> io::Result<u64> {
        let id = handler_id(kind, endpoint.id());
        let fd = endpoint.as_raw_fd();

        {
            let mut handlers = self.handlers.lock().unwrap();
            let previous = handlers.insert(id, Registration { handler, fd });
            assert!(
                previous.is_none(),
                "handler id {id:#x} registered twice with the reactor"
            );
        }

        // the map entry goes in first so a registered endpoint always
        // resolves at dispatch
        if let Err(err) = self
            .registry
            .register(&mut SourceFd(&fd), Token(id as usize), Interest::READABLE)
        {
            self.handlers.lock().unwrap().remove(&id);
            return Err(err);
        }

        trace!("registered handler {id:#x}");
        Ok(id)
    }

    /// Removes a registration. A no-op for ids that are already gone.
    pub(crate) fn remove_handler(&self, id: u64) {
        let removed = self.handlers.lock().unwrap().remove(&id);
        if let Some(registration) = removed {
            if let Err(err) = self.registry.deregister(&mut SourceFd(&registration.fd)) {
                debug!("failed to deregister handler {id:#x}: {err}");
            }
            trace!("removed handler {id:#x}");
        }
    }
}

fn run(mut poll: Poll, handlers: Arc<Mutex<HashMap<u64, Registration>>>, started: mpsc::Sender<()>) {
    // creation blocks on this; the receiver may already be gone if startup
    // timed out, in which case nobody is polling us and there is nothing
    // useful to do about it
    let _ = started.send(());

    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    loop {
        if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // the readiness primitive itself failing is unrecoverable
            panic!("readiness poll failed: {err}");
        }

        let mut ready: Vec<u64> = events.iter().map(|event| event.token().0 as u64).collect();
        ready.sort_unstable();
        ready.dedup();

        for id in ready {
            // resolve under the lock, dispatch outside it: handlers
            // register children and take their own locks while running
            let handler = {
                let handlers = handlers.lock().unwrap();
                handlers
                    .get(&id)
                    .map(|registration| Arc::clone(&registration.handler))
            };
            match handler {
                Some(handler) => handler(Event::Readable),
                // a close() on a user thread can race an event already
                // reported by the poll; the stale token is not a bug
                None => trace!("dropping event for unregistered id {id:#x}"),
            }
        }

        let mut tick: Vec<(u64, Handler)> = {
            let handlers = handlers.lock().unwrap();
            handlers
                .iter()
                .map(|(id, registration)| (*id, Arc::clone(&registration.handler)))
                .collect()
        };
        tick.sort_unstable_by_key(|(id, _)| *id);
        for (_, handler) in tick {
            handler(Event::Tick);
        }
    }
}
