use crate::packet::PacketFlags;

/// Handshake states. There is no closed state; teardown is an abrupt drop of
/// the connection and its endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    Created,
    SynSent,
    SynRcvd,
    Established,
}

/// Returns the control flags a transition obliges us to emit, or `None` when
/// the edge is illegal. The self-loop on `Created` is a recorded no-op.
fn edge_flags(from: ConnState, to: ConnState) -> Option<PacketFlags> {
    use ConnState::*;
    match (from, to) {
        (Created, Created) => Some(PacketFlags::empty()),
        (Created, SynSent) => Some(PacketFlags::SYN),
        (Created, SynRcvd) => Some(PacketFlags::SYN | PacketFlags::ACK),
        (SynSent, Established) => Some(PacketFlags::ACK),
        (SynRcvd, Established) => Some(PacketFlags::empty()),
        _ => None,
    }
}

#[derive(Debug)]
struct Transition {
    to: ConnState,
    flags: PacketFlags,
}

/// The handshake state machine. Transitions are logged rather than stored as
/// a single value; [`derive_flags`](Self::derive_flags) reads the log past a
/// cursor so that the next outbound control packet carries the union of
/// everything owed since the last read.
#[derive(Debug)]
pub(crate) struct StateMachine {
    log: Vec<Transition>,
    cursor: usize,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            log: vec![Transition {
                to: ConnState::Created,
                flags: PacketFlags::empty(),
            }],
            cursor: 0,
        }
    }

    pub(crate) fn current(&self) -> ConnState {
        // the log starts non-empty and only grows
        self.log.last().unwrap().to
    }

    pub(crate) fn transition(&mut self, to: ConnState) {
        let from = self.current();
        let flags = match edge_flags(from, to) {
            Some(flags) => flags,
            None => unreachable!("illegal connection state transition {from:?} -> {to:?}"),
        };
        self.log.push(Transition { to, flags });
    }

    /// The union of control flags owed since the previous call; advances the
    /// read cursor past everything it saw.
    pub(crate) fn derive_flags(&mut self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        for transition in &self.log[self.cursor..] {
            flags |= transition.flags;
        }
        self.cursor = self.log.len();
        flags
    }
}
