use std::io;

/// Errors surfaced by the socket API.
///
/// Transient conditions (a send that would block, an interrupted receive) are
/// absorbed inside the reactor and never reach the caller, so every variant
/// here is either a caller mistake or a fatal connection outcome.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The handle does not refer to a live socket.
    #[error("bad socket handle")]
    BadHandle,

    /// An argument was outside its valid range.
    #[error("invalid argument")]
    InvalidArgument,

    /// The address is not an INET (IPv4) address.
    #[error("address family not supported")]
    AddressFamilyUnsupported,

    /// The requested local address is already bound.
    #[error("address already in use")]
    AddressInUse,

    /// The socket is not in a state that supports this operation.
    #[error("operation not supported in the socket's current state")]
    OperationNotSupportedInState,

    /// The system refused to allocate a resource (memory, descriptors, the
    /// event loop itself).
    #[error("out of memory")]
    NoMemory,

    /// The peer's endpoint reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// An unacknowledged packet exhausted its retransmission budget.
    #[error("retransmit budget exhausted")]
    RetransmitExhausted,

    /// A required address argument was absent.
    #[error("null address argument")]
    Fault,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Collapses an OS error onto the taxonomy above. Callers report the
    /// original error through the log before mapping, so no detail is lost.
    pub(crate) fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse,
            io::ErrorKind::OutOfMemory => Error::NoMemory,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => {
                Error::ConnectionReset
            }
            _ => Error::InvalidArgument,
        }
    }
}
