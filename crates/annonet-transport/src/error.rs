//! Error types surfaced by socket primitives and the transport.
//!
//! Background I/O tasks never return these; they log and tear the
//! connection down. These are for calls the host makes directly.

use std::io;

use annonet_core::MessageError;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("a connection attempt is already pending or open")]
    AlreadyOpen,

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { context, source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("no announcement socket could be opened")]
    NoAnnouncer,

    #[error("not running as server")]
    NotServing,

    #[error("not connected to a server")]
    NotConnected,

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("invalid session address {0:?}")]
    InvalidAddress(String),
}
