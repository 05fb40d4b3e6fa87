//! annonet-transport — sockets, LAN discovery, dispatch and the transport
//! coordinator that ties them together.

pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod socket;
pub mod transport;

pub use discovery::{SessionInfo, SessionRegistry};
pub use dispatch::{Dispatcher, MessageHandler};
pub use error::{SocketError, TransportError};
pub use transport::{Transport, TransportEvent, TransportState};
