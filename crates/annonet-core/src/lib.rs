//! annonet-core — envelope wire format, stream reassembly, typed payloads
//! and configuration. No I/O lives here; annonet-transport builds on it.

pub mod config;
pub mod message;
pub mod reassembly;
pub mod wire;

pub use message::{AcceptClient, Announcement, JsonMessage, MessageError};
pub use reassembly::{EndpointState, Reassembler};
pub use wire::{Envelope, MessageType, WireError};
