//! Discovery — servers announce themselves over UDP broadcast, clients
//! collect the announcements into a session registry.

pub mod announcer;
pub mod interfaces;
pub mod sessions;

pub use announcer::{announce_loop, open_announcers, AnnounceParams, Announcer};
pub use interfaces::{broadcast_address, host_name, resolve_targets, BroadcastTarget};
pub use sessions::{expiry_loop, SessionInfo, SessionRegistry};
