//! Typed payloads the transport itself produces or consumes.
//!
//! Payloads at or above [`MessageType::FIRST_JSON_MESSAGE_TYPE`] are UTF-8
//! JSON. Field names match what deployed tablets and headsets already send,
//! hence the PascalCase renames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::wire::{Envelope, MessageType};

/// A payload that travels as JSON inside an [`Envelope`].
pub trait JsonMessage: Serialize + DeserializeOwned {
    /// Tag used on the wire.
    const TYPE: MessageType;

    /// Pack into an outbound envelope.
    fn pack(&self) -> Result<Envelope, MessageError> {
        let payload = serde_json::to_vec(self)?;
        Ok(Envelope::new(Self::TYPE, payload))
    }

    /// Unpack from a received envelope.
    fn unpack(envelope: &Envelope) -> Result<Self, MessageError> {
        if envelope.msg_type != Self::TYPE {
            return Err(MessageError::WrongType {
                expected: Self::TYPE,
                actual: envelope.msg_type,
            });
        }
        Ok(serde_json::from_slice(&envelope.payload)?)
    }
}

/// Server presence, broadcast over UDP to every local subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Address clients should connect to. The server's IP on the
    /// subnet this announcement was broadcast on.
    #[serde(rename = "IP")]
    pub ip: String,

    /// TCP port the server accepts connections on.
    #[serde(rename = "Port")]
    pub port: u16,

    /// Display name, normally the host name.
    #[serde(rename = "Name")]
    pub name: String,

    /// Shared filter string. Clients ignore announcements whose text
    /// differs from their own.
    #[serde(rename = "Message")]
    pub message: String,
}

impl JsonMessage for Announcement {
    const TYPE: MessageType = MessageType::ANNOUNCEMENT;
}

/// Sent by the server to each client right after it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptClient {
    #[serde(rename = "ClientIndex")]
    pub client_index: u32,
}

impl JsonMessage for AcceptClient {
    const TYPE: MessageType = MessageType::ACCEPT_CLIENT;
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("expected message type {expected}, got {actual}")]
    WrongType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("payload is not valid JSON for this message: {0}")]
    Json(#[from] serde_json::Error),
}
