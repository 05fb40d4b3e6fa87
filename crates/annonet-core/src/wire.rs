//! Annonet wire format — the framed envelope every peer exchanges.
//!
//! One frame on the wire:
//!
//! ```text
//! [ length: u32 little-endian | type: u8 | payload: length bytes ]
//! ```
//!
//! `length` counts payload bytes only. The same frame is used over TCP
//! (back-to-back, reassembled by [`crate::reassembly`]) and over UDP
//! (exactly one frame per datagram, discovery only).

use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Fixed-size prefix of every frame.
///
/// Wire size: 5 bytes. Both fields are alignment-1 so the struct has no
/// padding and can be read straight out of a receive buffer.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// Payload length in bytes, not including this header.
    pub length: U32<LittleEndian>,
    /// Message type tag. Opaque to the transport.
    pub msg_type: u8,
}

assert_eq_size!(FrameHeader, [u8; 5]);

impl FrameHeader {
    pub fn new(msg_type: MessageType, length: u32) -> Self {
        Self {
            length: U32::new(length),
            msg_type: msg_type.0,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.length.get() as usize
    }

    pub fn message_type(&self) -> MessageType {
        MessageType(self.msg_type)
    }
}

/// Bytes in a complete frame header (length + type).
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Default upper bound on a single payload accepted from the network.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

// ── Message Type ──────────────────────────────────────────────────────────────

/// One-byte message type tag.
///
/// The transport never interprets it. The named constants are the tags the
/// collaborative annotation application defines; unknown values pass through
/// untouched and are reported as unhandled by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(pub u8);

impl MessageType {
    /// Tags from here upward carry JSON text payloads.
    pub const FIRST_JSON_MESSAGE_TYPE: u8 = 128;

    pub const WORLD_ANCHOR: Self = Self(0);
    pub const ANNOUNCEMENT: Self = Self(128);
    pub const UPDATE_USER: Self = Self(129);
    pub const ACCEPT_CLIENT: Self = Self(130);
    pub const TOUCH: Self = Self(131);
    pub const DIMENSIONS: Self = Self(132);
    pub const VOLUME_PICKUP: Self = Self(133);
    pub const VOLUME_RELEASE: Self = Self(134);
    pub const VOLUME_TRANSFORM: Self = Self(135);
    pub const VOLUME_SCALEROTATE: Self = Self(136);
    pub const ANNOTATION_RELEASE: Self = Self(137);
    pub const ANNOTATION_UPDATE: Self = Self(138);
    pub const ANNOTATION_INSITU_MODE: Self = Self(139);
    pub const ANNOTATION_INSITU_PARAMETER: Self = Self(140);
    pub const ANNOTATION_STROKE_UPDATE: Self = Self(141);
    pub const ANNOTATION_STROKE_UNDO: Self = Self(142);
    pub const ANNOTATION_STROKE_CLEAR: Self = Self(143);
    pub const BOOKMARK_CREATE: Self = Self(144);
    pub const BOOKMARK_DELETE: Self = Self(145);
    pub const BOOKMARK_VISIBILITY: Self = Self(146);
    pub const SLICE_FREEZE: Self = Self(147);
    pub const SLICE_CT_MODE: Self = Self(148);
    pub const SET_WATER_LEVEL: Self = Self(149);
    pub const CONTACT_SELECTION_ENABLE: Self = Self(150);
    pub const CONTACT_SELECTION: Self = Self(151);
    pub const MODEL_SELECTION: Self = Self(152);
    pub const COLOR_PICKER_CHANGED: Self = Self(153);

    /// Human-readable name for logging. `None` for tags this build doesn't know.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::WORLD_ANCHOR => "world_anchor",
            Self::ANNOUNCEMENT => "announcement",
            Self::UPDATE_USER => "update_user",
            Self::ACCEPT_CLIENT => "accept_client",
            Self::TOUCH => "touch",
            Self::DIMENSIONS => "dimensions",
            Self::VOLUME_PICKUP => "volume_pickup",
            Self::VOLUME_RELEASE => "volume_release",
            Self::VOLUME_TRANSFORM => "volume_transform",
            Self::VOLUME_SCALEROTATE => "volume_scalerotate",
            Self::ANNOTATION_RELEASE => "annotation_release",
            Self::ANNOTATION_UPDATE => "annotation_update",
            Self::ANNOTATION_INSITU_MODE => "annotation_insitu_mode",
            Self::ANNOTATION_INSITU_PARAMETER => "annotation_insitu_parameter",
            Self::ANNOTATION_STROKE_UPDATE => "annotation_stroke_update",
            Self::ANNOTATION_STROKE_UNDO => "annotation_stroke_undo",
            Self::ANNOTATION_STROKE_CLEAR => "annotation_stroke_clear",
            Self::BOOKMARK_CREATE => "bookmark_create",
            Self::BOOKMARK_DELETE => "bookmark_delete",
            Self::BOOKMARK_VISIBILITY => "bookmark_visibility",
            Self::SLICE_FREEZE => "slice_freeze",
            Self::SLICE_CT_MODE => "slice_ct_mode",
            Self::SET_WATER_LEVEL => "set_water_level",
            Self::CONTACT_SELECTION_ENABLE => "contact_selection_enable",
            Self::CONTACT_SELECTION => "contact_selection",
            Self::MODEL_SELECTION => "model_selection",
            Self::COLOR_PICKER_CHANGED => "color_picker_changed",
            _ => return None,
        };
        Some(name)
    }

    pub fn is_json(self) -> bool {
        self.0 >= Self::FIRST_JSON_MESSAGE_TYPE
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "0x{:02x}", self.0),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A complete framed message.
///
/// `sender` is attached on receipt and never transmitted. Envelopes are
/// immutable once built; cloning is cheap because the payload is [`Bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub payload: Bytes,
    pub sender: Option<SocketAddr>,
}

impl Envelope {
    /// Build an outbound envelope.
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
            sender: None,
        }
    }

    /// Build an envelope from a payload the reassembler has isolated.
    pub fn from_parts(sender: SocketAddr, payload: impl Into<Bytes>, msg_type: u8) -> Self {
        Self {
            msg_type: MessageType(msg_type),
            payload: payload.into(),
            sender: Some(sender),
        }
    }

    /// `length || type || payload`.
    ///
    /// Payloads larger than `u32::MAX` cannot be framed; callers keep
    /// payloads well under [`DEFAULT_MAX_PAYLOAD`].
    pub fn serialize(&self) -> Bytes {
        debug_assert!(self.payload.len() <= u32::MAX as usize);
        let header = FrameHeader::new(self.msg_type, self.payload.len() as u32);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one whole frame, header included.
    ///
    /// Used where a full message is already known to be in hand, e.g. one
    /// UDP datagram. The length field must match the bytes that follow.
    pub fn deserialize(sender: Option<SocketAddr>, raw: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::read_from_prefix(raw).ok_or(WireError::Truncated {
            needed: HEADER_LEN,
            got: raw.len(),
        })?;
        let body = &raw[HEADER_LEN..];
        if header.payload_len() != body.len() {
            return Err(WireError::LengthMismatch {
                declared: header.payload_len(),
                actual: body.len(),
            });
        }
        Ok(Self {
            msg_type: header.message_type(),
            payload: Bytes::copy_from_slice(body),
            sender,
        })
    }

    /// Total bytes this envelope occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
