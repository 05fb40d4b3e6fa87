//! Stream reassembly — turns arbitrary TCP reads back into envelopes.
//!
//! TCP delivers a byte stream, not messages. A single read can end in the
//! middle of a header, contain several whole frames, or carry only a slice
//! of a large payload. Each remote endpoint gets its own [`EndpointState`]
//! that remembers where the previous read stopped.
//!
//! Processing of one chunk is a flat loop over a cursor. A chunk full of
//! tiny frames never recurses.

use std::net::SocketAddr;

use bytes::Bytes;
use dashmap::DashMap;
use zerocopy::FromBytes;

use crate::wire::{Envelope, FrameHeader, WireError, DEFAULT_MAX_PAYLOAD, HEADER_LEN};

/// Where an endpoint's parser currently stands. Exactly one holds.
#[derive(Debug)]
enum Phase {
    /// Between frames.
    Idle,
    /// Part of a header has arrived.
    Header {
        buf: [u8; HEADER_LEN],
        filled: usize,
    },
    /// Header complete, payload bytes still arriving.
    Payload {
        msg_type: u8,
        buf: Vec<u8>,
        expected: usize,
    },
}

/// Incremental parser for one remote endpoint's byte stream.
#[derive(Debug)]
pub struct EndpointState {
    phase: Phase,
    max_payload: usize,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl EndpointState {
    pub fn new(max_payload: usize) -> Self {
        Self {
            phase: Phase::Idle,
            max_payload,
        }
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    /// True while a header is split across reads.
    pub fn is_mid_header(&self) -> bool {
        matches!(self.phase, Phase::Header { .. })
    }

    /// True while payload bytes are still outstanding.
    pub fn is_mid_payload(&self) -> bool {
        matches!(self.phase, Phase::Payload { .. })
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Feed one chunk. Completed envelopes are appended to `out` in stream order.
    ///
    /// On error the partial frame is discarded and the state returns to idle.
    /// Envelopes completed earlier in the same chunk stay in `out`.
    pub fn push(
        &mut self,
        sender: SocketAddr,
        chunk: &[u8],
        out: &mut Vec<Envelope>,
    ) -> Result<(), WireError> {
        let result = self.consume(sender, chunk, out);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn consume(
        &mut self,
        sender: SocketAddr,
        chunk: &[u8],
        out: &mut Vec<Envelope>,
    ) -> Result<(), WireError> {
        let mut cursor = 0;

        while cursor < chunk.len() {
            let rest = &chunk[cursor..];

            match &mut self.phase {
                Phase::Payload {
                    msg_type,
                    buf,
                    expected,
                } => {
                    let take = (*expected - buf.len()).min(rest.len());
                    buf.extend_from_slice(&rest[..take]);
                    cursor += take;

                    if buf.len() == *expected {
                        let msg_type = *msg_type;
                        let payload = Bytes::from(std::mem::take(buf));
                        self.phase = Phase::Idle;
                        out.push(Envelope::from_parts(sender, payload, msg_type));
                    }
                }

                Phase::Header { buf, filled } => {
                    let take = (HEADER_LEN - *filled).min(rest.len());
                    buf[*filled..*filled + take].copy_from_slice(&rest[..take]);
                    *filled += take;
                    cursor += take;

                    if *filled == HEADER_LEN {
                        let header = FrameHeader::read_from(&buf[..]).ok_or(WireError::Truncated {
                            needed: HEADER_LEN,
                            got: *filled,
                        })?;
                        self.begin_payload(header, sender, out)?;
                    }
                }

                Phase::Idle => {
                    if rest.len() >= HEADER_LEN {
                        let header = FrameHeader::read_from_prefix(rest).ok_or(
                            WireError::Truncated {
                                needed: HEADER_LEN,
                                got: rest.len(),
                            },
                        )?;
                        cursor += HEADER_LEN;
                        // Payload bytes in this chunk are picked up by the
                        // next iteration of the same pass.
                        self.begin_payload(header, sender, out)?;
                    } else {
                        let mut buf = [0u8; HEADER_LEN];
                        buf[..rest.len()].copy_from_slice(rest);
                        self.phase = Phase::Header {
                            buf,
                            filled: rest.len(),
                        };
                        cursor += rest.len();
                    }
                }
            }
        }

        Ok(())
    }

    /// Transition out of a completed header. Zero-length frames complete here.
    fn begin_payload(
        &mut self,
        header: FrameHeader,
        sender: SocketAddr,
        out: &mut Vec<Envelope>,
    ) -> Result<(), WireError> {
        let len = header.payload_len();
        if len > self.max_payload {
            return Err(WireError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }

        if len == 0 {
            self.phase = Phase::Idle;
            out.push(Envelope::from_parts(sender, Bytes::new(), header.msg_type));
        } else {
            self.phase = Phase::Payload {
                msg_type: header.msg_type,
                buf: Vec::with_capacity(len),
                expected: len,
            };
        }
        Ok(())
    }
}

/// Per-endpoint reassembly states, shared between receive tasks.
///
/// Each endpoint's chunks must be fed in delivery order from one task at a
/// time; different endpoints may be fed concurrently.
#[derive(Debug)]
pub struct Reassembler {
    states: DashMap<SocketAddr, EndpointState>,
    max_payload: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Reassembler {
    pub fn new(max_payload: usize) -> Self {
        Self {
            states: DashMap::new(),
            max_payload,
        }
    }

    /// Feed one chunk from `sender`, creating its state on first contact.
    pub fn feed(
        &self,
        sender: SocketAddr,
        chunk: &[u8],
        out: &mut Vec<Envelope>,
    ) -> Result<(), WireError> {
        let mut state = self
            .states
            .entry(sender)
            .or_insert_with(|| EndpointState::new(self.max_payload));
        state.push(sender, chunk, out)
    }

    /// Forget an endpoint. Returns whether state existed.
    pub fn evict(&self, sender: &SocketAddr) -> bool {
        self.states.remove(sender).is_some()
    }

    /// True if `sender` has a partial frame buffered.
    pub fn has_partial(&self, sender: &SocketAddr) -> bool {
        self.states
            .get(sender)
            .map(|s| !s.is_idle())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
