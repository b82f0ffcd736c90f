//! Fragmented message reassembly.
//!
//! Data frames arrive as a run of fragments: an initial text or binary frame
//! with `fin` clear, any number of continuation frames, and a final frame with
//! `fin` set. The [`Reassembler`] turns that run into [`MessageEvent`]s
//! according to the receiver's [`DeliveryMode`].
//!
//! Control frames never pass through here; the session routes them around the
//! reassembler so a ping or close arriving mid-run does not disturb it.

use bytes::{Bytes, BytesMut};

use crate::{frame::OpCode, Result, WebSocketError};

/// How a receiver wants inbound messages delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Accumulate fragments and deliver the complete message at once.
    #[default]
    Whole,
    /// Deliver each fragment as it arrives, flagged with `last`.
    Partial,
    /// Hand the application a chunk reader it can consume at its own pace.
    Reader,
}

/// Whether a message carries text or binary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Per-kind size limits for whole-message accumulation.
///
/// Limits bound the accumulation buffer in [`DeliveryMode::Whole`]; in the
/// streaming modes fragments are handed off without buffering and backpressure
/// bounds memory instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_text: usize,
    pub max_binary: usize,
}

impl MessageLimits {
    pub fn new(max_text: usize, max_binary: usize) -> Self {
        Self {
            max_text,
            max_binary,
        }
    }

    /// Applies a handler-supplied override, keeping the stricter bound for
    /// both kinds.
    pub fn restricted_to(self, limit: Option<usize>) -> Self {
        match limit {
            Some(limit) => Self {
                max_text: self.max_text.min(limit),
                max_binary: self.max_binary.min(limit),
            },
            None => self,
        }
    }

    fn for_kind(&self, kind: MessageKind) -> usize {
        match kind {
            MessageKind::Text => self.max_text,
            MessageKind::Binary => self.max_binary,
        }
    }
}

impl Default for MessageLimits {
    fn default() -> Self {
        // matches the default frame-size ceiling
        Self::new(64 << 20, 64 << 20)
    }
}

/// Output of pushing one data frame into the reassembler.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
    /// A complete text message (whole mode).
    Text(String),
    /// A complete binary message (whole mode).
    Binary(Bytes),
    /// One text fragment (partial mode).
    PartialText { data: String, last: bool },
    /// One binary fragment (partial mode).
    PartialBinary { data: Bytes, last: bool },
    /// A new message begins (reader mode); chunks follow.
    ReaderStart(MessageKind),
    /// One chunk of the in-progress message (reader mode).
    ReaderChunk(Bytes),
    /// The in-progress message is complete (reader mode).
    ReaderEnd,
}

struct Run {
    kind: MessageKind,
    /// Accumulated payload, whole mode only.
    buffer: BytesMut,
    /// Trailing bytes of an incomplete UTF-8 sequence from the previous
    /// fragment, streaming text only.
    carry: Vec<u8>,
}

/// Streaming reassembler for one receive direction.
///
/// [`Reassembler::push`] consumes data frames in wire order and returns the
/// events to deliver. Limit and continuation violations leave the reassembler
/// with no open run; the session tears the connection down on any error here.
pub struct Reassembler {
    mode: DeliveryMode,
    limits: MessageLimits,
    run: Option<Run>,
}

impl Reassembler {
    pub fn new(mode: DeliveryMode, limits: MessageLimits) -> Self {
        Self {
            mode,
            limits,
            run: None,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Pushes one data frame, returning the events it produces.
    ///
    /// A continuation with no open run, or a fresh text/binary frame while a
    /// run is open, is a protocol violation. Whole-mode accumulation beyond
    /// the kind's limit discards the run and fails with
    /// [`WebSocketError::MessageTooBig`].
    pub fn push(&mut self, opcode: OpCode, fin: bool, payload: Bytes) -> Result<Vec<MessageEvent>> {
        let mut events = Vec::new();

        let open_kind = self.run.as_ref().map(|run| run.kind);
        let kind = match (opcode, open_kind) {
            (OpCode::Text, None) => MessageKind::Text,
            (OpCode::Binary, None) => MessageKind::Binary,
            (OpCode::Continuation, Some(kind)) => kind,
            _ => {
                self.run = None;
                return Err(WebSocketError::InvalidContinuation);
            }
        };

        if opcode != OpCode::Continuation {
            self.run = Some(Run {
                kind,
                buffer: BytesMut::new(),
                carry: Vec::new(),
            });
            if self.mode == DeliveryMode::Reader {
                events.push(MessageEvent::ReaderStart(kind));
            }
        }

        // run is always present past this point
        let run = match self.run.as_mut() {
            Some(run) => run,
            None => return Err(WebSocketError::InvalidContinuation),
        };

        match self.mode {
            DeliveryMode::Whole => {
                run.buffer.extend_from_slice(&payload);
                if run.buffer.len() > self.limits.for_kind(kind) {
                    self.run = None;
                    return Err(WebSocketError::MessageTooBig);
                }
                if fin {
                    if let Some(run) = self.run.take() {
                        events.push(match run.kind {
                            MessageKind::Text => {
                                let text = String::from_utf8(run.buffer.to_vec())
                                    .map_err(|_| WebSocketError::InvalidUtf8)?;
                                MessageEvent::Text(text)
                            }
                            MessageKind::Binary => MessageEvent::Binary(run.buffer.freeze()),
                        });
                    }
                }
            }
            DeliveryMode::Partial => {
                let event = match kind {
                    MessageKind::Text => {
                        let data = drain_valid_utf8(&mut run.carry, &payload, fin)?;
                        MessageEvent::PartialText { data, last: fin }
                    }
                    MessageKind::Binary => MessageEvent::PartialBinary {
                        data: payload,
                        last: fin,
                    },
                };
                events.push(event);
                if fin {
                    self.run = None;
                }
            }
            DeliveryMode::Reader => {
                let chunk = match kind {
                    MessageKind::Text => {
                        Bytes::from(drain_valid_utf8(&mut run.carry, &payload, fin)?)
                    }
                    MessageKind::Binary => payload,
                };
                if !chunk.is_empty() {
                    events.push(MessageEvent::ReaderChunk(chunk));
                }
                if fin {
                    events.push(MessageEvent::ReaderEnd);
                    self.run = None;
                }
            }
        }

        Ok(events)
    }

    /// Whether a fragment run is currently open.
    pub fn mid_message(&self) -> bool {
        self.run.is_some()
    }
}

/// Extracts the longest valid UTF-8 prefix of `carry ++ chunk`, keeping an
/// incomplete trailing sequence in `carry` for the next fragment.
///
/// A sequence that is invalid (rather than merely incomplete) fails, as does
/// an incomplete sequence on the final fragment.
fn drain_valid_utf8(carry: &mut Vec<u8>, chunk: &[u8], last: bool) -> Result<String> {
    carry.extend_from_slice(chunk);
    let bytes = std::mem::take(carry);

    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(err) => {
            let utf8_err = err.utf8_error();
            if utf8_err.error_len().is_some() || last {
                return Err(WebSocketError::InvalidUtf8);
            }
            let valid_up_to = utf8_err.valid_up_to();
            let mut bytes = err.into_bytes();
            *carry = bytes.split_off(valid_up_to);
            // the prefix was just validated
            Ok(unsafe { String::from_utf8_unchecked(bytes) })
        }
    }
}
