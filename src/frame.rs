//! # Frame
//!
//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2),
//! the atomic wire unit carrying payload data plus protocol metadata.
//!
//! Two representations are provided:
//!
//! - [`Frame`]: full mutable frame with masking key and extension bit, used by
//!   the codec and the extension pipeline
//! - [`FrameView`]: lightweight immutable view used at the session boundary
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Data frames (`Text`, `Binary`, `Continuation`) may be fragmented across
//! multiple frames; control frames (`Close`, `Ping`, `Pong`) must fit in a
//! single frame with at most [`MAX_CONTROL_PAYLOAD`] payload bytes and may be
//! interleaved with an in-progress fragmented message.

use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, close::CloseReason, WebSocketError};

/// Maximum payload size of a control frame (close, ping, pong) in bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// WebSocket operation code determining the semantic meaning of a frame.
///
/// Data frame opcodes:
/// - `Continuation`: continues a fragmented message started by a data frame
/// - `Text`: UTF-8 encoded text data
/// - `Binary`: raw binary data
///
/// Control frame opcodes:
/// - `Close`: initiates or confirms connection closure
/// - `Ping`: liveness probe requiring a `Pong` response
/// - `Pong`: response to a `Ping`
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved; frames carrying them are
/// rejected per RFC 6455.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the opcode is a control frame (`Close`, `Ping`, `Pong`).
    ///
    /// Control frames cannot be fragmented, are limited to 125 payload bytes
    /// and are processed immediately rather than queued with data frames.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A lightweight immutable view of a WebSocket frame.
///
/// `FrameView` is what crosses the session boundary in both directions: the
/// payload is already unmasked and extension transforms have been applied.
/// The `fin` flag is carried so that partial-message sends (fin = `false`)
/// are expressible; all constructors except the partial ones produce final
/// frames.
#[derive(Debug, Clone)]
pub struct FrameView {
    /// The operation code of the frame.
    pub opcode: OpCode,
    /// Final fragment flag. `false` signals that continuation frames of the
    /// same message follow.
    pub fin: bool,
    /// The frame payload, unmasked.
    pub payload: Bytes,
}

impl FrameView {
    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Text,
            fin: true,
            payload: payload.into(),
        }
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Binary,
            fin: true,
            payload: payload.into(),
        }
    }

    /// Creates one fragment of a partial message.
    ///
    /// `opcode` is the message opcode for the first fragment and
    /// `Continuation` for subsequent ones; `last` maps to the fin bit.
    pub fn partial(opcode: OpCode, last: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            fin: last,
            payload: payload.into(),
        }
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Ping,
            fin: true,
            payload: payload.into(),
        }
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Pong,
            fin: true,
            payload: payload.into(),
        }
    }

    /// Creates a close frame from a close code and reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let code16 = u16::from(code);
        let reason: &[u8] = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code16.to_be_bytes());
        payload.extend_from_slice(reason);

        Self {
            opcode: OpCode::Close,
            fin: true,
            payload: payload.into(),
        }
    }

    /// Creates a close frame with a raw payload, without validating the
    /// code/reason structure. Used to echo a peer's close payload verbatim.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Close,
            fin: true,
            payload: payload.into(),
        }
    }

    /// Parses the payload of a close frame into a [`CloseReason`].
    pub fn close_reason(&self) -> crate::Result<CloseReason> {
        CloseReason::parse(&self.payload)
    }

    /// Interprets the payload as UTF-8 text.
    ///
    /// # Panics
    /// Panics if the payload is not valid UTF-8. Only call this on frames
    /// whose payload has already been validated, such as delivered text
    /// messages.
    #[inline]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.payload).expect("utf8")
    }
}

impl From<Frame> for FrameView {
    fn from(value: Frame) -> Self {
        Self {
            opcode: value.opcode,
            fin: value.fin,
            payload: value.payload.freeze(),
        }
    }
}

/// A full WebSocket frame including masking state and the extension (RSV1) bit.
///
/// This low-level struct is produced by the codec on read and consumed by it
/// on write. Application code works with [`FrameView`]; only the extension
/// pipeline sees `Frame`s, and may replace one with a transformed frame.
#[derive(Debug)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame.
    pub opcode: OpCode,
    /// RSV1 bit, claimed by a negotiated extension when set.
    pub rsv1: bool,
    /// The masking key, if the frame is (or is to be) masked.
    mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: BytesMut,
}

impl From<FrameView> for Frame {
    fn from(value: FrameView) -> Self {
        Frame::new(value.fin, value.opcode, None, value.payload)
    }
}

impl Frame {
    /// Creates a new frame.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
            rsv1: false,
        }
    }

    /// Creates a new frame with the RSV1 extension bit set.
    pub fn with_rsv1(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
            rsv1: true,
        }
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// Returns whether the frame carries a masking key.
    #[inline(always)]
    pub(crate) fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Assigns the masking key that [`Frame::mask`] will use.
    ///
    /// Client write paths draw the key from the session's
    /// [`MaskKeyGenerator`](crate::mask::MaskKeyGenerator) rather than letting
    /// the frame pick one.
    pub(crate) fn set_mask(&mut self, key: [u8; 4]) {
        self.mask = Some(key);
    }

    /// Masks the payload in place using the previously assigned key.
    ///
    /// A random key is generated if none was assigned.
    pub(crate) fn mask(&mut self) {
        let payload = &mut self.payload;
        if let Some(mask) = self.mask {
            crate::mask::apply_mask(payload, mask);
        } else {
            let mask: [u8; 4] = rand::random();
            crate::mask::apply_mask(payload, mask);
            self.mask = Some(mask);
        }
    }

    /// Unmasks the payload, consuming the masking key.
    pub(crate) fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            let payload = &mut self.payload;
            crate::mask::apply_mask(payload, mask);
        }
    }

    /// Formats the frame header into `head` and returns its size in bytes.
    ///
    /// # Panics
    /// Panics if `head` is smaller than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        let rsv1 = u8::from(self.rsv1);
        head[0] = (self.fin as u8) << 7 | rsv1 << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}
