//! Resumable frame codec built on [`tokio_util::codec`].
//!
//! The [`Decoder`] tolerates arbitrary chunking of the byte stream: it parses
//! the fixed header, the extended length, the masking key and the payload in
//! stages, returning `Ok(None)` ("need more data") until a complete frame is
//! buffered. The [`Encoder`] serializes frames and enforces the control-frame
//! payload limit before any bytes are written.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{self, Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    OpCode, WebSocketError,
};

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// Currently reading the header of the frame.
    Header(Header),
    /// Currently reading the payload of the frame.
    Payload(HeaderAndMask),
}

/// Represents the initial header fields of a WebSocket frame.
struct Header {
    /// Indicates if this is the final fragment in a message.
    fin: bool,
    /// Extension bit; only legal when an extension claimed it.
    rsv1: bool,
    /// Indicates if the frame is masked.
    masked: bool,
    /// The operation code of the frame.
    opcode: OpCode,
    /// Additional length of the frame, if applicable.
    extra: usize,
    /// Encoded length of the payload.
    length_code: u8,
    /// Total size of the header in bytes.
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec providing both encoding and decoding of WebSocket frames,
/// for use with [`tokio_util::codec::Framed`].
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec with the given frame-size limit.
    ///
    /// `rsv1_allowed` must be set when a negotiated extension claims the RSV1
    /// bit; otherwise incoming frames with RSV1 set are protocol violations.
    pub fn new(max_frame_size: usize, rsv1_allowed: bool) -> Self {
        Self {
            decoder: Decoder::new(max_frame_size, rsv1_allowed),
            encoder: Encoder,
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames, handling state transitions across partial
/// reads.
pub struct Decoder {
    /// Current reading state (header or payload).
    state: Option<ReadState>,
    /// Maximum allowed size for a single frame payload.
    max_frame_size: usize,
    /// Whether a negotiated extension claimed the RSV1 bit.
    rsv1_allowed: bool,
}

impl Decoder {
    /// Creates a new `Decoder` limiting frame payloads to `max_frame_size`.
    pub fn new(max_frame_size: usize, rsv1_allowed: bool) -> Self {
        Self {
            state: None,
            max_frame_size,
            rsv1_allowed,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer, managing header and
    /// payload parsing.
    ///
    /// The decode loop transitions between states based on the completeness of
    /// the buffered data, validating control-frame constraints, reserved bits
    /// and payload-length limits along the way.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a fully decoded frame.
    /// - `Ok(None)`: more data is needed.
    /// - `Err(WebSocketError)`: a protocol violation was detected.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    // Check if enough data is available for basic header
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    // Parse initial header bytes
                    let fin = src[0] & 0b10000000 != 0;
                    let rsv1 = src[0] & 0b01000000 != 0;

                    // Check reserved bits
                    if src[0] & 0b00110000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }
                    if rsv1 && !self.rsv1_allowed {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = frame::OpCode::try_from(src[0] & 0b00001111)?;
                    let masked = src[1] & 0b10000000 != 0;
                    let length_code = src[1] & 0x7F;

                    // Determine additional header length
                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    // Check if enough data is available for the full header
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    // Parse payload length based on `extra` field size
                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        #[cfg(target_pointer_width = "64")]
                        8 => src.get_u64() as usize,
                        #[cfg(any(target_pointer_width = "16", target_pointer_width = "32"))]
                        8 => match usize::try_from(src.get_u64()) {
                            Ok(length) => length,
                            Err(_) => return Err(WebSocketError::FrameTooLarge),
                        },
                        _ => unreachable!(),
                    };

                    // Parse the optional mask key if `masked` is true
                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    // Validate control frame requirements
                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }
                    if payload_len >= self.max_frame_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    // Check if enough data is available for the full payload
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let mask = header_and_mask.mask;
                    let payload_len = header_and_mask.payload_len;

                    let payload = src.split_to(payload_len).freeze();
                    let mut frame = Frame::new(header.fin, header.opcode, mask, payload);
                    frame.rsv1 = header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame encoder serializing [`Frame`] instances into a buffer.
///
/// Masking is applied by the session write path before the frame reaches the
/// encoder; the encoder only serializes the header (including the mask bit and
/// key, if assigned) and appends the payload.
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    /// Encodes a `Frame` into the provided buffer.
    ///
    /// Control frames with payloads larger than [`MAX_CONTROL_PAYLOAD`] are
    /// rejected before anything is written to `dst`.
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.opcode.is_control() && frame.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    const LIMIT: usize = 1024 * 1024;

    fn encode_frame(frame: Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        Encoder.encode(frame, &mut dst).unwrap();
        dst
    }

    fn decode_one(src: &mut BytesMut) -> Frame {
        Decoder::new(LIMIT, false)
            .decode(src)
            .unwrap()
            .expect("complete frame")
    }

    #[test]
    fn test_round_trip_every_opcode() {
        for opcode in [
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ] {
            let payload = Bytes::from_static(b"payload");
            let frame = Frame::new(true, opcode, None, payload.clone());
            let mut wire = encode_frame(frame);

            let decoded = decode_one(&mut wire);
            assert_eq!(decoded.opcode, opcode);
            assert!(decoded.fin);
            assert_eq!(decoded.payload, payload);
            assert!(wire.is_empty());
        }
    }

    #[test]
    fn test_round_trip_masked() {
        let payload = Bytes::from_static(b"masked payload");
        let mut frame = Frame::new(true, OpCode::Binary, Some([1, 2, 3, 4]), payload.clone());
        frame.mask();

        let mut wire = encode_frame(frame);
        let mut decoded = decode_one(&mut wire);
        assert!(decoded.is_masked());
        decoded.unmask();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_round_trip_fragment() {
        let frame = Frame::new(false, OpCode::Text, None, Bytes::from_static(b"TES"));
        let mut wire = encode_frame(frame);
        let decoded = decode_one(&mut wire);
        assert!(!decoded.fin);
        assert_eq!(decoded.opcode, OpCode::Text);
    }

    #[test]
    fn test_decode_resumable_byte_at_a_time() {
        let payload: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let frame = Frame::new(true, OpCode::Binary, None, Bytes::from(payload.clone()));
        let wire = encode_frame(frame);

        let mut decoder = Decoder::new(LIMIT, false);
        let mut src = BytesMut::new();
        let mut decoded = None;

        for &byte in wire.iter() {
            src.extend_from_slice(&[byte]);
            if let Some(frame) = decoder.decode(&mut src).unwrap() {
                decoded = Some(frame);
            }
        }

        let decoded = decoded.expect("frame after final byte");
        assert_eq!(&decoded.payload[..], &payload[..]);
    }

    #[test]
    fn test_control_frame_max_payload() {
        // exactly 125 bytes is legal
        let frame = Frame::new(true, OpCode::Ping, None, Bytes::from(vec![0u8; 125]));
        let mut wire = encode_frame(frame);
        let decoded = decode_one(&mut wire);
        assert_eq!(decoded.payload.len(), 125);

        // 126 bytes must be rejected on encode, before any bytes are written
        let frame = Frame::new(true, OpCode::Ping, None, Bytes::from(vec![0u8; 126]));
        let mut dst = BytesMut::new();
        let err = Encoder.encode(frame, &mut dst).unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameTooLarge));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_oversized_control_frame_rejected_on_decode() {
        // handcraft a ping header claiming a 126-byte payload
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0x89, 126]);
        wire.extend_from_slice(&126u16.to_be_bytes());
        wire.extend_from_slice(&vec![0u8; 126]);

        let err = Decoder::new(LIMIT, false).decode(&mut wire).unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameTooLarge));
    }

    #[test]
    fn test_fragmented_control_frame_rejected() {
        // ping with fin=0
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0x09, 0x00]);

        let err = Decoder::new(LIMIT, false).decode(&mut wire).unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameFragmented));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        for first in [0xB1u8, 0xA1, 0x91] {
            // rsv2/rsv3 combinations on a text frame
            let mut wire = BytesMut::new();
            wire.extend_from_slice(&[first, 0x00]);
            let err = Decoder::new(LIMIT, false).decode(&mut wire).unwrap_err();
            assert!(matches!(err, WebSocketError::ReservedBitsNotZero));
        }
    }

    #[test]
    fn test_rsv1_requires_extension() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0xC1, 0x00]);

        let err = Decoder::new(LIMIT, false).decode(&mut wire).unwrap_err();
        assert!(matches!(err, WebSocketError::ReservedBitsNotZero));

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0xC1, 0x00]);
        let frame = Decoder::new(LIMIT, true)
            .decode(&mut wire)
            .unwrap()
            .expect("frame");
        assert!(frame.rsv1);
    }

    #[test]
    fn test_invalid_opcode_rejected() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0x83, 0x00]);

        let err = Decoder::new(LIMIT, false).decode(&mut wire).unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidOpCode(0x3)));
    }

    #[test]
    fn test_frame_size_limit() {
        let frame = Frame::new(true, OpCode::Binary, None, Bytes::from(vec![0u8; 64]));
        let mut wire = encode_frame(frame);

        let err = Decoder::new(32, false).decode(&mut wire).unwrap_err();
        assert!(matches!(err, WebSocketError::FrameTooLarge));
    }
}
