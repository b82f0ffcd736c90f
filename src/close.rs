//! Close codes and close reasons for the WebSocket close handshake.
//!
//! A close frame carries an optional payload: a two-byte status code in network
//! byte order, optionally followed by a UTF-8 reason string. This module models
//! both parts as [`CloseCode`] and [`CloseReason`] and enforces the control-frame
//! payload limit (125 bytes total, so at most 123 bytes of reason).
//!
//! Codes 1000-2999 are reserved by the protocol and its future revisions,
//! 3000-3999 are registered with IANA for libraries and frameworks, and
//! 4000-4999 are free for application use.

use bytes::Bytes;

use crate::WebSocketError;

/// Maximum number of reason bytes that fit in a close frame payload.
///
/// Control frames are limited to 125 payload bytes and the close code consumes
/// the first two.
pub const MAX_REASON_BYTES: usize = 123;

/// Status code sent or received in a close frame.
///
/// The variants cover the codes defined in
/// [RFC 6455 Section 7.4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4.1).
/// Unlisted values map to [`CloseCode::Iana`], [`CloseCode::Application`] or
/// [`CloseCode::Reserved`] depending on their range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure; the purpose for which the connection was
    /// established has been fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, browser navigation,
    /// idle-timeout expiry).
    Away,
    /// 1002: the endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// 1003: the endpoint received a data type it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Must never be sent on the wire.
    Status,
    /// 1006: the connection was closed abnormally. Must never be sent on the wire.
    Abnormal,
    /// 1007: a message contained data inconsistent with its type
    /// (e.g. non-UTF-8 text).
    InvalidPayload,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    TooBig,
    /// 1010: the client expected an extension the server did not negotiate.
    MandatoryExtension,
    /// 1011: the server encountered an unexpected condition.
    InternalError,
    /// 1012: the service is restarting.
    ServiceRestart,
    /// 1013: the service is overloaded; try again later.
    TryAgain,
    /// 1015: TLS handshake failure. Must never be sent on the wire.
    Tls,
    /// 3000-3999: registered with IANA for use by libraries and frameworks.
    Iana(u16),
    /// 4000-4999: reserved for private application use.
    Application(u16),
    /// Everything else: unassigned or reserved values.
    Reserved(u16),
}

impl CloseCode {
    /// Returns `true` if this code may legally appear in a close frame on the
    /// wire, either sent or received.
    ///
    /// The codes 1004, 1005, 1006, 1015 and everything below 1000 or in the
    /// unassigned 1016-2999 range are rejected as protocol violations.
    pub fn is_allowed(&self) -> bool {
        !matches!(
            self,
            Self::Status | Self::Abnormal | Self::Tls | Self::Reserved(_)
        )
    }

    /// Returns `true` for codes in the application-defined 4000-4999 range.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application(_))
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::Policy,
            1009 => Self::TooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgain,
            1015 => Self::Tls,
            3000..=3999 => Self::Iana(value),
            4000..=4999 => Self::Application(value),
            _ => Self::Reserved(value),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        match value {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::ServiceRestart => 1012,
            CloseCode::TryAgain => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Iana(code) => code,
            CloseCode::Application(code) => code,
            CloseCode::Reserved(code) => code,
        }
    }
}

/// A close code paired with an optional human-readable reason string.
///
/// `CloseReason` is the application-level view of a close frame payload. The
/// reason is capped at [`MAX_REASON_BYTES`] UTF-8 bytes; longer strings are
/// truncated at a character boundary on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    code: CloseCode,
    reason: String,
}

impl CloseReason {
    /// Creates a close reason, truncating the reason string to fit a control
    /// frame payload.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        let mut reason: String = reason.into();
        if reason.len() > MAX_REASON_BYTES {
            let mut cut = MAX_REASON_BYTES;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        Self { code, reason }
    }

    /// A normal closure (code 1000) with an empty reason.
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }

    /// The close code.
    pub fn code(&self) -> CloseCode {
        self.code
    }

    /// The reason string; empty when the peer supplied none.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Serializes the reason into a close frame payload: two code bytes in
    /// network order followed by the UTF-8 reason.
    pub fn to_payload(&self) -> Bytes {
        let code16 = u16::from(self.code);
        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&code16.to_be_bytes());
        payload.extend_from_slice(self.reason.as_bytes());
        payload.into()
    }

    /// Parses a close frame payload.
    ///
    /// An empty payload maps to [`CloseCode::Status`] (no status present). A
    /// one-byte payload, a non-UTF-8 reason or a code outside the allowed
    /// ranges are protocol violations.
    pub fn parse(payload: &[u8]) -> crate::Result<Self> {
        match payload.len() {
            0 => Ok(Self {
                code: CloseCode::Status,
                reason: String::new(),
            }),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code =
                    CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WebSocketError::InvalidUtf8)?;

                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }

                Ok(Self {
                    code,
                    reason: reason.to_owned(),
                })
            }
        }
    }
}

impl From<CloseCode> for CloseReason {
    fn from(code: CloseCode) -> Self {
        Self::new(code, "")
    }
}
