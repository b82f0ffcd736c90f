//! # sockeye
//! A WebSocket (RFC 6455) session engine: handshake negotiation, a resumable
//! frame codec, fragmented-message reassembly, a monotonic session lifecycle
//! with idle-timeout and heartbeat handling, an extension pipeline and
//! container-level session tracking with broadcast fan-out.
//!
//! Applications implement [`SessionHandler`] with explicit typed callbacks
//! (`on_open`, `on_text`, `on_binary`, `on_ping`, `on_pong`, `on_close`,
//! `on_error`), all defaulted so an endpoint only overrides what it needs.
//! Handlers never run on the raw I/O task: each session pumps frames on its
//! own task and dispatches events to the handler in receive order on another.
//!
//! # Features
//! - `logging`: emit negotiation and transport diagnostics through the `log`
//!   crate.
//!
//! # Client Example
//! ```no_run
//! use sockeye::{ClientOptions, Container, Session, SessionHandler};
//!
//! struct Echo;
//!
//! impl SessionHandler for Echo {
//!     fn on_text(&mut self, _session: &Session, text: &str, _last: bool) {
//!         println!("received: {text}");
//!     }
//! }
//!
//! async fn client() -> sockeye::Result<()> {
//!     let container = Container::with_defaults();
//!     let url = "ws://echo.example.org/chat".parse()?;
//!     let session = container
//!         .connect(&url, ClientOptions::default(), Box::new(Echo))
//!         .await?;
//!
//!     session.send_text("hello").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Server Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use hyper::{body::Incoming, Request};
//! use sockeye::{handshake::HttpResponse, Container, SessionHandler};
//!
//! struct Silent;
//! impl SessionHandler for Silent {}
//!
//! async fn serve(
//!     container: Arc<Container>,
//!     mut request: Request<Incoming>,
//! ) -> sockeye::Result<HttpResponse> {
//!     let (response, fut) = container.upgrade(&mut request)?;
//!
//!     let adopter = Arc::clone(&container);
//!     tokio::spawn(async move {
//!         if let Err(err) = adopter.adopt(fut, Box::new(Silent)).await {
//!             eprintln!("upgrade failed: {err}");
//!         }
//!     });
//!
//!     Ok(response)
//! }
//! ```
//!
//! # Size limits
//! Frame payloads are bounded by [`SessionConfig::max_frame_size`]; whole
//! messages are bounded per kind by [`MessageLimits`], with handlers able to
//! tighten (never widen) their own limit. Exceeding a message limit tears the
//! connection down with close code 1009.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod broadcast;
pub mod close;
pub mod codec;
pub mod container;
pub mod extension;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod mask;
pub mod reassembly;
pub mod session;

use thiserror::Error;

pub use broadcast::BroadcastMode;
pub use close::{CloseCode, CloseReason};
pub use container::{ClientOptions, Container, ContainerConfig, WorkerPool};
pub use frame::{FrameView, OpCode};
pub use handler::SessionHandler;
pub use handshake::{AcceptConfig, ConnectOptions, HandshakeHeaders, Role, UpgradeFut};
pub use mask::{MaskKeyGenerator, RandomMaskKeyGenerator};
pub use reassembly::{DeliveryMode, MessageKind, MessageLimits};
pub use session::{MessageReader, Session, SessionConfig, SessionId, SessionState};

/// A result type for session operations, using [`WebSocketError`] as the
/// error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors that can occur while negotiating, running or closing a session.
///
/// Fatal protocol and size violations tear the connection down with a mapped
/// close code (see [`WebSocketError::close_code`]); state errors like
/// [`WebSocketError::SessionClosed`] and application-level failures like
/// [`WebSocketError::Decode`] only surface to the caller or to `on_error`.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Reserved bits in the frame header are set without a negotiated
    /// extension claiming them.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A frame carried an opcode outside the set defined by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A control frame (close, ping, pong) arrived with the FIN bit clear.
    /// Control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeds the 125-byte limit. Raised before any
    /// bytes are written on send, and on receipt of an oversized frame.
    #[error("Control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// A single frame's payload exceeds the configured frame-size limit.
    #[error("Frame too large")]
    FrameTooLarge,

    /// An accumulated message exceeds the effective message-size limit.
    /// The connection closes with code 1009.
    #[error("Message too large")]
    MessageTooBig,

    /// A continuation frame arrived with no message in progress, or a new
    /// initial data frame arrived while one was still open.
    #[error("Invalid continuation frame")]
    InvalidContinuation,

    /// A text message or close reason contains invalid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUtf8,

    /// A close frame has an invalid format (one-byte payload).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code that must not appear on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// The client sent an unmasked frame; RFC 6455 requires all
    /// client-to-server frames to be masked.
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// The server sent a masked frame; server-to-client frames must not be
    /// masked.
    #[error("Server frame is masked")]
    MaskedFrame,

    /// The operation requires an open session. Raised by every send,
    /// accessor and close call once the session is closing or closed.
    #[error("Session is closed")]
    SessionClosed,

    /// Another outbound message sequence is in flight and did not finish
    /// within the send timeout.
    #[error("Another message is pending")]
    MessagePending,

    /// The upgrade request is missing the `Sec-WebSocket-Key` header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The `Sec-WebSocket-Version` header is not "13".
    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// The HTTP `Upgrade` header is missing or not "websocket".
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The HTTP `Connection` header is missing or lacks the "upgrade" token.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The server answered the upgrade request with a status other than
    /// `101 Switching Protocols`.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The server's `Sec-WebSocket-Accept` value does not match the key the
    /// client sent.
    #[error("Sec-WebSocket-Accept does not match the sent key")]
    BadAcceptKey,

    /// The server selected a subprotocol the client never offered.
    #[error("Server selected a subprotocol that was not offered")]
    SubprotocolNotOffered,

    /// The server accepted an extension the client never offered.
    #[error("Server selected an extension that was not offered")]
    ExtensionNotOffered,

    /// A `Sec-WebSocket-Extensions` header could not be parsed or built.
    #[error("Invalid Sec-WebSocket-Extensions header")]
    InvalidExtensionHeader,

    /// A subprotocol name is not a valid header value.
    #[error("Invalid subprotocol name")]
    InvalidSubprotocol,

    /// The connect-and-upgrade attempt exceeded the handshake timeout.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The HTTP proxy refused or botched the `CONNECT` tunnel.
    #[error("Proxy failure: {0}")]
    ProxyFailure(String),

    /// Only the "ws" scheme is supported.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The URL lacks a host or a resolvable port.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A message decoder rejected a received payload. Decode failures go to
    /// `on_error` and leave the connection usable.
    #[error("Decode failure: {0}")]
    Decode(String),

    /// A handler callback panicked; the panic was caught and the session kept
    /// running.
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Wraps URL parsing errors.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// Wraps I/O errors from the underlying transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps hyper connection errors raised during the handshake or upgrade.
    #[error(transparent)]
    Http(#[from] hyper::Error),

    /// Wraps HTTP request/response construction errors.
    #[error(transparent)]
    HttpBuild(#[from] hyper::http::Error),
}

impl WebSocketError {
    /// The close code an abnormal teardown caused by this error carries.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::MessageTooBig | Self::FrameTooLarge | Self::ControlFrameTooLarge => {
                CloseCode::TooBig
            }
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            Self::ReservedBitsNotZero
            | Self::InvalidOpCode(_)
            | Self::ControlFrameFragmented
            | Self::InvalidContinuation
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode
            | Self::UnmaskedFrame
            | Self::MaskedFrame => CloseCode::Protocol,
            _ => CloseCode::InternalError,
        }
    }
}
