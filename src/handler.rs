//! Application-facing session callbacks.
//!
//! Endpoints implement [`SessionHandler`] and override only the callbacks they
//! care about; every method has a default no-op body. Callbacks run on the
//! session's dispatch task, never on the I/O task, so a slow handler delays
//! its own session without stalling frame pumping for others.

use bytes::Bytes;

use crate::{
    close::CloseReason,
    reassembly::DeliveryMode,
    session::{MessageReader, Session},
    Result, WebSocketError,
};

/// Callbacks for one session's lifetime.
///
/// Invocation order per session: `on_open` once, then data and control
/// callbacks in receive order, then `on_close` exactly once. `on_error` can
/// fire at any point, including after `on_close` for transport failures
/// discovered during teardown.
pub trait SessionHandler: Send {
    /// The session reached the open state and can send.
    fn on_open(&mut self, _session: &Session) {}

    /// A text message or fragment arrived.
    ///
    /// In [`DeliveryMode::Whole`] this is the complete message and `last` is
    /// always true. In [`DeliveryMode::Partial`] each fragment arrives
    /// separately, split at valid UTF-8 boundaries.
    fn on_text(&mut self, _session: &Session, _text: &str, _last: bool) {}

    /// A binary message or fragment arrived; `last` as for [`Self::on_text`].
    fn on_binary(&mut self, _session: &Session, _data: Bytes, _last: bool) {}

    /// A new message arrived in [`DeliveryMode::Reader`]; consume it through
    /// the reader at your own pace.
    fn on_reader(&mut self, _session: &Session, _reader: MessageReader) {}

    /// The peer sent a ping. The pong reply has already been queued.
    fn on_ping(&mut self, _session: &Session, _payload: Bytes) {}

    /// The peer answered a ping.
    fn on_pong(&mut self, _session: &Session, _payload: Bytes) {}

    /// The session closed. `reason` is what the peer sent, what this side
    /// initiated, or an abnormal reason synthesized from a transport error.
    fn on_close(&mut self, _session: &Session, _reason: &CloseReason) {}

    /// Something went wrong. Non-fatal errors (decode failures, handler
    /// panics) leave the session usable; fatal ones are followed by
    /// `on_close`.
    fn on_error(&mut self, _session: &Session, _error: &WebSocketError) {}

    /// How this handler wants inbound messages delivered.
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Whole
    }

    /// Optional per-handler message size cap. The effective limit is the
    /// stricter of this and the session default.
    fn max_message_size(&self) -> Option<usize> {
        None
    }
}

/// Decodes a received text message into a typed value.
pub trait TextDecoder<T>: Send {
    fn decode(&self, text: &str) -> Result<T>;
}

/// Decodes a received binary message into a typed value.
pub trait BinaryDecoder<T>: Send {
    fn decode(&self, data: &[u8]) -> Result<T>;
}

/// Encodes a typed value as a text message.
pub trait TextEncoder<T>: Send {
    fn encode(&self, value: &T) -> Result<String>;
}

/// Encodes a typed value as a binary message.
pub trait BinaryEncoder<T>: Send {
    fn encode(&self, value: &T) -> Result<Bytes>;
}

/// Typed counterpart of [`SessionHandler`] used with [`DecodingHandler`].
pub trait ObjectHandler<T>: Send {
    /// A message decoded successfully.
    fn on_object(&mut self, session: &Session, object: T);

    fn on_open(&mut self, _session: &Session) {}
    fn on_close(&mut self, _session: &Session, _reason: &CloseReason) {}

    /// A decode failure or session error. Decode failures never close the
    /// connection.
    fn on_error(&mut self, _session: &Session, _error: &WebSocketError) {}
}

/// Adapter that decodes whole messages into objects before dispatch.
///
/// Attach a text decoder, a binary decoder or both; messages of a kind with no
/// decoder are dropped. Always operates in [`DeliveryMode::Whole`].
pub struct DecodingHandler<T, H> {
    text: Option<Box<dyn TextDecoder<T>>>,
    binary: Option<Box<dyn BinaryDecoder<T>>>,
    handler: H,
}

impl<T, H: ObjectHandler<T>> DecodingHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            text: None,
            binary: None,
            handler,
        }
    }

    pub fn with_text(mut self, decoder: impl TextDecoder<T> + 'static) -> Self {
        self.text = Some(Box::new(decoder));
        self
    }

    pub fn with_binary(mut self, decoder: impl BinaryDecoder<T> + 'static) -> Self {
        self.binary = Some(Box::new(decoder));
        self
    }
}

impl<T: Send, H: ObjectHandler<T>> SessionHandler for DecodingHandler<T, H> {
    fn on_open(&mut self, session: &Session) {
        self.handler.on_open(session);
    }

    fn on_text(&mut self, session: &Session, text: &str, _last: bool) {
        if let Some(decoder) = self.text.as_ref() {
            match decoder.decode(text) {
                Ok(object) => self.handler.on_object(session, object),
                Err(err) => self.handler.on_error(session, &err),
            }
        }
    }

    fn on_binary(&mut self, session: &Session, data: Bytes, _last: bool) {
        if let Some(decoder) = self.binary.as_ref() {
            match decoder.decode(&data) {
                Ok(object) => self.handler.on_object(session, object),
                Err(err) => self.handler.on_error(session, &err),
            }
        }
    }

    fn on_close(&mut self, session: &Session, reason: &CloseReason) {
        self.handler.on_close(session, reason);
    }

    fn on_error(&mut self, session: &Session, error: &WebSocketError) {
        self.handler.on_error(session, error);
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Whole
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    struct IntDecoder;

    impl TextDecoder<i64> for IntDecoder {
        fn decode(&self, text: &str) -> Result<i64> {
            text.trim()
                .parse()
                .map_err(|err| WebSocketError::Decode(format!("not an integer: {err}")))
        }
    }

    #[derive(Default)]
    struct Collector {
        objects: Vec<i64>,
        errors: Vec<String>,
    }

    impl ObjectHandler<i64> for Collector {
        fn on_object(&mut self, _session: &Session, object: i64) {
            self.objects.push(object);
        }

        fn on_error(&mut self, _session: &Session, error: &WebSocketError) {
            self.errors.push(error.to_string());
        }
    }

    #[tokio::test]
    async fn test_decoding_handler_dispatches_objects() {
        let session = Session::detached();
        let mut handler = DecodingHandler::new(Collector::default()).with_text(IntDecoder);

        handler.on_text(&session, "42", true);
        handler.on_text(&session, " -7 ", true);
        assert_eq!(handler.handler.objects, vec![42, -7]);
        assert!(handler.handler.errors.is_empty());
    }

    #[tokio::test]
    async fn test_decode_failure_goes_to_on_error() {
        let session = Session::detached();
        let mut handler = DecodingHandler::new(Collector::default()).with_text(IntDecoder);

        handler.on_text(&session, "not-a-number", true);
        assert!(handler.handler.objects.is_empty());
        assert_eq!(handler.handler.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_kind_without_decoder_is_dropped() {
        let session = Session::detached();
        let mut handler = DecodingHandler::new(Collector::default()).with_text(IntDecoder);

        handler.on_binary(&session, Bytes::from_static(b"99"), true);
        assert!(handler.handler.objects.is_empty());
        assert!(handler.handler.errors.is_empty());
    }

    struct Silent;
    impl SessionHandler for Silent {}

    #[test]
    fn test_defaults() {
        let handler = Silent;
        assert_eq!(handler.delivery_mode(), DeliveryMode::Whole);
        assert!(handler.max_message_size().is_none());
    }
}
