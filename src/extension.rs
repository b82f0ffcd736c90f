//! Extension negotiation and the per-session extension pipeline.
//!
//! An extension is negotiated once during the opening handshake via the
//! `Sec-WebSocket-Extensions` header and stays fixed for the session's
//! lifetime. Negotiated extensions form an ordered [`ExtensionPipeline`]
//! that transforms outgoing frames in negotiated order and incoming frames
//! in reverse order, the standard layered-transform discipline.
//!
//! The header syntax is a comma-separated list of offers, each an extension
//! name followed by `;`-separated parameters:
//!
//! ```text
//! Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits, x-audit
//! ```

use std::str::FromStr;

use nom::{
    bytes::complete::tag,
    bytes::complete::take_while1,
    character::complete::space0,
    combinator::opt,
    sequence::{pair, preceded},
    IResult, Parser,
};

use crate::{frame::Frame, handshake::HandshakeHeaders, Result};

/// An extension name plus its ordered list of name/value parameter pairs, as
/// exchanged in the `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSpec {
    name: String,
    params: Vec<(String, Option<String>)>,
}

impl ExtensionSpec {
    /// Creates a spec with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Appends a parameter, returning the spec for chaining.
    pub fn with_param(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.params.push((key.into(), value));
        self
    }

    /// The extension name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordered parameter list.
    pub fn params(&self) -> &[(String, Option<String>)] {
        &self.params
    }

    /// Looks up a parameter value by key.
    pub fn param(&self, key: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
    }

    /// Parses one extension offer (no commas).
    fn parse(input: &str) -> std::result::Result<(&str, Self), nom::Err<nom::error::Error<&str>>> {
        let (remaining, name) = preceded(space0, token).parse(input)?;
        let mut this = Self::new(name);

        let mut input = remaining;
        while input.trim_start().starts_with(';') {
            let (remaining, (key, value)) = parse_param(input.trim_start())?;
            this.params.push((key.to_owned(), value.map(str::to_owned)));
            input = remaining;
        }

        Ok((input, this))
    }

    /// Parses a comma-separated list of extension offers.
    ///
    /// Duplicate `Sec-WebSocket-Extensions` request headers must be coalesced
    /// by the caller into one comma-joined value before parsing; this function
    /// preserves the offer order.
    pub fn parse_list(input: &str) -> std::result::Result<Vec<Self>, String> {
        let mut specs = Vec::new();
        let mut input = input.trim();

        while !input.is_empty() {
            let (remaining, spec) = Self::parse(input).map_err(|err| err.to_string())?;
            specs.push(spec);

            let remaining = remaining.trim_start();
            input = match remaining.strip_prefix(',') {
                Some(rest) => rest.trim_start(),
                None if remaining.is_empty() => remaining,
                None => return Err(format!("unexpected input: {remaining:?}")),
            };
        }

        Ok(specs)
    }

    /// Formats a list of specs as a header value.
    pub fn format_list(specs: &[Self]) -> String {
        specs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Token characters accepted in extension names and parameter keys/values.
fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')(input)
}

/// Parses one `; key` or `; key=value` parameter.
fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        tag(";"),
        preceded(space0, pair(token, opt(preceded(tag("="), token)))),
    )
    .parse(input)
}

impl std::fmt::Display for ExtensionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.params {
            match value {
                Some(value) => write!(f, "; {key}={value}")?,
                None => write!(f, "; {key}")?,
            }
        }
        Ok(())
    }
}

impl FromStr for ExtensionSpec {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let (remaining, spec) = Self::parse(input).map_err(|err| err.to_string())?;
        if !remaining.trim().is_empty() {
            return Err(format!("unexpected input: {remaining:?}"));
        }
        Ok(spec)
    }
}

/// A negotiated frame-transform layer.
///
/// Extensions see full [`Frame`]s so they can rewrite payloads, flip the RSV1
/// bit, or merely observe traffic. `process_outgoing` runs on send in
/// negotiated order; `process_incoming` runs on receive in reverse order.
/// Either may return a new transformed frame in place of its input.
pub trait Extension: Send {
    /// The spec this extension was negotiated with, including its final
    /// parameters.
    fn spec(&self) -> &ExtensionSpec;

    /// Transforms an outgoing frame before masking and serialization.
    fn process_outgoing(&mut self, frame: Frame) -> Result<Frame>;

    /// Transforms an incoming frame after unmasking, before reassembly.
    fn process_incoming(&mut self, frame: Frame) -> Result<Frame>;

    /// Observes the masking key actually applied to an outgoing frame.
    ///
    /// Called on the client side only, after masking. The default does
    /// nothing; auditing extensions use this to verify key selection.
    fn observe_mask_key(&mut self, _key: [u8; 4]) {}

    /// Whether this extension claims the RSV1 header bit.
    fn uses_rsv1(&self) -> bool {
        false
    }
}

/// The ordered chain of negotiated extensions for one session.
///
/// An empty pipeline is the common case (the default negotiation policy
/// accepts nothing) and is free of per-frame overhead.
pub struct ExtensionPipeline {
    chain: Vec<Box<dyn Extension>>,
}

impl ExtensionPipeline {
    /// Builds a pipeline from extensions in negotiated order.
    pub fn new(chain: Vec<Box<dyn Extension>>) -> Self {
        Self { chain }
    }

    /// A pipeline with no extensions.
    pub fn empty() -> Self {
        Self { chain: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The negotiated specs, in pipeline order.
    pub fn specs(&self) -> Vec<ExtensionSpec> {
        self.chain.iter().map(|ext| ext.spec().clone()).collect()
    }

    /// Whether any extension in the chain claims the RSV1 bit.
    pub fn rsv1_allowed(&self) -> bool {
        self.chain.iter().any(|ext| ext.uses_rsv1())
    }

    /// Applies the chain to an outgoing frame, in negotiated order.
    pub fn process_outgoing(&mut self, mut frame: Frame) -> Result<Frame> {
        for ext in self.chain.iter_mut() {
            frame = ext.process_outgoing(frame)?;
        }
        Ok(frame)
    }

    /// Applies the chain to an incoming frame, in reverse order.
    pub fn process_incoming(&mut self, mut frame: Frame) -> Result<Frame> {
        for ext in self.chain.iter_mut().rev() {
            frame = ext.process_incoming(frame)?;
        }
        Ok(frame)
    }

    /// Reports the masking key used for an outgoing frame to every extension.
    pub fn observe_mask_key(&mut self, key: [u8; 4]) {
        for ext in self.chain.iter_mut() {
            ext.observe_mask_key(key);
        }
    }
}

/// Server-side extension negotiation hook.
///
/// Given the client's requested specs (in offer order) and a read-only view of
/// the handshake headers, the negotiator returns the chosen extensions in the
/// order they should be applied. The chosen specs are echoed back to the
/// client in the `Sec-WebSocket-Extensions` response header.
pub trait ExtensionNegotiator: Send + Sync {
    fn negotiate(
        &self,
        requested: &[ExtensionSpec],
        headers: &HandshakeHeaders,
    ) -> Vec<Box<dyn Extension>>;
}

/// Default negotiation policy: accept nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllExtensions;

impl ExtensionNegotiator for DenyAllExtensions {
    fn negotiate(
        &self,
        _requested: &[ExtensionSpec],
        _headers: &HandshakeHeaders,
    ) -> Vec<Box<dyn Extension>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;
    use bytes::BytesMut;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_single_spec() {
        let spec = ExtensionSpec::from_str(
            "permessage-deflate; client_no_context_takeover; server_max_window_bits=7",
        )
        .unwrap();

        assert_eq!(spec.name(), "permessage-deflate");
        assert_eq!(spec.param("client_no_context_takeover"), Some(None));
        assert_eq!(spec.param("server_max_window_bits"), Some(Some("7")));
        assert_eq!(spec.param("missing"), None);
    }

    #[test]
    fn test_parse_list() {
        let specs = ExtensionSpec::parse_list("foo, bar; baz=1, x-audit; mode=verify").unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].name(), "foo");
        assert_eq!(specs[1].name(), "bar");
        assert_eq!(specs[1].param("baz"), Some(Some("1")));
        assert_eq!(specs[2].param("mode"), Some(Some("verify")));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ExtensionSpec::parse_list("foo; =broken").is_err());
        assert!(ExtensionSpec::from_str("").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let spec = ExtensionSpec::new("x-audit")
            .with_param("mode", Some("verify".into()))
            .with_param("strict", None);

        let formatted = spec.to_string();
        assert_eq!(formatted, "x-audit; mode=verify; strict");
        assert_eq!(ExtensionSpec::from_str(&formatted).unwrap(), spec);
    }

    #[test]
    fn test_format_list() {
        let specs = vec![ExtensionSpec::new("a"), ExtensionSpec::new("b")];
        assert_eq!(ExtensionSpec::format_list(&specs), "a, b");
    }

    /// Extension that records the order in which it runs.
    struct Recorder {
        spec: ExtensionSpec,
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        keys: Vec<[u8; 4]>,
    }

    impl Recorder {
        fn new(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                spec: ExtensionSpec::new(label),
                label,
                log,
                keys: Vec::new(),
            }
        }
    }

    impl Extension for Recorder {
        fn spec(&self) -> &ExtensionSpec {
            &self.spec
        }

        fn process_outgoing(&mut self, frame: Frame) -> Result<Frame> {
            self.log.lock().unwrap().push(format!("{}:out", self.label));
            Ok(frame)
        }

        fn process_incoming(&mut self, frame: Frame) -> Result<Frame> {
            self.log.lock().unwrap().push(format!("{}:in", self.label));
            Ok(frame)
        }

        fn observe_mask_key(&mut self, key: [u8; 4]) {
            self.keys.push(key);
        }
    }

    #[test]
    fn test_pipeline_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ExtensionPipeline::new(vec![
            Box::new(Recorder::new("first", Arc::clone(&log))),
            Box::new(Recorder::new("second", Arc::clone(&log))),
        ]);

        let frame = Frame::new(true, OpCode::Text, None, BytesMut::new());
        let frame = pipeline.process_outgoing(frame).unwrap();
        pipeline.process_incoming(frame).unwrap();

        // negotiated order on send, reverse order on receive
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:out", "second:out", "second:in", "first:in"]
        );
    }

    #[test]
    fn test_pipeline_specs_and_rsv1() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ExtensionPipeline::new(vec![Box::new(Recorder::new("only", log))]);
        assert_eq!(pipeline.specs(), vec![ExtensionSpec::new("only")]);
        assert!(!pipeline.rsv1_allowed());
        assert!(ExtensionPipeline::empty().is_empty());
    }
}
