//! Opening handshake: the HTTP/1.1 upgrade on both sides of the connection.
//!
//! The server side validates an incoming upgrade request, negotiates a
//! subprotocol and extensions, and returns a `101 Switching Protocols`
//! response together with an [`UpgradeFut`] that resolves to the raw upgraded
//! stream once hyper has relinquished the connection.
//!
//! The client side builds the upgrade request, sends it over a hyper http1
//! connection (optionally tunnelled through an HTTP proxy with `CONNECT`) and
//! verifies the response: status, upgrade headers, the accept key and that the
//! server only selected what was offered. The whole attempt is bounded by a
//! handshake timeout.

use std::{pin::Pin, sync::Arc, task::Context, task::Poll, time::Duration};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    body::Incoming, header, upgrade::Upgraded, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use url::Url;

use crate::{
    extension::{DenyAllExtensions, Extension, ExtensionNegotiator, ExtensionPipeline, ExtensionSpec},
    Result, WebSocketError,
};

/// HTTP request type used for incoming upgrade requests on the server.
pub type HttpRequest = Request<Incoming>;

/// HTTP response type produced by the server-side upgrade.
pub type HttpResponse = Response<Empty<Bytes>>;

/// Which end of the connection a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Masks outgoing frames, rejects masked incoming frames.
    Client,
    /// Unmasks incoming frames, never masks outgoing ones.
    Server,
}

/// Read-only view over the upgrade request headers.
///
/// Negotiation hooks receive this instead of the raw header map so they can
/// inspect but never mutate the request. Duplicate request headers are kept;
/// [`HandshakeHeaders::all`] returns every value for a name.
#[derive(Debug, Clone)]
pub struct HandshakeHeaders {
    inner: hyper::HeaderMap,
}

impl HandshakeHeaders {
    /// The first value for `name`, if present and valid UTF-8.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value for `name`, in request order.
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.inner
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Every value for `name`, split on commas and trimmed. Duplicate headers
    /// and comma-joined values coalesce into one list.
    pub fn all_tokens(&self, name: &str) -> Vec<&str> {
        self.all(name)
            .into_iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .collect()
    }
}

impl From<&hyper::HeaderMap> for HandshakeHeaders {
    fn from(inner: &hyper::HeaderMap) -> Self {
        Self {
            inner: inner.clone(),
        }
    }
}

/// Server-side subprotocol selection hook.
pub trait SubprotocolPolicy: Send + Sync {
    /// Picks a subprotocol from the client's offers (in preference order) and
    /// the server's supported list, or `None` when nothing matches. A `None`
    /// result means the response carries no `Sec-WebSocket-Protocol` header.
    fn select(&self, client_offers: &[&str], server_supported: &[String]) -> Option<String>;
}

/// Default policy: the first client offer the server supports wins.
///
/// The client's preference order decides, not the server's.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstClientPreference;

impl SubprotocolPolicy for FirstClientPreference {
    fn select(&self, client_offers: &[&str], server_supported: &[String]) -> Option<String> {
        client_offers
            .iter()
            .find(|offer| server_supported.iter().any(|s| s == *offer))
            .map(|offer| (*offer).to_owned())
    }
}

/// Server-side handshake configuration.
#[derive(Clone)]
pub struct AcceptConfig {
    /// Subprotocols this endpoint supports.
    pub subprotocols: Vec<String>,
    /// Selection policy applied to the client's offers.
    pub subprotocol_policy: Arc<dyn SubprotocolPolicy>,
    /// Extension negotiation hook.
    pub extension_negotiator: Arc<dyn ExtensionNegotiator>,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            subprotocol_policy: Arc::new(FirstClientPreference),
            extension_negotiator: Arc::new(DenyAllExtensions),
        }
    }
}

/// Outcome of a successful server-side negotiation.
pub struct ServerNegotiation {
    pub subprotocol: Option<String>,
    pub path: String,
    pub pipeline: ExtensionPipeline,
}

/// Outcome of a successful client-side handshake.
///
/// `extensions` lists the specs the server accepted, in pipeline order; the
/// caller matches them back to the extension instances it offered with
/// [`assemble_pipeline`].
#[derive(Debug)]
pub struct ClientNegotiation {
    pub subprotocol: Option<String>,
    pub path: String,
    pub extensions: Vec<ExtensionSpec>,
}

/// Validates an incoming upgrade request and prepares the protocol switch.
///
/// On success returns the `101 Switching Protocols` response to send back and
/// a future resolving to the upgraded stream. The response must be written to
/// the client before the future can complete.
pub fn upgrade<B>(
    mut request: impl std::borrow::BorrowMut<Request<B>>,
    config: &AcceptConfig,
) -> Result<(HttpResponse, UpgradeFut)> {
    let request = request.borrow_mut();

    let key = request
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    if request
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes())
        != Some(b"13")
    {
        return Err(WebSocketError::InvalidSecWebsocketVersion);
    }

    let headers = HandshakeHeaders::from(request.headers());

    if !headers
        .get(header::UPGRADE.as_str())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !headers
        .all_tokens(header::CONNECTION.as_str())
        .iter()
        .any(|token| token.eq_ignore_ascii_case("upgrade"))
    {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let offers = headers.all_tokens(header::SEC_WEBSOCKET_PROTOCOL.as_str());
    let subprotocol = config
        .subprotocol_policy
        .select(&offers, &config.subprotocols);

    let requested = match headers.get(header::SEC_WEBSOCKET_EXTENSIONS.as_str()) {
        Some(value) => ExtensionSpec::parse_list(value)
            .map_err(|_| WebSocketError::InvalidExtensionHeader)?,
        None => Vec::new(),
    };
    let chosen = config.extension_negotiator.negotiate(&requested, &headers);
    let pipeline = ExtensionPipeline::new(chosen);

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(
            header::SEC_WEBSOCKET_ACCEPT,
            sec_websocket_accept(key.as_bytes()),
        )
        .body(Empty::new())
        .expect("bug: failed to build response");

    // no match means no response header, not an error
    if let Some(subprotocol) = subprotocol.as_deref() {
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            subprotocol
                .parse()
                .map_err(|_| WebSocketError::InvalidSubprotocol)?,
        );
    }

    if !pipeline.is_empty() {
        let value = ExtensionSpec::format_list(&pipeline.specs());
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            value
                .parse()
                .map_err(|_| WebSocketError::InvalidExtensionHeader)?,
        );
    }

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_owned());

    let fut = UpgradeFut {
        inner: hyper::upgrade::on(request),
        negotiation: Some(ServerNegotiation {
            subprotocol,
            path,
            pipeline,
        }),
    };

    Ok((response, fut))
}

/// Future completing the server-side protocol switch.
///
/// Resolves once hyper has sent the `101` response and released the
/// underlying stream.
#[pin_project]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
    negotiation: Option<ServerNegotiation>,
}

impl std::future::Future for UpgradeFut {
    type Output = Result<(TokioIo<Upgraded>, ServerNegotiation)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = match this.inner.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(x) => x?,
        };

        let negotiation = this
            .negotiation
            .take()
            .expect("UpgradeFut polled after completion");

        Poll::Ready(Ok((TokioIo::new(upgraded), negotiation)))
    }
}

/// Client-side handshake parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Subprotocols to offer, in preference order.
    pub subprotocols: Vec<String>,
    /// Extension specs to offer.
    pub extension_offers: Vec<ExtensionSpec>,
    /// Upper bound on the whole connect-and-upgrade attempt.
    pub handshake_timeout: Duration,
    /// HTTP proxy to tunnel through with `CONNECT`.
    pub proxy: Option<Url>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            extension_offers: Vec::new(),
            handshake_timeout: Duration::from_secs(30),
            proxy: None,
        }
    }
}

/// Opens a TCP connection (directly or through the configured proxy) and runs
/// the upgrade handshake, all bounded by `options.handshake_timeout`.
pub async fn connect(
    url: &Url,
    options: &ConnectOptions,
) -> Result<(TokioIo<Upgraded>, ClientNegotiation)> {
    tokio::time::timeout(options.handshake_timeout, async {
        if url.scheme() != "ws" {
            return Err(WebSocketError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let host = url
            .host_str()
            .ok_or_else(|| WebSocketError::InvalidUrl(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| WebSocketError::InvalidUrl(url.to_string()))?;

        let stream = match options.proxy.as_ref() {
            Some(proxy) => tunnel_through_proxy(proxy, host, port).await?,
            None => TcpStream::connect((host, port)).await?,
        };

        handshake(stream, url, options).await
    })
    .await
    .map_err(|_| WebSocketError::HandshakeTimeout)?
}

/// Runs the client handshake over an already-established stream.
///
/// Useful for custom transports; [`connect`] is the TCP front end.
pub async fn handshake<S>(
    io: S,
    url: &Url,
    options: &ConnectOptions,
) -> Result<(TokioIo<Upgraded>, ClientNegotiation)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let host = url
        .host_str()
        .ok_or_else(|| WebSocketError::InvalidUrl(url.to_string()))?;
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };

    let key = generate_key();
    let expected_accept = sec_websocket_accept(key.as_bytes());

    let target = &url[url::Position::BeforePath..];
    let mut builder = Request::builder()
        .method("GET")
        .uri(target)
        .header(header::HOST, host_header.as_str())
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "upgrade")
        .header(header::SEC_WEBSOCKET_KEY, key.as_str())
        .header(header::SEC_WEBSOCKET_VERSION, "13");

    if !options.subprotocols.is_empty() {
        builder = builder.header(
            header::SEC_WEBSOCKET_PROTOCOL,
            options.subprotocols.join(", "),
        );
    }
    if !options.extension_offers.is_empty() {
        builder = builder.header(
            header::SEC_WEBSOCKET_EXTENSIONS,
            ExtensionSpec::format_list(&options.extension_offers),
        );
    }

    let request = builder.body(Empty::<Bytes>::new())?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

    tokio::spawn(async move {
        if let Err(_err) = conn.with_upgrades().await {
            #[cfg(feature = "logging")]
            log::error!("upgrading connection: {_err:?}");
        }
    });

    let mut response = sender.send_request(request).await?;
    let negotiation = verify(&response, &expected_accept, options)?;

    let upgraded = hyper::upgrade::on(&mut response).await?;

    let path = url[url::Position::BeforePath..url::Position::AfterQuery].to_owned();
    Ok((
        TokioIo::new(upgraded),
        ClientNegotiation {
            path,
            ..negotiation
        },
    ))
}

/// Checks the server's `101` response against what the client sent.
fn verify(
    response: &Response<Incoming>,
    expected_accept: &str,
    options: &ConnectOptions,
) -> Result<ClientNegotiation> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(WebSocketError::InvalidStatusCode(
            response.status().as_u16(),
        ));
    }

    let headers = response.headers();

    if !headers
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !headers
        .get(header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("upgrade"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    if headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|h| h.to_str().ok())
        != Some(expected_accept)
    {
        return Err(WebSocketError::BadAcceptKey);
    }

    let subprotocol = match headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|h| h.to_str().ok())
    {
        Some(selected) => {
            if !options.subprotocols.iter().any(|p| p == selected) {
                return Err(WebSocketError::SubprotocolNotOffered);
            }
            Some(selected.to_owned())
        }
        None => None,
    };

    let extensions = match headers
        .get(header::SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|h| h.to_str().ok())
    {
        Some(value) => {
            let accepted = ExtensionSpec::parse_list(value)
                .map_err(|_| WebSocketError::InvalidExtensionHeader)?;
            for spec in &accepted {
                if !options
                    .extension_offers
                    .iter()
                    .any(|offer| offer.name() == spec.name())
                {
                    return Err(WebSocketError::ExtensionNotOffered);
                }
            }
            accepted
        }
        None => Vec::new(),
    };

    Ok(ClientNegotiation {
        subprotocol,
        path: String::new(),
        extensions,
    })
}

/// Matches the server-accepted specs back to the offered extension instances,
/// producing the pipeline in the server's order.
pub fn assemble_pipeline(
    mut offered: Vec<Box<dyn Extension>>,
    accepted: &[ExtensionSpec],
) -> Result<ExtensionPipeline> {
    let mut chain = Vec::with_capacity(accepted.len());
    for spec in accepted {
        let position = offered
            .iter()
            .position(|ext| ext.spec().name() == spec.name())
            .ok_or(WebSocketError::ExtensionNotOffered)?;
        chain.push(offered.remove(position));
    }
    Ok(ExtensionPipeline::new(chain))
}

/// Establishes a raw tunnel through an HTTP proxy with `CONNECT`.
///
/// The proxy exchange is deliberately minimal: one request, one status line,
/// no authentication. Anything other than a 2xx is a failure.
async fn tunnel_through_proxy(proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| WebSocketError::InvalidUrl(proxy.to_string()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(8080);

    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
    stream
        .write_all(
            format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n").as_bytes(),
        )
        .await?;

    let mut response = Vec::with_capacity(256);
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(WebSocketError::ProxyFailure(
                "proxy closed the connection".to_owned(),
            ));
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > 8192 {
            return Err(WebSocketError::ProxyFailure(
                "oversized proxy response".to_owned(),
            ));
        }
    }

    let status_line = response
        .split(|&b| b == b'\n')
        .next()
        .and_then(|line| std::str::from_utf8(line).ok())
        .unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if !status.starts_with('2') {
        return Err(WebSocketError::ProxyFailure(format!(
            "proxy refused tunnel: {}",
            status_line.trim_end()
        )));
    }

    Ok(stream)
}

/// Computes the `Sec-WebSocket-Accept` value for a request key.
pub(crate) fn sec_websocket_accept(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11"); // magic string
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(
            sec_websocket_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_16_bytes_base64() {
        let key = generate_key();
        assert_eq!(key.len(), 24);
        assert!(key.ends_with("=="));
    }

    #[test]
    fn test_first_client_preference() {
        let server: Vec<String> = ["MBLWS.huawei.com", "wamp", "v11.stomp", "v10.stomp", "soap"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let client = ["MBWS.huawei.com", "soap", "v10.stomp"];

        // the client's order decides, so "soap" beats "v10.stomp"
        let selected = FirstClientPreference.select(&client, &server);
        assert_eq!(selected.as_deref(), Some("soap"));
    }

    #[test]
    fn test_subprotocol_no_intersection() {
        let server = vec!["chat".to_string()];
        let client = ["stomp"];
        assert_eq!(FirstClientPreference.select(&client, &server), None);
    }

    fn upgrade_request() -> Request<Empty<Bytes>> {
        Request::builder()
            .method("GET")
            .uri("/chat?room=1")
            .header(header::HOST, "example.org")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(Empty::new())
            .unwrap()
    }

    #[test]
    fn test_upgrade_response_headers() {
        let mut request = upgrade_request();
        let (response, _fut) = upgrade(&mut request, &AcceptConfig::default()).unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response
                .headers()
                .get(header::SEC_WEBSOCKET_ACCEPT)
                .unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert!(response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .is_none());
    }

    #[test]
    fn test_upgrade_selects_subprotocol() {
        let mut request = upgrade_request();
        request.headers_mut().append(
            header::SEC_WEBSOCKET_PROTOCOL,
            "MBWS.huawei.com, soap".parse().unwrap(),
        );
        request
            .headers_mut()
            .append(header::SEC_WEBSOCKET_PROTOCOL, "v10.stomp".parse().unwrap());

        let config = AcceptConfig {
            subprotocols: ["MBLWS.huawei.com", "wamp", "v11.stomp", "v10.stomp", "soap"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..Default::default()
        };

        let (response, _fut) = upgrade(&mut request, &config).unwrap();
        assert_eq!(
            response
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .unwrap(),
            "soap"
        );
    }

    #[test]
    fn test_upgrade_rejects_missing_key() {
        let mut request = upgrade_request();
        request.headers_mut().remove(header::SEC_WEBSOCKET_KEY);
        assert!(matches!(
            upgrade(&mut request, &AcceptConfig::default()),
            Err(WebSocketError::MissingSecWebSocketKey)
        ));
    }

    #[test]
    fn test_upgrade_rejects_wrong_version() {
        let mut request = upgrade_request();
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_VERSION, "8".parse().unwrap());
        assert!(matches!(
            upgrade(&mut request, &AcceptConfig::default()),
            Err(WebSocketError::InvalidSecWebsocketVersion)
        ));
    }

    #[test]
    fn test_headers_coalesce_duplicates() {
        let mut map = hyper::HeaderMap::new();
        map.append(header::SEC_WEBSOCKET_PROTOCOL, "a, b".parse().unwrap());
        map.append(header::SEC_WEBSOCKET_PROTOCOL, "c".parse().unwrap());

        let headers = HandshakeHeaders::from(&map);
        assert_eq!(
            headers.all_tokens(header::SEC_WEBSOCKET_PROTOCOL.as_str()),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            headers.get(header::SEC_WEBSOCKET_PROTOCOL.as_str()),
            Some("a, b")
        );
    }

    #[test]
    fn test_assemble_pipeline_order_and_rejection() {
        struct Named(ExtensionSpec);
        impl Extension for Named {
            fn spec(&self) -> &ExtensionSpec {
                &self.0
            }
            fn process_outgoing(&mut self, frame: crate::frame::Frame) -> Result<crate::frame::Frame> {
                Ok(frame)
            }
            fn process_incoming(&mut self, frame: crate::frame::Frame) -> Result<crate::frame::Frame> {
                Ok(frame)
            }
        }

        let offered: Vec<Box<dyn Extension>> = vec![
            Box::new(Named(ExtensionSpec::new("a"))),
            Box::new(Named(ExtensionSpec::new("b"))),
        ];
        let accepted = [ExtensionSpec::new("b"), ExtensionSpec::new("a")];
        let pipeline = assemble_pipeline(offered, &accepted).unwrap();
        assert_eq!(
            pipeline.specs(),
            vec![ExtensionSpec::new("b"), ExtensionSpec::new("a")]
        );

        let offered: Vec<Box<dyn Extension>> = vec![Box::new(Named(ExtensionSpec::new("a")))];
        assert!(matches!(
            assemble_pipeline(offered, &[ExtensionSpec::new("zap")]),
            Err(WebSocketError::ExtensionNotOffered)
        ));
    }
}
