//! Session lifecycle: the state machine, the I/O task and handler dispatch.
//!
//! A [`Session`] is a cheap cloneable handle over two tasks:
//!
//! - the I/O task owns the framed transport, the extension pipeline and the
//!   reassembler. It multiplexes outbound commands, inbound frames, the idle
//!   deadline and the heartbeat ticker with `select!`.
//! - the dispatch task consumes an ordered event queue and invokes the
//!   [`SessionHandler`] callbacks, so application code never runs on the raw
//!   I/O task and cannot stall frame pumping for other sessions.
//!
//! The state machine is strictly monotonic: Connecting, Open, Closing, Closed,
//! with no state ever revisited. Once the session is closed, every operation
//! and accessor on the handle fails with [`WebSocketError::SessionClosed`].

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, OwnedMutexGuard},
    time::{sleep_until, Instant},
};
use tokio_util::codec::Framed;

use crate::{
    close::{CloseCode, CloseReason},
    codec::Codec,
    container::WorkerPool,
    extension::{ExtensionPipeline, ExtensionSpec},
    frame::{Frame, FrameView, OpCode, MAX_CONTROL_PAYLOAD},
    handler::{BinaryEncoder, SessionHandler, TextEncoder},
    handshake::Role,
    mask::{MaskKeyGenerator, RandomMaskKeyGenerator},
    reassembly::{DeliveryMode, MessageEvent, MessageKind, MessageLimits, Reassembler},
    Result, WebSocketError,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

fn state_from_u8(value: u8) -> SessionState {
    match value {
        0 => SessionState::Connecting,
        1 => SessionState::Open,
        2 => SessionState::Closing,
        _ => SessionState::Closed,
    }
}

/// Monotonic state advance; lower targets are ignored.
fn advance(state: &AtomicU8, to: SessionState) {
    state.fetch_max(to as u8, Ordering::SeqCst);
}

/// Per-session tunables.
#[derive(Clone)]
pub struct SessionConfig {
    /// Hard limit on a single frame's payload.
    pub max_frame_size: usize,
    /// Whole-message accumulation limits.
    pub limits: MessageLimits,
    /// Close the session after this long without inbound traffic. Zero
    /// disables the idle timer.
    pub max_idle_timeout: Duration,
    /// Send an empty ping at this interval. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// How long a whole send waits for an in-flight message sequence before
    /// failing with [`WebSocketError::MessagePending`].
    pub send_timeout: Duration,
    /// How long to wait for the peer's close frame after sending ours.
    pub close_handshake_timeout: Duration,
    /// Capacity of the handler event queue.
    pub event_buffer: usize,
    /// Capacity of a [`MessageReader`]'s chunk channel.
    pub reader_buffer: usize,
    /// Masking key source for client-role sessions.
    pub mask_keys: Arc<dyn MaskKeyGenerator>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 << 20,
            limits: MessageLimits::default(),
            max_idle_timeout: Duration::ZERO,
            heartbeat_interval: Duration::ZERO,
            send_timeout: Duration::from_secs(10),
            close_handshake_timeout: Duration::from_secs(10),
            event_buffer: 64,
            reader_buffer: 16,
            mask_keys: Arc::new(RandomMaskKeyGenerator),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("max_frame_size", &self.max_frame_size)
            .field("limits", &self.limits)
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("send_timeout", &self.send_timeout)
            .field("close_handshake_timeout", &self.close_handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// Identity of a session established by the handshake.
pub struct SessionParams {
    pub role: Role,
    pub path: String,
    pub subprotocol: Option<String>,
    pub pipeline: ExtensionPipeline,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Bounds concurrent handler execution when set.
    pub pool: Option<Arc<WorkerPool>>,
}

impl SessionParams {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            path: "/".to_owned(),
            subprotocol: None,
            pipeline: ExtensionPipeline::empty(),
            local_addr: None,
            remote_addr: None,
            pool: None,
        }
    }
}

/// An in-flight partial message sequence holds the send gate until its final
/// fragment.
struct PartialOut {
    _guard: OwnedMutexGuard<()>,
    opcode: OpCode,
}

pub(crate) enum Command {
    Frame(FrameView),
    Close(CloseReason),
    SetIdleTimeout(Duration),
    SetHeartbeat(Duration),
}

struct Inner {
    id: SessionId,
    role: Role,
    path: String,
    subprotocol: Option<String>,
    extensions: Vec<ExtensionSpec>,
    state: Arc<AtomicU8>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    send_gate: Arc<tokio::sync::Mutex<()>>,
    partial: Mutex<Option<PartialOut>>,
    send_timeout: Duration,
    idle_millis: AtomicU64,
    heartbeat_millis: AtomicU64,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

/// Handle to one WebSocket session.
///
/// Clones share the same underlying session. All send operations serialize
/// through a per-session gate so at most one outbound message sequence is in
/// flight at a time; control frames bypass the gate and may interleave with a
/// fragmented message.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("path", &self.inner.path)
            .finish()
    }
}

impl Session {
    /// Starts a session over an already-upgraded transport.
    ///
    /// Spawns the I/O and dispatch tasks and returns the handle. The session
    /// is immediately open; the handler's `on_open` fires on the dispatch
    /// task before any other callback.
    pub fn attach<T>(
        io: T,
        params: SessionParams,
        handler: Box<dyn SessionHandler>,
        config: SessionConfig,
    ) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let mode = handler.delivery_mode();
        let limits = config.limits.restricted_to(handler.max_message_size());
        let state = Arc::new(AtomicU8::new(SessionState::Open as u8));

        let inner = Arc::new(Inner {
            id: SessionId::next(),
            role: params.role,
            path: params.path,
            subprotocol: params.subprotocol,
            extensions: params.pipeline.specs(),
            state: Arc::clone(&state),
            cmd_tx,
            send_gate: Arc::new(tokio::sync::Mutex::new(())),
            partial: Mutex::new(None),
            send_timeout: config.send_timeout,
            idle_millis: AtomicU64::new(config.max_idle_timeout.as_millis() as u64),
            heartbeat_millis: AtomicU64::new(config.heartbeat_interval.as_millis() as u64),
            local_addr: params.local_addr,
            remote_addr: params.remote_addr,
        });

        let session = Session {
            inner: Arc::clone(&inner),
        };

        tokio::spawn(run_io(
            io,
            params.role,
            params.pipeline,
            mode,
            limits,
            config.clone(),
            state,
            cmd_rx,
            event_tx,
        ));
        tokio::spawn(run_dispatch(
            session.clone(),
            handler,
            event_rx,
            params.pool,
            config.reader_buffer,
        ));

        session
    }

    pub fn id(&self) -> Result<SessionId> {
        self.ensure_not_closed()?;
        Ok(self.inner.id)
    }

    /// Identity for registry bookkeeping, valid in every state.
    pub(crate) fn raw_id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        state_from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// The request path (with query) this session was opened against.
    pub fn request_path(&self) -> Result<&str> {
        self.ensure_not_closed()?;
        Ok(&self.inner.path)
    }

    /// The subprotocol agreed during the handshake, if any.
    pub fn negotiated_subprotocol(&self) -> Result<Option<&str>> {
        self.ensure_not_closed()?;
        Ok(self.inner.subprotocol.as_deref())
    }

    /// Specs of the negotiated extensions, in pipeline order.
    pub fn negotiated_extensions(&self) -> Result<&[ExtensionSpec]> {
        self.ensure_not_closed()?;
        Ok(&self.inner.extensions)
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        self.ensure_not_closed()?;
        Ok(self.inner.local_addr)
    }

    pub fn remote_addr(&self) -> Result<Option<SocketAddr>> {
        self.ensure_not_closed()?;
        Ok(self.inner.remote_addr)
    }

    /// The idle timeout in force, zero when disabled.
    ///
    /// The timer counts inbound traffic only: any frame from the peer resets
    /// the deadline, local sends do not. A peer that has stopped reading
    /// still expires.
    pub fn max_idle_timeout(&self) -> Result<Duration> {
        self.ensure_not_closed()?;
        Ok(Duration::from_millis(
            self.inner.idle_millis.load(Ordering::SeqCst),
        ))
    }

    /// Changes the idle timeout; the deadline restarts from the time of the
    /// call. Zero disables the timer.
    pub fn set_max_idle_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_not_closed()?;
        self.inner
            .idle_millis
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
        self.enqueue(Command::SetIdleTimeout(timeout))
    }

    pub fn heartbeat_interval(&self) -> Result<Duration> {
        self.ensure_not_closed()?;
        Ok(Duration::from_millis(
            self.inner.heartbeat_millis.load(Ordering::SeqCst),
        ))
    }

    /// Changes the heartbeat interval. Zero disables heartbeats and cancels
    /// any pending ping.
    pub fn set_heartbeat_interval(&self, interval: Duration) -> Result<()> {
        self.ensure_not_closed()?;
        self.inner
            .heartbeat_millis
            .store(interval.as_millis() as u64, Ordering::SeqCst);
        self.enqueue(Command::SetHeartbeat(interval))
    }

    /// Sends a whole text message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.acquire_gate().await?;
        self.ensure_open()?;
        self.enqueue(Command::Frame(FrameView::text(text.into())))
    }

    /// Sends a whole binary message.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.acquire_gate().await?;
        self.ensure_open()?;
        self.enqueue(Command::Frame(FrameView::binary(data.into())))
    }

    /// Sends one fragment of a text message. The first fragment acquires the
    /// send gate; it is released when a fragment with `last = true` is sent.
    pub async fn send_partial_text(&self, text: impl Into<String>, last: bool) -> Result<()> {
        self.send_partial(OpCode::Text, Bytes::from(text.into()), last)
            .await
    }

    /// Sends one fragment of a binary message; gating as for
    /// [`Session::send_partial_text`].
    pub async fn send_partial_binary(&self, data: impl Into<Bytes>, last: bool) -> Result<()> {
        self.send_partial(OpCode::Binary, data.into(), last).await
    }

    async fn send_partial(&self, opcode: OpCode, payload: Bytes, last: bool) -> Result<()> {
        self.ensure_open()?;

        {
            let mut slot = self.lock_partial();
            if let Some(partial) = slot.as_ref() {
                if partial.opcode != opcode {
                    return Err(WebSocketError::MessagePending);
                }
                self.enqueue(Command::Frame(FrameView::partial(
                    OpCode::Continuation,
                    last,
                    payload,
                )))?;
                if last {
                    slot.take();
                }
                return Ok(());
            }
        }

        let guard = self.acquire_gate().await?;
        self.ensure_open()?;
        self.enqueue(Command::Frame(FrameView::partial(opcode, last, payload)))?;
        if !last {
            *self.lock_partial() = Some(PartialOut {
                _guard: guard,
                opcode,
            });
        }
        Ok(())
    }

    /// Sends a ping. Control payloads above 125 bytes are rejected before
    /// anything is queued.
    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_control(FrameView::ping(payload.into()))
    }

    /// Sends an unsolicited pong.
    pub fn pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_control(FrameView::pong(payload.into()))
    }

    fn send_control(&self, view: FrameView) -> Result<()> {
        self.ensure_open()?;
        if view.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.enqueue(Command::Frame(view))
    }

    /// Initiates a normal close (code 1000).
    pub fn close(&self) -> Result<()> {
        self.close_with(CloseReason::normal())
    }

    /// Initiates the close handshake with the given reason.
    ///
    /// Fails with [`WebSocketError::SessionClosed`] when the session is
    /// already closing or closed; closing twice is an error.
    pub fn close_with(&self, reason: CloseReason) -> Result<()> {
        self.inner
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| WebSocketError::SessionClosed)?;
        self.enqueue(Command::Close(reason))
    }

    /// Encodes `value` with the given encoder and sends it as a text message.
    pub async fn send_encoded<T>(&self, value: &T, encoder: &impl TextEncoder<T>) -> Result<()> {
        let text = encoder.encode(value)?;
        self.send_text(text).await
    }

    /// Encodes `value` with the given encoder and sends it as a binary
    /// message.
    pub async fn send_encoded_binary<T>(
        &self,
        value: &T,
        encoder: &impl BinaryEncoder<T>,
    ) -> Result<()> {
        let data = encoder.encode(value)?;
        self.send_binary(data).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == SessionState::Open {
            Ok(())
        } else {
            Err(WebSocketError::SessionClosed)
        }
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            Err(WebSocketError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn enqueue(&self, cmd: Command) -> Result<()> {
        self.inner
            .cmd_tx
            .send(cmd)
            .map_err(|_| WebSocketError::SessionClosed)
    }

    async fn acquire_gate(&self) -> Result<OwnedMutexGuard<()>> {
        tokio::time::timeout(
            self.inner.send_timeout,
            Arc::clone(&self.inner.send_gate).lock_owned(),
        )
        .await
        .map_err(|_| WebSocketError::MessagePending)
    }

    fn lock_partial(&self) -> std::sync::MutexGuard<'_, Option<PartialOut>> {
        self.inner
            .partial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Session {
        Self::detached_with(SessionConfig::default()).0
    }

    #[cfg(test)]
    pub(crate) fn detached_with(
        config: SessionConfig,
    ) -> (Session, mpsc::UnboundedReceiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            id: SessionId::next(),
            role: Role::Server,
            path: "/".to_owned(),
            subprotocol: None,
            extensions: Vec::new(),
            state: Arc::new(AtomicU8::new(SessionState::Open as u8)),
            cmd_tx,
            send_gate: Arc::new(tokio::sync::Mutex::new(())),
            partial: Mutex::new(None),
            send_timeout: config.send_timeout,
            idle_millis: AtomicU64::new(0),
            heartbeat_millis: AtomicU64::new(0),
            local_addr: None,
            remote_addr: None,
        });
        (Session { inner }, cmd_rx)
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        advance(&self.inner.state, state);
    }
}

/// Streaming chunk reader for one inbound message.
///
/// Handed to [`SessionHandler::on_reader`] in [`DeliveryMode::Reader`]. Text
/// chunks are split at valid UTF-8 boundaries before they reach the channel.
/// When the message ends, or the session closes from either side, the channel
/// closes and [`MessageReader::read_chunk`] returns `None`; a blocked read is
/// woken immediately.
pub struct MessageReader {
    kind: MessageKind,
    rx: mpsc::Receiver<Bytes>,
}

impl MessageReader {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Awaits the next chunk; `None` means the message (or session) ended.
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

enum Event {
    Message(MessageEvent),
    Ping(Bytes),
    Pong(Bytes),
    Error(WebSocketError),
    Closed(CloseReason),
}

enum Flow {
    Continue,
    Closed(CloseReason),
}

fn deadline_after(period: Duration) -> Instant {
    if period.is_zero() {
        far_future()
    } else {
        Instant::now() + period
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

#[allow(clippy::too_many_arguments)]
async fn run_io<T>(
    io: T,
    role: Role,
    mut pipeline: ExtensionPipeline,
    mode: DeliveryMode,
    limits: MessageLimits,
    config: SessionConfig,
    state: Arc<AtomicU8>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<Event>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(
        io,
        Codec::new(config.max_frame_size, pipeline.rsv1_allowed()),
    );
    let mut reassembler = Reassembler::new(mode, limits);
    let mask_keys = Arc::clone(&config.mask_keys);

    let mut idle = config.max_idle_timeout;
    let idle_sleep = sleep_until(deadline_after(idle));
    tokio::pin!(idle_sleep);

    let mut heartbeat = config.heartbeat_interval;
    let heartbeat_sleep = sleep_until(deadline_after(heartbeat));
    tokio::pin!(heartbeat_sleep);

    let close_sleep = sleep_until(far_future());
    tokio::pin!(close_sleep);

    let mut close_sent: Option<CloseReason> = None;

    let outcome = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Frame(view)) => {
                    if close_sent.is_some() {
                        continue;
                    }
                    if let Err(err) = write_frame(&mut framed, &mut pipeline, role, mask_keys.as_ref(), view).await {
                        break abort(err, &mut framed, &mut pipeline, role, mask_keys.as_ref(), &event_tx, &state, &mut close_sent).await;
                    }
                }
                Some(Command::Close(reason)) => {
                    if close_sent.is_none() {
                        advance(&state, SessionState::Closing);
                        let _ = write_frame(&mut framed, &mut pipeline, role, mask_keys.as_ref(), FrameView::close_raw(reason.to_payload())).await;
                        close_sent = Some(reason);
                        close_sleep.as_mut().reset(deadline_after(config.close_handshake_timeout));
                    }
                }
                Some(Command::SetIdleTimeout(timeout)) => {
                    idle = timeout;
                    idle_sleep.as_mut().reset(deadline_after(timeout));
                }
                Some(Command::SetHeartbeat(interval)) => {
                    heartbeat = interval;
                    heartbeat_sleep.as_mut().reset(deadline_after(interval));
                }
                None => {
                    break close_sent.take().unwrap_or_else(CloseReason::normal);
                }
            },
            frame = framed.next() => {
                if !idle.is_zero() {
                    idle_sleep.as_mut().reset(Instant::now() + idle);
                }
                match frame {
                    Some(Ok(frame)) => {
                        match process_incoming(frame, &mut framed, &mut pipeline, &mut reassembler, role, mask_keys.as_ref(), &event_tx, &state, &mut close_sent).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Closed(reason)) => break reason,
                            Err(err) => {
                                break abort(err, &mut framed, &mut pipeline, role, mask_keys.as_ref(), &event_tx, &state, &mut close_sent).await;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        break abort(err, &mut framed, &mut pipeline, role, mask_keys.as_ref(), &event_tx, &state, &mut close_sent).await;
                    }
                    None => {
                        // peer went away without a close handshake
                        break close_sent.take().unwrap_or_else(|| CloseReason::new(CloseCode::Abnormal, ""));
                    }
                }
            },
            _ = &mut idle_sleep, if !idle.is_zero() && close_sent.is_none() => {
                advance(&state, SessionState::Closing);
                let reason = CloseReason::new(CloseCode::Away, "idle timeout");
                let _ = write_frame(&mut framed, &mut pipeline, role, mask_keys.as_ref(), FrameView::close_raw(reason.to_payload())).await;
                close_sent = Some(reason);
                close_sleep.as_mut().reset(deadline_after(config.close_handshake_timeout));
            },
            _ = &mut heartbeat_sleep, if !heartbeat.is_zero() && close_sent.is_none() => {
                if let Err(err) = write_frame(&mut framed, &mut pipeline, role, mask_keys.as_ref(), FrameView::ping(Bytes::new())).await {
                    break abort(err, &mut framed, &mut pipeline, role, mask_keys.as_ref(), &event_tx, &state, &mut close_sent).await;
                }
                heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat);
            },
            _ = &mut close_sleep, if close_sent.is_some() => {
                // peer never answered our close frame
                break close_sent.take().unwrap_or_else(CloseReason::normal);
            },
        }
    };

    advance(&state, SessionState::Closed);
    let _ = event_tx.send(Event::Closed(outcome)).await;
    // dropping the framed transport releases the socket
}

async fn write_frame<T>(
    framed: &mut Framed<T, Codec>,
    pipeline: &mut ExtensionPipeline,
    role: Role,
    mask_keys: &dyn MaskKeyGenerator,
    view: FrameView,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = pipeline.process_outgoing(Frame::from(view))?;
    if role == Role::Client {
        let key = mask_keys.next_key();
        frame.set_mask(key);
        frame.mask();
        pipeline.observe_mask_key(key);
    }
    framed.send(frame).await
}

#[allow(clippy::too_many_arguments)]
async fn process_incoming<T>(
    mut frame: Frame,
    framed: &mut Framed<T, Codec>,
    pipeline: &mut ExtensionPipeline,
    reassembler: &mut Reassembler,
    role: Role,
    mask_keys: &dyn MaskKeyGenerator,
    event_tx: &mpsc::Sender<Event>,
    state: &AtomicU8,
    close_sent: &mut Option<CloseReason>,
) -> Result<Flow>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match role {
        Role::Server => {
            if !frame.is_masked() {
                return Err(WebSocketError::UnmaskedFrame);
            }
            frame.unmask();
        }
        Role::Client => {
            if frame.is_masked() {
                return Err(WebSocketError::MaskedFrame);
            }
        }
    }

    let view = FrameView::from(pipeline.process_incoming(frame)?);
    match view.opcode {
        OpCode::Ping => {
            if close_sent.is_none() {
                write_frame(
                    framed,
                    pipeline,
                    role,
                    mask_keys,
                    FrameView::pong(view.payload.clone()),
                )
                .await?;
            }
            let _ = event_tx.send(Event::Ping(view.payload)).await;
            Ok(Flow::Continue)
        }
        OpCode::Pong => {
            // a missed pong never closes the session on its own
            let _ = event_tx.send(Event::Pong(view.payload)).await;
            Ok(Flow::Continue)
        }
        OpCode::Close => {
            let peer_reason = view.close_reason()?;
            match close_sent.take() {
                Some(ours) => Ok(Flow::Closed(ours)),
                None => {
                    advance(state, SessionState::Closing);
                    let echo = if peer_reason.code() == CloseCode::Status {
                        CloseReason::normal()
                    } else {
                        CloseReason::new(peer_reason.code(), "")
                    };
                    let _ = write_frame(
                        framed,
                        pipeline,
                        role,
                        mask_keys,
                        FrameView::close_raw(echo.to_payload()),
                    )
                    .await;
                    Ok(Flow::Closed(peer_reason))
                }
            }
        }
        _ => {
            // discard data once the close handshake started
            if close_sent.is_some() {
                return Ok(Flow::Continue);
            }
            for event in reassembler.push(view.opcode, view.fin, view.payload)? {
                let _ = event_tx.send(Event::Message(event)).await;
            }
            Ok(Flow::Continue)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn abort<T>(
    err: WebSocketError,
    framed: &mut Framed<T, Codec>,
    pipeline: &mut ExtensionPipeline,
    role: Role,
    mask_keys: &dyn MaskKeyGenerator,
    event_tx: &mpsc::Sender<Event>,
    state: &AtomicU8,
    close_sent: &mut Option<CloseReason>,
) -> CloseReason
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let reason = CloseReason::new(err.close_code(), "");
    if close_sent.is_none() {
        advance(state, SessionState::Closing);
        let _ = write_frame(
            framed,
            pipeline,
            role,
            mask_keys,
            FrameView::close_raw(reason.to_payload()),
        )
        .await;
        *close_sent = Some(reason.clone());
    }
    let _ = event_tx.send(Event::Error(err)).await;
    reason
}

async fn run_dispatch(
    session: Session,
    mut handler: Box<dyn SessionHandler>,
    mut event_rx: mpsc::Receiver<Event>,
    pool: Option<Arc<WorkerPool>>,
    reader_buffer: usize,
) {
    let mut reader_tx: Option<mpsc::Sender<Bytes>> = None;

    guarded(&session, &mut handler, |h, s| h.on_open(s));

    while let Some(event) = event_rx.recv().await {
        let _permit = match pool.as_ref() {
            Some(pool) => pool.acquire().await,
            None => None,
        };

        match event {
            Event::Message(MessageEvent::Text(data)) => {
                guarded(&session, &mut handler, |h, s| h.on_text(s, &data, true));
            }
            Event::Message(MessageEvent::PartialText { data, last }) => {
                guarded(&session, &mut handler, |h, s| h.on_text(s, &data, last));
            }
            Event::Message(MessageEvent::Binary(data)) => {
                guarded(&session, &mut handler, |h, s| h.on_binary(s, data, true));
            }
            Event::Message(MessageEvent::PartialBinary { data, last }) => {
                guarded(&session, &mut handler, |h, s| h.on_binary(s, data, last));
            }
            Event::Message(MessageEvent::ReaderStart(kind)) => {
                let (tx, rx) = mpsc::channel(reader_buffer.max(1));
                reader_tx = Some(tx);
                let reader = MessageReader { kind, rx };
                guarded(&session, &mut handler, move |h, s| h.on_reader(s, reader));
            }
            Event::Message(MessageEvent::ReaderChunk(data)) => {
                if let Some(tx) = reader_tx.as_ref() {
                    // the application dropped the reader when this fails
                    let _ = tx.send(data).await;
                }
            }
            Event::Message(MessageEvent::ReaderEnd) => {
                reader_tx = None;
            }
            Event::Ping(payload) => {
                guarded(&session, &mut handler, |h, s| h.on_ping(s, payload));
            }
            Event::Pong(payload) => {
                guarded(&session, &mut handler, |h, s| h.on_pong(s, payload));
            }
            Event::Error(err) => {
                guarded(&session, &mut handler, |h, s| h.on_error(s, &err));
            }
            Event::Closed(reason) => {
                reader_tx = None;
                guarded(&session, &mut handler, |h, s| h.on_close(s, &reason));
            }
        }
    }
}

/// Runs one handler callback, catching panics and routing them to `on_error`.
fn guarded<F>(session: &Session, handler: &mut Box<dyn SessionHandler>, callback: F)
where
    F: FnOnce(&mut dyn SessionHandler, &Session),
{
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(handler.as_mut(), session)
    }));

    if let Err(panic) = result {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_owned());
        let err = WebSocketError::HandlerPanic(message);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.on_error(session, &err)
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            send_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_session_ids_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_state_monotonic() {
        let state = AtomicU8::new(SessionState::Open as u8);
        advance(&state, SessionState::Closing);
        advance(&state, SessionState::Open);
        assert_eq!(state_from_u8(state.load(Ordering::SeqCst)), SessionState::Closing);
        advance(&state, SessionState::Closed);
        advance(&state, SessionState::Closing);
        assert_eq!(state_from_u8(state.load(Ordering::SeqCst)), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_post_close_operations_fail() {
        let (session, _cmd_rx) = Session::detached_with(fast_config());
        assert!(session.id().is_ok());
        session.force_state(SessionState::Closed);

        assert!(matches!(
            session.id(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.send_text("x").await,
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.send_binary(Bytes::from_static(b"x")).await,
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.send_partial_text("x", false).await,
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.ping(Bytes::new()),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.pong(Bytes::new()),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.close(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.request_path(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.negotiated_subprotocol(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.negotiated_extensions(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.local_addr(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.remote_addr(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.max_idle_timeout(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.set_max_idle_timeout(Duration::from_secs(1)),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(
            session.set_heartbeat_interval(Duration::from_secs(1)),
            Err(WebSocketError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_double_close_fails() {
        let (session, mut cmd_rx) = Session::detached_with(fast_config());
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closing);
        assert!(matches!(
            session.close(),
            Err(WebSocketError::SessionClosed)
        ));
        assert!(matches!(cmd_rx.recv().await, Some(Command::Close(_))));
    }

    #[tokio::test]
    async fn test_ping_payload_limit() {
        let (session, mut cmd_rx) = Session::detached_with(fast_config());

        assert!(session.ping(Bytes::from(vec![0u8; 125])).is_ok());
        assert!(matches!(cmd_rx.recv().await, Some(Command::Frame(_))));

        assert!(matches!(
            session.ping(Bytes::from(vec![0u8; 126])),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_whole_send_blocked_by_partial_sequence() {
        let (session, mut cmd_rx) = Session::detached_with(fast_config());

        session.send_partial_text("TES", false).await.unwrap();
        // the sequence holds the gate, so a whole send times out
        assert!(matches!(
            session.send_text("other").await,
            Err(WebSocketError::MessagePending)
        ));

        session.send_partial_text("T1", true).await.unwrap();
        session.send_text("now fine").await.unwrap();

        let mut opcodes = Vec::new();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let Command::Frame(view) = cmd {
                opcodes.push((view.opcode, view.fin));
            }
        }
        assert_eq!(
            opcodes,
            vec![
                (OpCode::Text, false),
                (OpCode::Continuation, true),
                (OpCode::Text, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_kind_mismatch() {
        let (session, _cmd_rx) = Session::detached_with(fast_config());
        session.send_partial_text("a", false).await.unwrap();
        assert!(matches!(
            session
                .send_partial_binary(Bytes::from_static(b"b"), true)
                .await,
            Err(WebSocketError::MessagePending)
        ));
    }
}
