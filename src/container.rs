//! The container: session registry, worker pool and connection entry points.
//!
//! A [`Container`] owns the defaults every session starts from, tracks open
//! sessions per endpoint path and lazily maintains a bounded worker pool for
//! handler execution. Server connections arrive through
//! [`Container::upgrade`] + [`Container::adopt`]; client connections through
//! [`Container::connect`]; pre-upgraded or in-memory transports attach
//! directly with [`Container::attach`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{OwnedSemaphorePermit, Semaphore},
};
use url::Url;

use crate::{
    broadcast::{self, BroadcastMode},
    close::CloseReason,
    extension::Extension,
    handler::SessionHandler,
    handshake::{self, AcceptConfig, ConnectOptions, HttpResponse, Role, UpgradeFut},
    reassembly::DeliveryMode,
    session::{MessageReader, Session, SessionConfig, SessionId, SessionParams},
    Result, WebSocketError,
};

/// Semaphore-bounded execution pool for handler callbacks.
///
/// Sessions hold the pool through an `Arc`; the container only keeps a weak
/// reference, so the pool dies with the last session and the next connection
/// creates a fresh one.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Waits for a free execution slot. `None` only when the pool was shut
    /// down underneath the caller.
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }
}

/// Container-wide defaults.
#[derive(Clone)]
pub struct ContainerConfig {
    /// Defaults applied to every session.
    pub session: SessionConfig,
    /// Server-side handshake negotiation.
    pub accept: AcceptConfig,
    /// Worker pool size; also bounds broadcast concurrency.
    pub pool_size: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            accept: AcceptConfig::default(),
            pool_size: 256,
        }
    }
}

/// Client connection parameters beyond the session defaults.
pub struct ClientOptions {
    /// Subprotocols to offer, in preference order.
    pub subprotocols: Vec<String>,
    /// Extension instances to offer; the negotiated subset forms the
    /// session's pipeline in the server's order.
    pub extensions: Vec<Box<dyn Extension>>,
    pub handshake_timeout: Duration,
    /// HTTP proxy to tunnel through with `CONNECT`.
    pub proxy: Option<Url>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            handshake_timeout: Duration::from_secs(30),
            proxy: None,
        }
    }
}

/// Shared state for a group of sessions.
pub struct Container {
    config: ContainerConfig,
    registry: Mutex<HashMap<String, Vec<Session>>>,
    pool: Mutex<Weak<WorkerPool>>,
}

impl Container {
    pub fn new(config: ContainerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Mutex::new(HashMap::new()),
            pool: Mutex::new(Weak::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(ContainerConfig::default())
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Validates an incoming upgrade request against this container's accept
    /// configuration.
    pub fn upgrade<B>(
        &self,
        request: impl std::borrow::BorrowMut<hyper::Request<B>>,
    ) -> Result<(HttpResponse, UpgradeFut)> {
        handshake::upgrade(request, &self.config.accept)
    }

    /// Completes a server-side upgrade and attaches the resulting session.
    pub async fn adopt(
        self: &Arc<Self>,
        fut: UpgradeFut,
        handler: Box<dyn SessionHandler>,
    ) -> Result<Session> {
        let (io, negotiation) = fut.await?;
        let mut params = SessionParams::new(Role::Server);
        params.path = negotiation.path;
        params.subprotocol = negotiation.subprotocol;
        params.pipeline = negotiation.pipeline;
        Ok(self.attach(io, params, handler))
    }

    /// Connects as a client and attaches the resulting session.
    pub async fn connect(
        self: &Arc<Self>,
        url: &Url,
        options: ClientOptions,
        handler: Box<dyn SessionHandler>,
    ) -> Result<Session> {
        let connect_options = ConnectOptions {
            subprotocols: options.subprotocols,
            extension_offers: options
                .extensions
                .iter()
                .map(|ext| ext.spec().clone())
                .collect(),
            handshake_timeout: options.handshake_timeout,
            proxy: options.proxy,
        };

        let (io, negotiation) = handshake::connect(url, &connect_options).await?;
        let pipeline = handshake::assemble_pipeline(options.extensions, &negotiation.extensions)?;

        let mut params = SessionParams::new(Role::Client);
        params.path = negotiation.path;
        params.subprotocol = negotiation.subprotocol;
        params.pipeline = pipeline;
        Ok(self.attach(io, params, handler))
    }

    /// Attaches a session over an already-established transport and registers
    /// it under its request path.
    pub fn attach<T>(
        self: &Arc<Self>,
        io: T,
        mut params: SessionParams,
        handler: Box<dyn SessionHandler>,
    ) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        params.pool = Some(self.worker_pool());
        let path = params.path.clone();

        let wrapped = Box::new(Registered {
            inner: handler,
            container: Arc::downgrade(self),
            path: path.clone(),
        });

        let session = Session::attach(io, params, wrapped, self.config.session.clone());
        self.register(&path, session.clone());
        session
    }

    /// Snapshot of the open sessions registered under `path`.
    ///
    /// The snapshot is safe to iterate while sessions open and close
    /// concurrently; closed-but-not-yet-removed sessions are filtered out.
    pub fn open_sessions(&self, path: &str) -> Vec<Session> {
        self.lock_registry()
            .get(path)
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|session| session.is_open())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of registered sessions across all paths.
    pub fn session_count(&self) -> usize {
        self.lock_registry().values().map(Vec::len).sum()
    }

    /// Broadcasts a text message to every open session under `path`.
    pub async fn broadcast_text(
        &self,
        path: &str,
        text: &str,
        mode: BroadcastMode,
    ) -> Vec<(SessionId, WebSocketError)> {
        let sessions = self.open_sessions(path);
        broadcast::broadcast_text(&sessions, text, mode, self.config.pool_size).await
    }

    /// Broadcasts a binary message to every open session under `path`.
    pub async fn broadcast_binary(
        &self,
        path: &str,
        data: &Bytes,
        mode: BroadcastMode,
    ) -> Vec<(SessionId, WebSocketError)> {
        let sessions = self.open_sessions(path);
        broadcast::broadcast_binary(&sessions, data, mode, self.config.pool_size).await
    }

    /// Current worker pool, creating one if no session holds it anymore.
    pub(crate) fn worker_pool(&self) -> Arc<WorkerPool> {
        let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = slot.upgrade() {
            return pool;
        }
        let pool = WorkerPool::new(self.config.pool_size);
        *slot = Arc::downgrade(&pool);
        pool
    }

    fn register(&self, path: &str, session: Session) {
        self.lock_registry()
            .entry(path.to_owned())
            .or_default()
            .push(session);
    }

    fn unregister(&self, path: &str, id: SessionId) {
        let mut registry = self.lock_registry();
        if let Some(sessions) = registry.get_mut(path) {
            sessions.retain(|session| session.raw_id() != id);
            if sessions.is_empty() {
                registry.remove(path);
            }
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<String, Vec<Session>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handler wrapper that keeps the registry in sync with session lifecycles.
struct Registered {
    inner: Box<dyn SessionHandler>,
    container: Weak<Container>,
    path: String,
}

impl SessionHandler for Registered {
    fn on_open(&mut self, session: &Session) {
        self.inner.on_open(session);
    }

    fn on_text(&mut self, session: &Session, text: &str, last: bool) {
        self.inner.on_text(session, text, last);
    }

    fn on_binary(&mut self, session: &Session, data: Bytes, last: bool) {
        self.inner.on_binary(session, data, last);
    }

    fn on_reader(&mut self, session: &Session, reader: MessageReader) {
        self.inner.on_reader(session, reader);
    }

    fn on_ping(&mut self, session: &Session, payload: Bytes) {
        self.inner.on_ping(session, payload);
    }

    fn on_pong(&mut self, session: &Session, payload: Bytes) {
        self.inner.on_pong(session, payload);
    }

    fn on_close(&mut self, session: &Session, reason: &CloseReason) {
        if let Some(container) = self.container.upgrade() {
            container.unregister(&self.path, session.raw_id());
        }
        self.inner.on_close(session, reason);
    }

    fn on_error(&mut self, session: &Session, error: &WebSocketError) {
        self.inner.on_error(session, error);
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.inner.delivery_mode()
    }

    fn max_message_size(&self) -> Option<usize> {
        self.inner.max_message_size()
    }
}
