//! The connection façade: a single object type that fronts either an
//! HTTP/1.1 or an HTTP/2 wire implementation behind one refcounted,
//! thread-safe handle.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::channel::{Channel, Handler};
use crate::diagnostics;
use crate::error::{Error, ErrorCode, Result};
use crate::version::Version;

/// Per-version dispatch surface. Rendered as a trait with two
/// implementors rather than a hand-rolled vtable struct, per the
/// redesign direction carried into this crate: the original's
/// function-pointer table is exactly what a Rust trait object already
/// gives you.
pub trait ProtocolConnection: Send + Sync + fmt::Debug {
    /// Begins an asynchronous, graceful close. Idempotent.
    fn close(&self);
    fn is_open(&self) -> bool;
    /// Advisory flow-control window update; variants that don't use
    /// flow control (HTTP/1.1) ignore it.
    fn update_window(&self, increment: u32);
}

#[derive(Debug)]
pub(crate) struct Http1Connection {
    open: std::sync::atomic::AtomicBool,
}

impl Http1Connection {
    pub(crate) fn new() -> Self {
        Self {
            open: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

impl ProtocolConnection for Http1Connection {
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn update_window(&self, _increment: u32) {
        // HTTP/1.1 has no stream-level flow control to update.
    }
}

#[cfg(feature = "h2")]
#[derive(Debug)]
pub(crate) struct Http2Connection {
    open: std::sync::atomic::AtomicBool,
    window: AtomicU32,
}

#[cfg(feature = "h2")]
impl Http2Connection {
    pub(crate) fn new(initial_window: u32) -> Self {
        Self {
            open: std::sync::atomic::AtomicBool::new(true),
            window: AtomicU32::new(initial_window),
        }
    }
}

#[cfg(feature = "h2")]
impl ProtocolConnection for Http2Connection {
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn update_window(&self, increment: u32) {
        self.window.fetch_add(increment, Ordering::SeqCst);
    }
}

/// Transform applied to an outgoing client request before it is sent,
/// used for proxy rewriting. Out of scope to implement here, but the
/// slot is preserved so a proxy layer built atop this crate has
/// somewhere to install one.
pub type RequestTransform = Box<dyn Fn() + Send + Sync>;

pub(crate) struct ClientData {
    pub(crate) proxy_request_transform: parking_lot::Mutex<Option<RequestTransform>>,
}

type OnIncomingRequest = Box<dyn Fn() + Send + Sync>;
type OnServerConnectionShutdown = Box<dyn FnOnce(Option<ErrorCode>) + Send>;

pub(crate) struct ServerData {
    pub(crate) on_incoming_request: parking_lot::Mutex<Option<OnIncomingRequest>>,
    pub(crate) on_shutdown: parking_lot::Mutex<Option<OnServerConnectionShutdown>>,
}

pub(crate) enum Role {
    Client(ClientData),
    Server(ServerData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Constructing = 0,
    Alive = 1,
    Releasing = 2,
    Gone = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Constructing,
            1 => Self::Alive,
            2 => Self::Releasing,
            _ => Self::Gone,
        }
    }
}

pub(crate) struct ConnectionInner {
    version: Version,
    state: AtomicU8,
    user_refcount: AtomicUsize,
    channel: Arc<dyn Channel>,
    protocol: Box<dyn ProtocolConnection>,
    role: Role,
    _diag: diagnostics::Guard,
}

impl fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("version", &self.version)
            .field("state", &State::from_u8(self.state.load(Ordering::SeqCst)))
            .field("user_refcount", &self.user_refcount.load(Ordering::SeqCst))
            .finish()
    }
}

/// A refcounted handle to an established connection.
///
/// Clones share the same underlying state and the same logical
/// refcount: calling [`Connection::acquire`] bumps that logical count
/// and returns a new handle; [`Connection::release`] on the last
/// outstanding handle tears the connection down. Dropping a
/// `Connection` handle without calling `release` leaks the logical
/// refcount (by design — see `acquire`/`release` docs) but not memory,
/// since the handle is a plain `Arc` clone underneath.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Connection {
    pub(crate) fn new(
        version: Version,
        channel: Arc<dyn Channel>,
        protocol: Box<dyn ProtocolConnection>,
        role: Role,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                version,
                state: AtomicU8::new(State::Constructing as u8),
                user_refcount: AtomicUsize::new(1),
                channel,
                protocol,
                role,
                _diag: diagnostics::Guard::acquire(),
            }),
        }
    }

    pub(crate) fn mark_alive(&self) {
        self.inner
            .state
            .store(State::Alive as u8, Ordering::SeqCst);
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    /// Increments the logical refcount and returns a new handle to the
    /// same connection. Panics (a programmer error, not a recoverable
    /// condition) if called after the connection has already started
    /// releasing.
    #[must_use]
    pub fn acquire(&self) -> Self {
        let prior = self.inner.user_refcount.fetch_add(1, Ordering::SeqCst);
        assert!(prior > 0, "acquire() called on a released connection");
        self.clone()
    }

    /// Decrements the logical refcount. When it reaches zero this
    /// initiates channel shutdown and releases the connection's
    /// channel-hold; the connection's handler (and therefore its
    /// backing memory) is freed once the channel finishes tearing down
    /// the stage it was bound to. Never touches `self` after that
    /// point.
    ///
    /// Panics on double-release, matching the original contract's
    /// "double-release is a fatal bug" invariant.
    pub fn release(&self) {
        let prior = self.inner.user_refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(prior > 0, "double-release of connection");
        if prior == 1 {
            trace!(target: crate::log_targets::CONNECTION, "refcount reached zero, shutting down channel");
            self.inner
                .state
                .store(State::Releasing as u8, Ordering::SeqCst);
            self.inner.channel.shutdown(None);
            self.inner.channel.release_hold();
        }
    }

    pub fn close(&self) {
        self.inner.protocol.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.protocol.is_open()
    }

    pub fn update_window(&self, increment: u32) {
        self.inner.protocol.update_window(increment);
    }

    pub(crate) fn is_server(&self) -> bool {
        matches!(self.inner.role, Role::Server(_))
    }

    /// Installs the callbacks a server connection must configure
    /// before its `on_incoming_connection` callback returns.
    ///
    /// Returns `invalid-state` if this is a client connection or has
    /// already been configured; `invalid-argument` if
    /// `on_incoming_request` is not supplied.
    pub fn configure_server(
        &self,
        on_incoming_request: Option<impl Fn() + Send + Sync + 'static>,
        on_shutdown: Option<impl FnOnce(Option<ErrorCode>) + Send + 'static>,
    ) -> Result<()> {
        let Role::Server(data) = &self.inner.role else {
            return Err(Error::new(ErrorCode::InvalidState));
        };
        let Some(on_incoming_request) = on_incoming_request else {
            return Err(Error::new(ErrorCode::InvalidArgument));
        };

        let mut req_slot = data.on_incoming_request.lock();
        if req_slot.is_some() {
            return Err(Error::new(ErrorCode::InvalidState));
        }
        *req_slot = Some(Box::new(on_incoming_request));
        drop(req_slot);

        if let Some(on_shutdown) = on_shutdown {
            *data.on_shutdown.lock() = Some(Box::new(on_shutdown));
        }
        debug!(target: crate::log_targets::SERVER, "server connection configured");
        Ok(())
    }

    pub(crate) fn is_configured(&self) -> bool {
        match &self.inner.role {
            Role::Server(data) => data.on_incoming_request.lock().is_some(),
            Role::Client(_) => true,
        }
    }

    pub(crate) fn take_server_shutdown(&self) -> Option<OnServerConnectionShutdown> {
        match &self.inner.role {
            Role::Server(data) => data.on_shutdown.lock().take(),
            Role::Client(_) => None,
        }
    }

    pub(crate) fn set_proxy_request_transform(&self, transform: RequestTransform) {
        if let Role::Client(data) = &self.inner.role {
            *data.proxy_request_transform.lock() = Some(transform);
        }
    }
}

/// The [`Handler`] bound to a connection's own pipeline stage.
///
/// This is the embedded "channel-handler record" the data model
/// describes: the channel owns this object (via the stage it is bound
/// to), and this object owns an `Arc` clone of the connection's
/// storage. When the channel destroys the stage, this handler is
/// dropped, which drops its `Arc` clone; once no other clone remains
/// (i.e. the user has also released), `ConnectionInner` is freed. That
/// is the whole of the cycle-breaking argument in one object.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    connection: Connection,
}

impl ConnectionHandle {
    pub(crate) fn new(connection: Connection) -> Arc<dyn Handler> {
        Arc::new(Self { connection })
    }
}

impl Handler for ConnectionHandle {
    // A connection's own stage is never itself the TLS stage, so ALPN
    // queries against it always return `None` (the default).
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.connection
            .inner
            .state
            .store(State::Gone as u8, Ordering::SeqCst);
        trace!(target: crate::log_targets::CONNECTION, "connection handler dropped, storage freed with last Arc clone");
    }
}
