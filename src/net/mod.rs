//! Production transport binding: a [`Channel`] backed by a real
//! `tokio::net::TcpStream`, optionally wrapped in `tokio_rustls` for
//! TLS, wired to the abstract traits the core of this crate depends
//! on. This is what actually runs when an embedder calls
//! [`crate::client::client_connect`] or builds a [`crate::Server`]
//! without injecting a fake [`SystemTable`].
//!
//! The HTTP/1.1 and HTTP/2 wire formats are still out of scope here —
//! this module only dials/accepts sockets and reports the negotiated
//! ALPN protocol; framing is the job of whatever handler a
//! higher-layer crate binds to the stage [`crate::install`] creates.

mod listener;
mod tls;

pub use listener::Listener;

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelId, Handler, StageId};
use crate::error::{Error, ErrorCode, Result};
use crate::system::{SetupCallback, ShutdownCallback, SystemTable};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A channel over a single transport stream `S` (plain `TcpStream`, or
/// a `tokio_rustls` TLS stream wrapping one), with an optional leading
/// TLS stage bound when the dial/accept negotiated TLS.
///
/// Stages are keyed by their `slab` index rather than a `Vec` position,
/// so a stage removed mid-pipeline never shifts the keys of its
/// neighbors out from under an in-flight `upstream_handler` lookup.
pub struct TcpChannel<S> {
    id: ChannelId,
    stages: Mutex<Slab<Option<Arc<dyn Handler>>>>,
    hold_count: AtomicI64,
    // Kept alive for the channel's duration. Actual byte I/O is out of
    // this crate's scope (see module docs); this field exists only so
    // the socket stays open until every channel-hold is released.
    stream: Mutex<Option<S>>,
    shut_down: std::sync::atomic::AtomicBool,
    on_shutdown: Mutex<Option<Box<dyn FnOnce(Option<ErrorCode>) + Send>>>,
}

impl<S> fmt::Debug for TcpChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel").field("id", &self.id).finish()
    }
}

impl<S: Send + 'static> TcpChannel<S> {
    fn new(stream: S) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            stages: Mutex::new(Slab::new()),
            hold_count: AtomicI64::new(0),
            stream: Mutex::new(Some(stream)),
            shut_down: std::sync::atomic::AtomicBool::new(false),
            on_shutdown: Mutex::new(None),
        })
    }

    /// Pre-binds a TLS ALPN-reporting stage ahead of whatever stage
    /// [`crate::install::install_stage`] inserts next, so version
    /// resolution finds it as the immediately-upstream handler.
    fn push_tls_stage(&self, alpn: Option<Vec<u8>>) {
        let mut stages = self.stages.lock();
        stages.insert(Some(Arc::new(tls::AlpnHandler { alpn })));
    }

    /// Registers a one-shot observer invoked when this channel shuts
    /// down, so an accept loop can route the notification to
    /// [`crate::Server::handle_accept_shutdown`].
    pub(crate) fn set_on_shutdown(&self, f: impl FnOnce(Option<ErrorCode>) + Send + 'static) {
        *self.on_shutdown.lock() = Some(Box::new(f));
    }
}

impl<S: Send + 'static> Channel for TcpChannel<S> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn insert_stage(&self) -> Result<StageId> {
        let mut stages = self.stages.lock();
        Ok(StageId(stages.insert(None)))
    }

    fn remove_stage(&self, stage: StageId) {
        let mut stages = self.stages.lock();
        if stages.contains(stage.0) {
            stages.remove(stage.0);
        }
    }

    fn bind_handler(&self, stage: StageId, handler: Arc<dyn Handler>) -> Result<()> {
        let mut stages = self.stages.lock();
        match stages.get_mut(stage.0) {
            Some(slot) => {
                *slot = Some(handler);
                Ok(())
            }
            None => Err(Error::new(ErrorCode::InvalidState)),
        }
    }

    fn upstream_handler(&self, stage: StageId) -> Option<Arc<dyn Handler>> {
        if stage.0 == 0 {
            return None;
        }
        let stages = self.stages.lock();
        stages.get(stage.0 - 1).and_then(|slot| slot.clone())
    }

    fn acquire_hold(&self) {
        self.hold_count.fetch_add(1, Ordering::SeqCst);
    }

    fn release_hold(&self) {
        let prior = self.hold_count.fetch_sub(1, Ordering::SeqCst);
        if prior == 1 {
            trace!(target: crate::log_targets::CONNECTION, channel = ?self.id, "last channel-hold released, dropping socket");
            self.stages.lock().clear();
            *self.stream.lock() = None;
        }
    }

    fn shutdown(&self, error: Option<ErrorCode>) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: crate::log_targets::CONNECTION, channel = ?self.id, ?error, "channel shutdown requested");
        self.stages.lock().clear();
        if let Some(cb) = self.on_shutdown.lock().take() {
            cb(error);
        }
    }
}

/// Production [`SystemTable`] dialing real TCP (and, behind a
/// configured `rustls` connector, real TLS) connections.
pub struct TokioSystemTable {
    tls_connector: Option<tokio_rustls::TlsConnector>,
}

impl Default for TokioSystemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioSystemTable {
    pub fn new() -> Self {
        Self {
            tls_connector: tls::default_connector(),
        }
    }

    pub fn with_tls_connector(connector: tokio_rustls::TlsConnector) -> Self {
        Self {
            tls_connector: Some(connector),
        }
    }
}

impl SystemTable for TokioSystemTable {
    fn new_socket_channel(
        &self,
        host: &str,
        port: u16,
        setup: SetupCallback,
        shutdown: ShutdownCallback,
    ) -> Result<()> {
        let handle = current_runtime_handle()?;
        let host = host.to_owned();
        handle.spawn(async move {
            setup(dial_plain(&host, port, shutdown).await);
        });
        Ok(())
    }

    fn new_tls_socket_channel(
        &self,
        host: &str,
        port: u16,
        setup: SetupCallback,
        shutdown: ShutdownCallback,
    ) -> Result<()> {
        let handle = current_runtime_handle()?;
        let host = host.to_owned();
        let connector = self.tls_connector.clone();
        handle.spawn(async move {
            setup(dial_tls(&host, port, connector, shutdown).await);
        });
        Ok(())
    }
}

/// Dialing must be initiated from within a running Tokio runtime;
/// `tokio::spawn` panics otherwise. Surfacing that as a synchronous
/// `Err` here, before either callback is even constructed, is what lets
/// [`crate::client::client_connect`] report a dial that never started
/// without pretending it went through `setup`.
fn current_runtime_handle() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current()
        .map_err(|err| Error::with_cause(ErrorCode::InvalidState, err))
}

/// Dials a plaintext channel, wiring `shutdown` to fire whenever the
/// resulting channel is actually shut down (by `Connection::release`,
/// a forced server shutdown, etc.) rather than synthesizing it
/// immediately after setup.
async fn dial_plain(
    host: &str,
    port: u16,
    shutdown: ShutdownCallback,
) -> Result<Arc<dyn Channel>> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|err| Error::with_cause(ErrorCode::ConnectionClosed, err))?;
    let channel = TcpChannel::new(stream);
    channel.set_on_shutdown(move |err| shutdown(err));
    Ok(channel)
}

async fn dial_tls(
    host: &str,
    port: u16,
    connector: Option<tokio_rustls::TlsConnector>,
    shutdown: ShutdownCallback,
) -> Result<Arc<dyn Channel>> {
    let connector = connector.ok_or_else(|| Error::new(ErrorCode::UnsupportedProtocol))?;
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|err| Error::with_cause(ErrorCode::ConnectionClosed, err))?;
    let (tls_stream, alpn) = tls::handshake_client(connector, host, stream).await?;
    let channel = TcpChannel::new(tls_stream);
    channel.push_tls_stage(alpn);
    channel.set_on_shutdown(move |err| shutdown(err));
    Ok(channel)
}
