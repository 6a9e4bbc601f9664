//! Server listener: owns the accept path, the live-channel map, and
//! graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelId};
use crate::connection::Connection;
use crate::error::{Error, ErrorCode, Result};
use crate::install::{install_stage, validate_initial_window};
use crate::system::SystemTable;

/// Callback invoked once per accepted channel, with either a
/// ready-to-configure connection or the reason setup failed.
pub type OnIncomingConnection = Box<dyn Fn(&Server, Option<Connection>, Option<ErrorCode>) + Send + Sync>;

/// Callback invoked once the listener and every accepted connection it
/// produced have finished tearing down.
pub type OnDestroyComplete = Box<dyn FnOnce() + Send>;

pub struct ServerOptions {
    pub tls: bool,
    pub initial_window: u32,
    pub on_incoming_connection: OnIncomingConnection,
    pub on_destroy_complete: Option<OnDestroyComplete>,
    pub system_table: Option<Arc<dyn SystemTable>>,
}

impl ServerOptions {
    pub fn new(on_incoming_connection: OnIncomingConnection) -> Self {
        Self {
            tls: false,
            initial_window: 65535,
            on_incoming_connection,
            on_destroy_complete: None,
            system_table: None,
        }
    }

    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_initial_window(mut self, initial_window: u32) -> Self {
        self.initial_window = initial_window;
        self
    }

    #[must_use]
    pub fn with_on_destroy_complete(mut self, cb: OnDestroyComplete) -> Self {
        self.on_destroy_complete = Some(cb);
        self
    }

    #[must_use]
    pub fn with_system_table(mut self, table: Arc<dyn SystemTable>) -> Self {
        self.system_table = Some(table);
        self
    }
}

/// A transport binding's listening socket, registered with a [`Server`]
/// so [`Server::release`] can request its teardown without this crate's
/// core needing to know whether that socket is a real `TcpListener` or
/// a fake used in a test.
///
/// A transport binding reports the teardown actually finishing through
/// [`Server::handle_listener_closed`], independently of `close` itself
/// returning.
pub trait ListenerHandle: Send + Sync {
    /// Requests that the listener stop accepting new connections and
    /// begin closing its socket. Does not block; completion is
    /// reported separately via `Server::handle_listener_closed`.
    fn close(&self);
}

struct SyncState {
    is_shutting_down: bool,
    channels: HashMap<ChannelId, Connection>,
    listener: Option<Arc<dyn ListenerHandle>>,
    listener_closed: bool,
}

/// A listener that accepts channels, installs connections on them, and
/// tracks the resulting connections until they (or the listener
/// itself) shut down.
///
/// The only state shared across threads/tasks is the [`SyncState`]
/// behind `sync`; it is held only for O(1) map operations and is never
/// held across a call into user code, matching the load-bearing rule
/// from the data model (holding it across a callback risks deadlock if
/// the callback re-enters the server).
pub struct Server {
    is_tls: bool,
    initial_window: u32,
    on_incoming_connection: OnIncomingConnection,
    sync: Mutex<SyncState>,
    destroy_notify: Notify,
    destroyed: std::sync::atomic::AtomicBool,
}

impl Server {
    pub fn new(options: ServerOptions) -> Result<Arc<Self>> {
        validate_initial_window(options.initial_window)?;

        let server = Arc::new(Self {
            is_tls: options.tls,
            initial_window: options.initial_window,
            on_incoming_connection: options.on_incoming_connection,
            sync: Mutex::new(SyncState {
                is_shutting_down: false,
                channels: HashMap::new(),
                listener: None,
                // No listener registered yet; nothing to wait on, so
                // the "listener has finished tearing down" condition
                // starts out already satisfied.
                listener_closed: true,
            }),
            destroy_notify: Notify::new(),
            destroyed: std::sync::atomic::AtomicBool::new(false),
        });

        if let Some(cb) = options.on_destroy_complete {
            let server_for_wait = server.clone();
            tokio::spawn(async move {
                server_for_wait.join().await;
                cb();
            });
        }

        Ok(server)
    }

    /// Called by a transport binding's accept loop for each incoming
    /// channel.
    pub(crate) fn handle_accept_setup(
        self: &Arc<Self>,
        result: std::result::Result<Arc<dyn Channel>, Error>,
    ) {
        let channel = match result {
            Ok(channel) => channel,
            Err(err) => {
                (self.on_incoming_connection)(self, None, Some(err.code()));
                return;
            }
        };

        let connection = match install_stage(channel.clone(), true, self.is_tls, self.initial_window) {
            Ok(connection) => connection,
            Err(err) => {
                (self.on_incoming_connection)(self, None, Some(err.code()));
                channel.shutdown(Some(err.code()));
                return;
            }
        };

        let mut rejected = None;
        {
            let mut state = self.sync.lock();
            if state.is_shutting_down {
                rejected = Some(ErrorCode::ConnectionClosed);
            } else {
                state.channels.insert(channel.id(), connection.clone());
            }
        }

        if let Some(code) = rejected {
            (self.on_incoming_connection)(self, None, Some(code));
            channel.shutdown(Some(code));
            connection.release();
            return;
        }

        (self.on_incoming_connection)(self, Some(connection.clone()), None);

        if !connection.is_configured() {
            warn!(
                target: crate::log_targets::SERVER,
                channel = ?channel.id(),
                "on_incoming_connection returned without calling configure_server"
            );
            {
                let mut state = self.sync.lock();
                state.channels.remove(&channel.id());
            }
            channel.shutdown(Some(ErrorCode::ReactionRequired));
            connection.release();
        }
    }

    /// Called by a transport binding when a previously-accepted
    /// channel finishes shutting down.
    pub(crate) fn handle_accept_shutdown(self: &Arc<Self>, channel_id: ChannelId, error: Option<ErrorCode>) {
        let connection = {
            let mut state = self.sync.lock();
            state.channels.remove(&channel_id)
        };

        if let Some(connection) = connection {
            if let Some(cb) = connection.take_server_shutdown() {
                cb(error);
            }
        }

        self.maybe_notify_destroy_complete();
    }

    /// Registers the listener a transport binding is accepting on, so
    /// [`Server::release`] can request it stop, and so
    /// `on_destroy_complete`/[`Server::join`] wait for it to actually
    /// finish tearing down rather than firing as soon as the connection
    /// map happens to be empty.
    ///
    /// A server is expected to have at most one listener; a second call
    /// replaces whatever was registered before.
    pub fn attach_listener(self: &Arc<Self>, listener: Arc<dyn ListenerHandle>) {
        let mut state = self.sync.lock();
        state.listener = Some(listener);
        state.listener_closed = false;
    }

    /// Called by a transport binding once its listener socket has fully
    /// finished closing (its accept loop has exited and the socket is
    /// dropped), independently of whether `Server::release` has run.
    pub fn handle_listener_closed(self: &Arc<Self>) {
        {
            let mut state = self.sync.lock();
            state.listener_closed = true;
        }
        self.maybe_notify_destroy_complete();
    }

    /// Requests graceful shutdown. Idempotent: a second call returns
    /// immediately without re-shutting-down anything.
    ///
    /// Does not itself wait for shutdown to finish; completion is
    /// signaled by the `on_destroy_complete` callback (or can be
    /// `.await`ed via a future call to [`Server::join`]) once every
    /// accepted connection *and* the registered listener (if any) have
    /// both finished tearing down.
    pub fn release(self: &Arc<Self>) {
        let (channels, listener): (Vec<Connection>, Option<Arc<dyn ListenerHandle>>) = {
            let mut state = self.sync.lock();
            if state.is_shutting_down {
                return;
            }
            state.is_shutting_down = true;
            (
                state.channels.values().cloned().collect(),
                state.listener.clone(),
            )
        };

        debug!(
            target: crate::log_targets::SERVER,
            live_connections = channels.len(),
            has_listener = listener.is_some(),
            "server shutting down"
        );

        for connection in &channels {
            connection
                .channel()
                .shutdown(Some(ErrorCode::ConnectionClosed));
        }

        if let Some(listener) = listener {
            listener.close();
        }

        self.maybe_notify_destroy_complete();
    }

    /// Unconditionally fires `on_destroy_complete`/wakes `join()`,
    /// bypassing the listener/connection bookkeeping
    /// [`Server::maybe_notify_destroy_complete`] checks. Idempotent.
    /// Transport bindings should call [`Server::handle_listener_closed`]
    /// instead; this exists for callers with no listener to register
    /// that still want to force completion directly.
    pub fn notify_destroy_complete(&self) {
        self.destroyed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.destroy_notify.notify_waiters();
    }

    /// Fires `on_destroy_complete`/wakes `join()` once shutdown has
    /// been requested, every accepted connection has been removed from
    /// the map, and the registered listener (if any) has confirmed it
    /// finished closing.
    fn maybe_notify_destroy_complete(&self) {
        let ready = {
            let state = self.sync.lock();
            state.is_shutting_down && state.channels.is_empty() && state.listener_closed
        };
        if ready {
            self.notify_destroy_complete();
        }
    }

    /// Waits for the server to finish shutting down, as an ergonomic
    /// `async` alternative to `on_destroy_complete`.
    pub async fn join(&self) {
        let notified = self.destroy_notify.notified();
        if self.destroyed.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    pub(crate) fn live_connection_count(&self) -> usize {
        self.sync.lock().channels.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::channel::fake::FakeChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn accept(server: &Arc<Server>) -> Arc<FakeChannel> {
        let channel = FakeChannel::new();
        let server_for_shutdown = server.clone();
        let channel_id = channel.id();
        channel.set_on_shutdown(move |err| {
            server_for_shutdown.handle_accept_shutdown(channel_id, err);
        });
        server.handle_accept_setup(Ok(channel.clone()));
        channel
    }

    #[test]
    fn unconfigured_connection_is_shut_down_with_reaction_required() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted2 = accepted.clone();

        let server = Server::new(ServerOptions::new(Box::new(move |_srv, conn, _err| {
            if conn.is_some() {
                accepted2.fetch_add(1, Ordering::SeqCst);
            }
            // deliberately does not call configure_server
        })))
        .unwrap();

        let channel = accept(&server);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(server.live_connection_count(), 0);
        assert_eq!(channel.shutdown_calls(), 1);
        assert_eq!(
            *channel.last_shutdown_error.lock(),
            Some(ErrorCode::ReactionRequired)
        );
    }

    #[test]
    fn graceful_shutdown_notifies_every_connection() {
        let notified = Arc::new(AtomicUsize::new(0));
        let notified2 = notified.clone();

        let server = Server::new(ServerOptions::new(Box::new(move |_srv, conn, _err| {
            if let Some(conn) = conn {
                conn.configure_server(Some(|| {}), None::<fn(Option<ErrorCode>)>)
                    .unwrap();
            }
        })))
        .unwrap();

        let ch1 = accept(&server);
        let ch2 = accept(&server);
        assert_eq!(server.live_connection_count(), 2);

        let _ = notified2;
        server.release();

        assert_eq!(ch1.shutdown_calls(), 1);
        assert_eq!(ch2.shutdown_calls(), 1);
        assert_eq!(server.live_connection_count(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let server = Server::new(ServerOptions::new(Box::new(|_srv, _conn, _err| {}))).unwrap();
        server.release();
        server.release();
    }

    struct FakeListener {
        close_calls: AtomicUsize,
    }

    impl ListenerHandle for FakeListener {
        fn close(&self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn release_requests_listener_close_and_waits_for_it() {
        let server = Server::new(ServerOptions::new(Box::new(|_srv, _conn, _err| {}))).unwrap();
        let listener = Arc::new(FakeListener {
            close_calls: AtomicUsize::new(0),
        });
        server.attach_listener(listener.clone());

        server.release();
        assert_eq!(listener.close_calls.load(Ordering::SeqCst), 1);

        // The fake listener hasn't reported finishing yet, so
        // on_destroy_complete/join() must not have fired.
        let too_early = tokio::time::timeout(std::time::Duration::from_millis(20), server.join()).await;
        assert!(too_early.is_err());

        server.handle_listener_closed();
        tokio::time::timeout(std::time::Duration::from_millis(200), server.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_with_no_listener_completes_once_channels_drain() {
        let server = Server::new(ServerOptions::new(Box::new(|_srv, conn, _err| {
            if let Some(conn) = conn {
                conn.configure_server(Some(|| {}), None::<fn(Option<ErrorCode>)>)
                    .unwrap();
            }
        })))
        .unwrap();

        let _ch = accept(&server);
        server.release();

        tokio::time::timeout(std::time::Duration::from_millis(200), server.join())
            .await
            .unwrap();
    }
}
