//! Accept loop binding a real `TcpListener` to a [`Server`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use crate::channel::Channel;
use crate::error::{Error, ErrorCode, Result};
use crate::server::{ListenerHandle, Server};

use super::TcpChannel;

/// Owns a bound listening socket and feeds accepted channels into a
/// [`Server`]'s accept path.
///
/// Mirrors the data model's "listener socket" field: the socket is
/// created and stored before any accept callback can fire (the accept
/// loop task is only spawned once `TcpListener::bind` has returned),
/// so there is no window where the server observes a half-initialized
/// listener.
pub struct Listener {
    local_addr: SocketAddr,
    stop: Arc<Notify>,
}

impl Listener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        server: Arc<Server>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Result<Arc<Self>> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|err| Error::with_cause(ErrorCode::ServerClosed, err))?;
        let local_addr = tcp_listener
            .local_addr()
            .map_err(|err| Error::with_cause(ErrorCode::ServerClosed, err))?;

        let stop = Arc::new(Notify::new());
        let listener = Arc::new(Self {
            local_addr,
            stop: stop.clone(),
        });

        server.attach_listener(listener.clone());

        tokio::spawn(accept_loop(tcp_listener, server, tls_acceptor, stop));

        Ok(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Does not itself shut down
    /// already-accepted connections; pair with [`Server::release`].
    pub fn close(&self) {
        self.stop.notify_one();
    }
}

impl ListenerHandle for Listener {
    fn close(&self) {
        Listener::close(self);
    }
}

async fn accept_loop(
    tcp_listener: TcpListener,
    server: Arc<Server>,
    tls_acceptor: Option<TlsAcceptor>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            accepted = tcp_listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => spawn_accept(stream, server.clone(), tls_acceptor.clone()),
                    Err(err) => {
                        warn!(target: crate::log_targets::SERVER, %err, "accept() failed");
                    }
                }
            }
        }
    }
    // Drop the socket before reporting completion, so a caller that
    // observes `on_destroy_complete`/`join()` firing can immediately
    // rely on the address being free.
    drop(tcp_listener);
    server.handle_listener_closed();
}

fn spawn_accept(stream: TcpStream, server: Arc<Server>, tls_acceptor: Option<TlsAcceptor>) {
    tokio::spawn(async move {
        let result = match tls_acceptor {
            Some(acceptor) => accept_tls(acceptor, stream, server.clone()).await,
            None => Ok(accept_plain(stream, server.clone())),
        };

        server.handle_accept_setup(result);
    });
}

fn accept_plain(stream: TcpStream, server: Arc<Server>) -> Arc<dyn Channel> {
    let channel = TcpChannel::new(stream);
    let channel_id = channel.id();
    channel.set_on_shutdown(move |err| server.handle_accept_shutdown(channel_id, err));
    channel
}

async fn accept_tls(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    server: Arc<Server>,
) -> Result<Arc<dyn Channel>> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|err| Error::with_cause(ErrorCode::ConnectionClosed, err))?;
    let (_, conn) = tls_stream.get_ref();
    let alpn = conn.alpn_protocol().map(|proto| proto.to_vec());
    let channel = TcpChannel::new(tls_stream);
    channel.push_tls_stage(alpn);
    let channel_id = channel.id();
    channel.set_on_shutdown(move |err| server.handle_accept_shutdown(channel_id, err));
    Ok(channel)
}
