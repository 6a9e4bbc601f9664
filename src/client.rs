//! Client connect path: dial a transport, install a connection stage,
//! and deliver exactly one setup-or-shutdown notification to the
//! caller regardless of where in the pipeline a failure occurs.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::{Connection, RequestTransform};
use crate::diagnostics;
use crate::error::{Error, ErrorCode, Result};
use crate::install::{install_stage, validate_initial_window};
use crate::system::SystemTable;

/// Callback invoked exactly once with either a ready connection or the
/// reason setup failed.
pub type OnSetup = Box<dyn FnOnce(Option<Connection>, Option<ErrorCode>) + Send>;

/// Callback invoked at most once, after a successfully-set-up
/// connection's channel finishes shutting down.
pub type OnShutdown = Box<dyn FnOnce(Connection, Option<ErrorCode>) + Send>;

/// Placeholder for a forward-proxy target. Proxy CONNECT negotiation
/// is out of this crate's scope; supplying one makes [`client_connect`]
/// fail fast with [`ErrorCode::UnsupportedProtocol`] rather than
/// silently dialing the origin directly.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
}

/// Inputs to [`client_connect`].
pub struct ClientConnectOptions {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub initial_window: u32,
    pub on_setup: OnSetup,
    pub on_shutdown: Option<OnShutdown>,
    pub proxy: Option<ProxyOptions>,
    pub proxy_request_transform: Option<RequestTransform>,
    pub system_table: Option<Arc<dyn SystemTable>>,
}

impl ClientConnectOptions {
    /// Builds options with the required fields; optional fields
    /// default to unset and can be set with the `with_*` methods.
    pub fn new(host: impl Into<String>, port: u16, on_setup: OnSetup) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            initial_window: 65535,
            on_setup,
            on_shutdown: None,
            proxy: None,
            proxy_request_transform: None,
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
    pub fn with_on_shutdown(mut self, on_shutdown: OnShutdown) -> Self {
        self.on_shutdown = Some(on_shutdown);
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn with_system_table(mut self, table: Arc<dyn SystemTable>) -> Self {
        self.system_table = Some(table);
        self
    }
}

/// Ephemeral per-connect record. Survives from the moment a dial is
/// initiated until the resulting channel (if any) finishes shutting
/// down; never freed earlier, even when stage-install fails on an
/// otherwise-live channel.
pub(crate) struct ClientBootstrapRecord {
    on_setup: Mutex<Option<OnSetup>>,
    on_shutdown: Mutex<Option<OnShutdown>>,
    connection: Mutex<Option<Connection>>,
    is_tls: bool,
    initial_window: u32,
    proxy_request_transform: Mutex<Option<RequestTransform>>,
    _diag: diagnostics::Guard,
}

/// Initiates a client connection.
///
/// Validation errors (`invalid-argument`, an unsupported proxy option)
/// and a dial that never starts (the [`SystemTable`] rejects it
/// synchronously, e.g. because no runtime is available to drive it)
/// are returned synchronously and never invoke `on_setup`. Every other
/// failure, however late it occurs in the dial/install sequence, is
/// delivered through `on_setup` or `on_shutdown` — see the module
/// docs.
pub fn client_connect(options: ClientConnectOptions) -> Result<()> {
    if options.host.is_empty() {
        return Err(Error::new(ErrorCode::InvalidArgument));
    }
    validate_initial_window(options.initial_window)?;

    if let Some(proxy) = &options.proxy {
        warn!(
            target: crate::log_targets::CONNECTION_MANAGER,
            proxy_host = %proxy.host,
            proxy_port = proxy.port,
            "proxy CONNECT negotiation is not implemented by this crate"
        );
        return Err(Error::new(ErrorCode::UnsupportedProtocol));
    }

    let table = options
        .system_table
        .unwrap_or_else(crate::system::default_system_table);

    let record = Arc::new(ClientBootstrapRecord {
        on_setup: Mutex::new(Some(options.on_setup)),
        on_shutdown: Mutex::new(options.on_shutdown),
        connection: Mutex::new(None),
        is_tls: options.tls,
        initial_window: options.initial_window,
        proxy_request_transform: Mutex::new(options.proxy_request_transform),
        _diag: diagnostics::Guard::acquire(),
    });

    let setup_record = record.clone();
    let setup: crate::system::SetupCallback = Box::new(move |result| {
        handle_setup(setup_record, result);
    });

    let shutdown_record = record;
    let shutdown: crate::system::ShutdownCallback = Box::new(move |error| {
        handle_shutdown(shutdown_record, error);
    });

    if options.tls {
        table.new_tls_socket_channel(&options.host, options.port, setup, shutdown)?;
    } else {
        table.new_socket_channel(&options.host, options.port, setup, shutdown)?;
    }

    Ok(())
}

fn handle_setup(record: Arc<ClientBootstrapRecord>, result: crate::system::SetupResult) {
    let channel = match result {
        Ok(channel) => channel,
        Err(err) => {
            if let Some(cb) = record.on_setup.lock().take() {
                cb(None, Some(err.code()));
            }
            return;
        }
    };

    match install_stage(channel.clone(), false, record.is_tls, record.initial_window) {
        Ok(connection) => {
            if let Some(transform) = record.proxy_request_transform.lock().take() {
                connection.set_proxy_request_transform(transform);
            }
            *record.connection.lock() = Some(connection.clone());
            debug!(target: crate::log_targets::CONNECTION, "client connection set up");
            if let Some(cb) = record.on_setup.lock().take() {
                cb(Some(connection), None);
            }
        }
        Err(err) => {
            // The user learns about this through the shutdown callback
            // the transport will still invoke for this channel.
            channel.shutdown(Some(err.code()));
        }
    }
}

fn handle_shutdown(record: Arc<ClientBootstrapRecord>, error: Option<ErrorCode>) {
    if let Some(cb) = record.on_setup.lock().take() {
        let code = error.unwrap_or(ErrorCode::Unknown);
        cb(None, Some(code));
        return;
    }
    if let Some(cb) = record.on_shutdown.lock().take() {
        if let Some(connection) = record.connection.lock().take() {
            cb(connection, error);
        }
    }
}
