//! Process-wide indirection over transport-dial primitives.
//!
//! Exists so tests can inject a fake dialer instead of opening real
//! sockets, and so a caller embedding this crate in an unusual runtime
//! can swap the production implementation wholesale.

use std::sync::{Arc, OnceLock};

use crate::channel::Channel;
use crate::error::Result;

/// Outcome handed to a dial's setup callback: either a channel is
/// ready, or the dial failed with an error.
pub type SetupResult = std::result::Result<Arc<dyn Channel>, crate::error::Error>;

/// A one-shot callback invoked when a dial completes (successfully or
/// not) and again when the resulting channel finishes shutting down.
pub type SetupCallback = Box<dyn FnOnce(SetupResult) + Send>;
pub type ShutdownCallback = Box<dyn FnOnce(Option<crate::error::ErrorCode>) + Send>;

/// The dial primitives this crate needs from a transport
/// implementation.
///
/// The production implementation (behind the `rustls` feature) is
/// [`crate::net::TokioSystemTable`]; tests typically supply a fake
/// that completes synchronously against an in-memory [`Channel`].
///
/// Returning `Err` here means the dial never even started — `setup`
/// and `shutdown` are both dropped uncalled, and the error propagates
/// synchronously out of [`crate::client::client_connect`]. This is
/// distinct from a dial that starts but later fails (e.g. the TCP
/// handshake is refused): that failure arrives through `setup` as a
/// `SetupResult::Err`, not as a `Result::Err` from this method.
pub trait SystemTable: Send + Sync {
    /// Dials a plaintext socket channel to `host`:`port`.
    fn new_socket_channel(
        &self,
        host: &str,
        port: u16,
        setup: SetupCallback,
        shutdown: ShutdownCallback,
    ) -> Result<()>;

    /// Dials a TLS socket channel to `host`:`port`, with ALPN offered
    /// for `http/1.1` and (if compiled in) `h2`.
    fn new_tls_socket_channel(
        &self,
        host: &str,
        port: u16,
        setup: SetupCallback,
        shutdown: ShutdownCallback,
    ) -> Result<()>;
}

static DEFAULT: OnceLock<Arc<dyn SystemTable>> = OnceLock::new();

/// Installs the process-wide default system table, if one has not
/// already been installed or implicitly initialized by a prior call to
/// [`default_system_table`].
///
/// Returns `false` if a default was already in place.
pub fn set_default_system_table(table: Arc<dyn SystemTable>) -> bool {
    DEFAULT.set(table).is_ok()
}

/// Returns the process-wide default system table, lazily initializing
/// it to [`crate::net::TokioSystemTable`] on first use when the
/// `rustls` feature is enabled.
pub fn default_system_table() -> Arc<dyn SystemTable> {
    DEFAULT
        .get_or_init(|| {
            #[cfg(feature = "rustls")]
            {
                Arc::new(crate::net::TokioSystemTable::new())
            }
            #[cfg(not(feature = "rustls"))]
            {
                Arc::new(NoTransportSystemTable)
            }
        })
        .clone()
}

/// Placeholder system table used when no transport binding is
/// compiled in. Every dial fails with `unsupported-protocol`; callers
/// are expected to inject their own [`SystemTable`] via
/// [`set_default_system_table`] in that configuration.
#[cfg(not(feature = "rustls"))]
struct NoTransportSystemTable;

#[cfg(not(feature = "rustls"))]
impl SystemTable for NoTransportSystemTable {
    fn new_socket_channel(
        &self,
        _host: &str,
        _port: u16,
        setup: SetupCallback,
        _shutdown: ShutdownCallback,
    ) -> Result<()> {
        setup(Err(crate::error::Error::new(
            crate::error::ErrorCode::UnsupportedProtocol,
        )));
        Ok(())
    }

    fn new_tls_socket_channel(
        &self,
        _host: &str,
        _port: u16,
        setup: SetupCallback,
        _shutdown: ShutdownCallback,
    ) -> Result<()> {
        setup(Err(crate::error::Error::new(
            crate::error::ErrorCode::UnsupportedProtocol,
        )));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct NoopTable;

    impl SystemTable for NoopTable {
        fn new_socket_channel(
            &self,
            _host: &str,
            _port: u16,
            _setup: SetupCallback,
            _shutdown: ShutdownCallback,
        ) -> Result<()> {
            Ok(())
        }

        fn new_tls_socket_channel(
            &self,
            _host: &str,
            _port: u16,
            _setup: SetupCallback,
            _shutdown: ShutdownCallback,
        ) -> Result<()> {
            Ok(())
        }
    }

    /// Only the first `set_default_system_table` call in a process can
    /// win; this mirrors the "single pointer write, installed once"
    /// contract rather than true hot-swap semantics.
    #[test]
    fn default_system_table_installs_at_most_once() {
        assert!(set_default_system_table(Arc::new(NoopTable)));
        assert!(!set_default_system_table(Arc::new(NoopTable)));
    }
}
