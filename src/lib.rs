//! Connection lifecycle and ALPN version dispatch for a
//! channel-pipelined HTTP client/server.
//!
//! This crate sits between a byte-channel pipeline (modeled here only
//! as the [`channel`] module's trait surface — a real implementation
//! is a separate concern) and the HTTP/1.1 and HTTP/2 protocol
//! handlers that actually parse wire bytes. Its job is: decide which
//! protocol a freshly-established connection is speaking (via
//! [`version`]), splice the right handler into the channel pipeline
//! (via [`install`]), and manage that connection's refcounted lifetime
//! against its channel's (via [`connection`]). [`client`] and
//! [`server`] wire that up into the two entry points embedders
//! actually call; [`net`] is a real Tokio/rustls transport so the
//! crate is runnable out of the box and not merely a set of traits.
//!
//! # Example
//!
//! ```no_run
//! use protomux::client::{client_connect, ClientConnectOptions};
//!
//! let options = ClientConnectOptions::new(
//!     "example.test",
//!     443,
//!     Box::new(|connection, _error| {
//!         if let Some(conn) = connection {
//!             tracing::info!(version = ?conn.version(), "connected");
//!             conn.release();
//!         }
//!     }),
//! )
//! .with_tls(true);
//!
//! if let Err(err) = client_connect(options) {
//!     tracing::warn!(?err, "client_connect rejected its own options");
//! }
//! ```

#![warn(clippy::print_stdout, clippy::dbg_macro)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod client;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod install;
pub mod log_targets;
#[cfg(feature = "rustls")]
pub mod net;
pub mod server;
pub mod system;
pub mod version;

pub use connection::Connection;
pub use error::{Error, ErrorCode, Result};
pub use server::Server;
pub use version::Version;

/// Must be called before any other operation in this crate.
///
/// Resets the [`diagnostics`] outstanding-object counter so a fresh
/// process (or a fresh test) starts from a known baseline. Not
/// reentrant.
pub fn library_init() {
    tracing::debug!(target: log_targets::GENERAL, "library initialized");
    diagnostics::reset();
}

/// Must be called once all usage of this crate has ceased.
///
/// Not reentrant; calling it while connections or servers are still
/// live leaves [`diagnostics::outstanding`] non-zero, which is the
/// condition its callers typically assert against in tests.
pub fn library_clean_up() {
    tracing::debug!(
        target: log_targets::GENERAL,
        outstanding = diagnostics::outstanding(),
        "library cleaned up"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn init_resets_diagnostics() {
        let _guard = diagnostics::Guard::acquire();
        library_init();
        assert_eq!(diagnostics::outstanding(), 0);
    }
}
