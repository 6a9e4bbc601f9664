//! Stable `tracing` target namespace for this crate and the protocol
//! layers built on top of it.
//!
//! Every target this crate logs under is named here once, so
//! `RUST_LOG` filters (`RUST_LOG=protomux::connection=debug`, etc.)
//! stay stable across versions instead of drifting with whatever
//! string a call site happened to type. [`STREAM`], [`WEBSOCKET`], and
//! [`WEBSOCKET_SETUP`] are not emitted anywhere in this crate — framing
//! and websocket upgrade are out of its scope — but are declared here
//! for namespace-completeness, so a higher-layer crate built on top of
//! this one inherits the same filtering vocabulary instead of
//! inventing its own.

/// Crate-wide lifecycle events not tied to a single connection, server,
/// or channel (e.g. [`crate::library_init`]/[`crate::library_clean_up`]).
pub const GENERAL: &str = "protomux::general";
pub const CONNECTION: &str = "protomux::connection";
pub const SERVER: &str = "protomux::server";
pub const CONNECTION_MANAGER: &str = "protomux::connection-manager";

/// Declared for namespace-completeness; this crate does not parse
/// stream frames itself.
pub const STREAM: &str = "protomux::stream";
/// Declared for namespace-completeness; this crate does not implement
/// the websocket upgrade handshake itself.
pub const WEBSOCKET: &str = "protomux::websocket";
/// Declared for namespace-completeness; covers the upgrade-negotiation
/// slice of the websocket target a higher layer would log under.
pub const WEBSOCKET_SETUP: &str = "protomux::websocket-setup";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_target_is_namespaced_under_the_crate() {
        for target in [
            GENERAL,
            CONNECTION,
            SERVER,
            CONNECTION_MANAGER,
            STREAM,
            WEBSOCKET,
            WEBSOCKET_SETUP,
        ] {
            assert!(target.starts_with("protomux::"));
        }
    }
}
