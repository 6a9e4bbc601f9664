//! Channel-stage installer: splices a version-appropriate connection
//! handler into a channel's pipeline.

use std::sync::Arc;

use tracing::debug;

use crate::channel::Channel;
use crate::connection::{
    ClientData, Connection, ConnectionHandle, Http1Connection, ProtocolConnection, Role,
    ServerData,
};
use crate::error::{Error, ErrorCode, Result};
use crate::version::{self, Version};

#[cfg(feature = "h2")]
use crate::connection::Http2Connection;

/// Inserts a new stage on `channel`, resolves its HTTP version, and
/// binds a [`Connection`] handler to it, in the order the data model
/// requires: version resolution happens against the stage *before*
/// this stage has its own handler (it only ever looks upstream), and
/// the channel-hold is the very last thing acquired, so a failure at
/// any earlier step never needs to release one.
pub(crate) fn install_stage(
    channel: Arc<dyn Channel>,
    is_server: bool,
    is_using_tls: bool,
    initial_window: u32,
) -> Result<Connection> {
    let stage = channel.insert_stage()?;

    let version = match version::resolve(channel.as_ref(), stage, is_using_tls) {
        Ok(v) => v,
        Err(err) => {
            channel.remove_stage(stage);
            return Err(err);
        }
    };

    let protocol: Box<dyn ProtocolConnection> = match version {
        Version::Http10 | Version::Http11 => Box::new(Http1Connection::new()),
        Version::Http2 => {
            #[cfg(feature = "h2")]
            {
                Box::new(Http2Connection::new(initial_window))
            }
            #[cfg(not(feature = "h2"))]
            {
                let _ = initial_window;
                channel.remove_stage(stage);
                // Resolving to a variant this build never compiled in is a
                // programmer/configuration error, not a recoverable one —
                // distinct from `unsupported-protocol`, which this is not.
                #[allow(clippy::panic)]
                {
                    panic!(
                        "ALPN resolved to HTTP/2 but this build has the `h2` feature disabled; \
                         this is a configuration error, not a recoverable one"
                    );
                }
            }
        }
    };

    let role = if is_server {
        Role::Server(ServerData {
            on_incoming_request: parking_lot::Mutex::new(None),
            on_shutdown: parking_lot::Mutex::new(None),
        })
    } else {
        Role::Client(ClientData {
            proxy_request_transform: parking_lot::Mutex::new(None),
        })
    };

    let connection = Connection::new(version, channel.clone(), protocol, role);
    let handler = ConnectionHandle::new(connection.clone());

    if let Err(err) = channel.bind_handler(stage, handler) {
        channel.remove_stage(stage);
        return Err(err);
    }

    channel.acquire_hold();
    connection.mark_alive();

    debug!(
        target: crate::log_targets::CONNECTION,
        channel = ?channel.id(),
        version = ?version,
        is_server,
        "connection stage installed"
    );

    Ok(connection)
}

/// Rejects a zero initial window, which would leave an HTTP/2
/// connection unable to ever receive data.
pub(crate) fn validate_initial_window(initial_window: u32) -> Result<()> {
    if initial_window == 0 {
        return Err(Error::new(ErrorCode::InvalidArgument));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::channel::fake::{FakeChannel, FakeTlsHandler};

    #[test]
    fn plaintext_install_succeeds_as_http11() {
        let channel = FakeChannel::new();
        let conn = install_stage(channel, false, false, 65535).unwrap();
        assert_eq!(conn.version(), Version::Http11);
        assert!(conn.is_open());
    }

    #[test]
    fn tls_without_upstream_unwinds_stage() {
        let channel = FakeChannel::new();
        let err = install_stage(channel.clone(), false, true, 65535).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[cfg(feature = "h2")]
    #[test]
    fn tls_h2_alpn_installs_http2() {
        let channel = FakeChannel::new();
        channel.push_bound(Arc::new(FakeTlsHandler {
            alpn: Some(b"h2".to_vec()),
        }));
        let conn = install_stage(channel, false, true, 65535).unwrap();
        assert_eq!(conn.version(), Version::Http2);
    }

    #[test]
    fn successful_install_acquires_exactly_one_hold() {
        let channel = FakeChannel::new();
        let _conn = install_stage(channel.clone(), true, false, 65535).unwrap();
        assert_eq!(channel.hold_count(), 1);
    }
}
