//! ALPN-driven HTTP version dispatch.

use tracing::warn;

use crate::channel::{Channel, StageId};
use crate::error::{Error, ErrorCode, Result};

/// The negotiated (or assumed) HTTP version for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
    Http2,
}

const ALPN_HTTP11: &[u8] = b"http/1.1";
const ALPN_H2: &[u8] = b"h2";

/// Resolves the HTTP version for a freshly-inserted stage.
///
/// Plaintext connections are always HTTP/1.1 (there is no ALPN to
/// consult). TLS connections consult the ALPN protocol reported by the
/// immediately-upstream stage's handler; an empty or unrecognized ALPN
/// value falls back to HTTP/1.1 with a warning rather than failing the
/// connection — a deliberate interop-over-strictness choice carried
/// over unchanged from the original contract.
pub fn resolve(channel: &dyn Channel, stage: StageId, is_using_tls: bool) -> Result<Version> {
    if !is_using_tls {
        return Ok(Version::Http11);
    }

    let upstream = channel
        .upstream_handler(stage)
        .ok_or_else(|| Error::new(ErrorCode::InvalidState))?;

    let alpn = upstream.alpn_protocol();

    match alpn.as_deref() {
        Some(ALPN_H2) => Ok(Version::Http2),
        Some(ALPN_HTTP11) => Ok(Version::Http11),
        Some(other) => {
            warn!(
                target: crate::log_targets::CONNECTION,
                alpn = %String::from_utf8_lossy(other),
                "unrecognized ALPN protocol, falling back to HTTP/1.1"
            );
            Ok(Version::Http11)
        }
        None => {
            warn!(
                target: crate::log_targets::CONNECTION,
                "TLS stage reported no ALPN protocol, falling back to HTTP/1.1"
            );
            Ok(Version::Http11)
        }
    }
}
