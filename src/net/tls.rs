//! TLS glue: ALPN-reporting handler plus a minimal client connector
//! built from the platform/web trust roots.

use std::sync::Arc;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::channel::Handler;
use crate::error::{Error, ErrorCode, Result};

#[derive(Debug)]
pub(crate) struct AlpnHandler {
    pub(crate) alpn: Option<Vec<u8>>,
}

impl Handler for AlpnHandler {
    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.alpn.clone()
    }
}

/// Builds a default client connector offering `h2` and `http/1.1` over
/// ALPN and trusting the `webpki-roots` CA bundle. Returns `None` only
/// if rustls's default crypto provider could not be installed, which
/// indicates a build misconfiguration rather than a runtime condition.
pub(crate) fn default_connector() -> Option<TlsConnector> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    #[cfg(feature = "h2")]
    {
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    }
    #[cfg(not(feature = "h2"))]
    {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
    }

    Some(TlsConnector::from(Arc::new(config)))
}

pub(crate) async fn handshake_client(
    connector: TlsConnector,
    host: &str,
    stream: TcpStream,
) -> Result<(TlsStream<TcpStream>, Option<Vec<u8>>)> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|err| Error::with_cause(ErrorCode::InvalidArgument, err))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|err| Error::with_cause(ErrorCode::ConnectionClosed, err))?;

    let (_, conn) = tls_stream.get_ref();
    let alpn = conn.alpn_protocol().map(|proto| proto.to_vec());

    Ok((tls_stream, alpn))
}
