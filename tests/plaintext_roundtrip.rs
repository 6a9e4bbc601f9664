//! End-to-end check of the Tokio/rustls transport binding: a real
//! `Listener` accepting a real `client_connect` dial over loopback TCP,
//! with no TLS in the mix. The fake-`Channel` unit tests elsewhere in
//! this crate cover the lifecycle invariants in isolation; this test
//! exists to confirm the `net` module actually wires them up correctly
//! against a real socket.

#![cfg(feature = "rustls")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use tokio::sync::oneshot;

use protomux::client::{client_connect, ClientConnectOptions};
use protomux::net::Listener;
use protomux::server::{Server, ServerOptions};
use protomux::version::Version;

#[tokio::test]
async fn plaintext_client_dials_real_listener() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let (accepted_tx, accepted_rx) = oneshot::channel();
    let accepted_tx = std::sync::Mutex::new(Some(accepted_tx));

    let server = Server::new(ServerOptions::new(Box::new(move |_server, conn, err| {
        assert!(err.is_none());
        let conn = conn.expect("server should have received a connection");
        conn.configure_server(Some(|| {}), None::<fn(Option<protomux::ErrorCode>)>)
            .expect("fresh server connection should accept configuration");
        if let Some(tx) = accepted_tx.lock().unwrap().take() {
            let _ = tx.send(conn);
        }
    })))
    .unwrap();

    let listener = Listener::bind("127.0.0.1:0", server.clone(), None)
        .await
        .unwrap();
    let addr = listener.local_addr();

    let (setup_tx, setup_rx) = oneshot::channel();
    let options = ClientConnectOptions::new(
        addr.ip().to_string(),
        addr.port(),
        Box::new(move |conn, err| {
            let _ = setup_tx.send((conn, err));
        }),
    );
    client_connect(options).unwrap();

    let (client_conn, client_err) = setup_rx.await.unwrap();
    assert!(client_err.is_none());
    let client_conn = client_conn.expect("client should have connected");
    assert_eq!(client_conn.version(), Version::Http11);

    let server_conn = accepted_rx.await.unwrap();
    assert_eq!(server_conn.version(), Version::Http11);
    assert!(server_conn.is_open());

    client_conn.release();
    server_conn.release();

    server.release();
    // join() only resolves once the listener's accept loop has
    // actually exited and dropped the socket, not merely once the
    // connection map is empty.
    tokio::time::timeout(std::time::Duration::from_secs(5), server.join())
        .await
        .expect("server.join() should resolve once the listener finishes closing");

    let refused = tokio::net::TcpStream::connect(addr).await;
    assert!(
        refused.is_err(),
        "listener socket should be gone after server.release()/join(), but a new connection to {addr} succeeded"
    );
}
