// ABOUTME: Integration tests for the SSH client.
// ABOUTME: Covers key loading and connection failures without a remote host.

mod support;

use burrow::server::load_host_key;
use burrow::ssh::{Client, ClientConfig, Error, quote};

/// Test: Connect with a key file that does not exist.
/// Expected: KeyLoadFailed naming the path, before any network traffic.
#[tokio::test]
async fn missing_key_file_fails_to_load() {
    support::init_tracing();
    let config = ClientConfig::new("127.0.0.1", "ops").key_path("/nonexistent/id_ed25519");

    let err = Client::connect(config).await.unwrap_err();
    match err {
        Error::KeyLoadFailed { path, .. } => {
            assert_eq!(path.to_str(), Some("/nonexistent/id_ed25519"))
        }
        other => panic!("expected KeyLoadFailed, got {other:?}"),
    }
}

/// Test: Connect to a port nobody listens on.
/// Expected: A connection error.
#[tokio::test]
async fn refused_connection_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("id_ed25519");
    load_host_key(&key_path, true).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = ClientConfig::new("127.0.0.1", "ops")
        .port(port)
        .key_path(&key_path)
        .known_hosts_path(dir.path().join("known_hosts"));

    let err = Client::connect(config).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {err:?}");
}

/// Test: Quote paths and hosts for the remote shell.
/// Expected: Plain words pass through, anything else is single-quoted safely.
#[test]
fn shell_quoting() {
    assert_eq!(quote("/srv/app"), "/srv/app");
    assert_eq!(quote("my file"), "'my file'");
    assert_eq!(quote("it's"), "'it'\\''s'");
    assert_eq!(quote(""), "''");
}
