//! End-to-end scenarios driving a real server and client over loopback
//! with the in-memory driver.

use gatekeeper_core::client::Client;
use gatekeeper_core::config::{ClientConfig, ServerConfig};
use gatekeeper_core::driver::MockDriver;
use gatekeeper_core::server::Server;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const ACCESS_KEY: &str = "0123456789abcdefghijklmnopqrstuvwxyz";
const WRONG_KEY: &str = "zyxwvutsrqponmlkjihgfedcba9876543210";

fn server_config(secure: bool) -> ServerConfig {
    ServerConfig {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        access_key: ACCESS_KEY.to_string(),
        secure,
        login_error_limit: 3,
        blocking_time_secs: 600,
        allowed_ports: vec![2223, 2224],
        allow_all_ports: false,
        sudo: false,
        driver: "mock".to_string(),
    }
}

async fn start_server(secure: bool) -> u16 {
    let server = Server::bind(server_config(secure), Arc::new(MockDriver::new()))
        .await
        .unwrap();
    let port = server.local_addr().port();
    tokio::spawn(server.run());
    port
}

fn client_config(port: u16, secure: bool, access_key: &str) -> ClientConfig {
    ClientConfig {
        server_address: "127.0.0.1".to_string(),
        server_port: port,
        access_key: access_key.to_string(),
        secure,
    }
}

#[tokio::test]
async fn scenario_login_block_and_list() {
    let port = start_server(false).await;
    let client = Client::connect_and_login(&client_config(port, false, ACCESS_KEY))
        .await
        .unwrap();

    assert!(client.list_blocked_tcp_ports().await.unwrap().is_empty());
    assert!(client.block_tcp_port(2223).await.unwrap());
    assert_eq!(client.list_blocked_tcp_ports().await.unwrap(), vec![2223]);
}

#[tokio::test]
async fn scenario_disallowed_port_is_declined() {
    let port = start_server(false).await;
    let client = Client::connect_and_login(&client_config(port, false, ACCESS_KEY))
        .await
        .unwrap();

    assert!(client.block_tcp_port(2223).await.unwrap());
    // 222 is not in the allowed set; state must not change
    assert!(!client.block_tcp_port(222).await.unwrap());
    assert_eq!(client.list_blocked_tcp_ports().await.unwrap(), vec![2223]);
}

#[tokio::test]
async fn scenario_block_unblock_sequence() {
    let port = start_server(false).await;
    let client = Client::connect_and_login(&client_config(port, false, ACCESS_KEY))
        .await
        .unwrap();

    assert!(client.block_tcp_port(2223).await.unwrap());
    assert!(client.block_tcp_port(2224).await.unwrap());
    assert!(client.unblock_tcp_port(2223).await.unwrap());
    assert_eq!(client.list_blocked_tcp_ports().await.unwrap(), vec![2224]);
}

#[tokio::test]
async fn scenario_accept_rules_and_remote_substitution() {
    let port = start_server(false).await;
    let client = Client::connect_and_login(&client_config(port, false, ACCESS_KEY))
        .await
        .unwrap();

    assert!(client.list_accepted_addresses_on_tcp_ports().await.unwrap().is_empty());

    assert!(client
        .accept_address_on_tcp_port("10.0.0.5", 2223)
        .await
        .unwrap());
    // "." is substituted with the remote address of this connection
    assert!(client.accept_address_on_tcp_port(".", 2224).await.unwrap());

    let accepts = client.list_accepted_addresses_on_tcp_ports().await.unwrap();
    assert_eq!(accepts.len(), 2);
    assert!(accepts.contains(&("10.0.0.5".to_string(), 2223)));
    assert!(accepts.contains(&("127.0.0.1".to_string(), 2224)));

    assert!(client
        .unaccept_address_on_tcp_port("10.0.0.5", Some(2223))
        .await
        .unwrap());
    assert!(client
        .unaccept_address_on_tcp_port("127.0.0.1", None)
        .await
        .unwrap());
    assert!(client.list_accepted_addresses_on_tcp_ports().await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_failed_logins_blocklist_the_remote() {
    let port = start_server(false).await;
    let client = Client::connect(&client_config(port, false, WRONG_KEY))
        .await
        .unwrap();

    assert!(!client.login().await.unwrap());
    assert!(!client.login().await.unwrap());
    // Third failure replies false and closes the socket
    assert!(!client.login().await.unwrap());

    // Another request on the closed connection fails
    assert!(client.list_blocked_tcp_ports().await.is_err());

    // Give the handler a moment to record the limit
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A fresh connection from the same remote is dropped on accept
    let fresh = Client::connect(&client_config(port, false, ACCESS_KEY))
        .await
        .unwrap();
    assert!(fresh.login().await.is_err());
}

#[tokio::test]
async fn scenario_secure_channel_end_to_end() {
    let port = start_server(true).await;
    let client = Client::connect_and_login(&client_config(port, true, ACCESS_KEY))
        .await
        .unwrap();

    assert!(client.block_tcp_port(2223).await.unwrap());
    assert_eq!(client.list_blocked_tcp_ports().await.unwrap(), vec![2223]);
    assert!(client.list_accepted_addresses_on_tcp_ports().await.unwrap().is_empty());
    assert!(client.disconnect().await.unwrap());
}

#[tokio::test]
async fn scenario_secure_server_rejects_unframed_lines() {
    let port = start_server(true).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    stream.write_all(b"list ports\n").await.unwrap();

    let mut buf = [0u8; 64];
    let res = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close promptly");
    assert!(
        matches!(res, Ok(0) | Err(_)),
        "expected the connection to be closed, got {:?}",
        res
    );
}

#[tokio::test]
async fn scenario_oversized_junk_closes_the_connection() {
    let port = start_server(false).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // 2000 octets without a line feed cross the 1024-octet threshold
    let junk = vec![b'x'; 2000];
    let _ = stream.write_all(&junk).await;

    let mut buf = [0u8; 64];
    let res = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close promptly");
    assert!(
        matches!(res, Ok(0) | Err(_)),
        "expected the connection to be closed, got {:?}",
        res
    );
}

#[tokio::test]
async fn scenario_repeated_junk_blocklists_the_remote() {
    let port = start_server(false).await;

    // Each junk burst is one socket error; past the threshold the remote
    // is rejected on accept
    for _ in 0..4 {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _ = stream.write_all(&vec![b'x'; 2000]).await;
        let mut buf = [0u8; 16];
        let _ = timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    }

    // Give the last handler a moment to record the error
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 16];
    let res = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("blocked remote should be dropped promptly");
    assert!(
        matches!(res, Ok(0) | Err(_)),
        "expected the blocked remote to be dropped on accept, got {:?}",
        res
    );
}

#[tokio::test]
async fn scenario_disconnect_closes_the_socket() {
    let port = start_server(false).await;
    let client = Client::connect_and_login(&client_config(port, false, ACCESS_KEY))
        .await
        .unwrap();

    assert!(client.disconnect().await.unwrap());
    assert!(client.list_blocked_tcp_ports().await.is_err());
}
