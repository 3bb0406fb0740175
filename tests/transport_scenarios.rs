//! End-to-end scenarios over real sockets on localhost.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use secure_mesh::transport::{read_frame, write_frame, AuthFrame, Frame, WireCodec};
use secure_mesh::{
    AuthManager, ConnectionState, Host, InboundMessage, Keystore, MeshSecurityConfig, PeerIdentity,
    SecureTransportClient, SecureTransportServer, SecurityPreset, Signer, Subscription, TlsManager,
    TransportError, TransportMessage, TransportOptions,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    dir: TempDir,
    keystore: Arc<Keystore>,
    identity: Arc<PeerIdentity>,
}

fn node() -> Node {
    let dir = tempfile::tempdir().unwrap();
    let keystore = Arc::new(Keystore::open(dir.path()).unwrap());
    let identity = Arc::new(keystore.load_or_create_identity().unwrap());
    Node {
        dir,
        keystore,
        identity,
    }
}

fn options() -> TransportOptions {
    TransportOptions {
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        reconnect: false,
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: 3,
        ..TransportOptions::default()
    }
}

async fn start_server(
    node: &Node,
    preset: SecurityPreset,
    port: u16,
) -> Result<(SecureTransportServer, SocketAddr), TransportError> {
    let server = SecureTransportServer::new(
        port,
        Arc::new(MeshSecurityConfig::preset(preset)),
        Some(node.identity.clone()),
    )?
    .with_options(options())?
    .with_keystore(node.keystore.clone())
    .with_tls_manager(TlsManager::new(node.dir.path().join("tls")))
    .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let addr = server.start().await?;
    Ok((server, addr))
}

fn client_for(
    node: &Node,
    addr: SocketAddr,
    preset: SecurityPreset,
    options: TransportOptions,
) -> SecureTransportClient {
    let host = Host::new("server", "127.0.0.1", addr.port());
    SecureTransportClient::new(
        host,
        Arc::new(MeshSecurityConfig::preset(preset)),
        Some(node.identity.clone()),
    )
    .unwrap()
    .with_options(options)
    .unwrap()
}

async fn recv(subscription: &mut Subscription) -> InboundMessage {
    timeout(WAIT, subscription.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription closed")
}

async fn wait_for_count(server: &SecureTransportServer, expected: usize) {
    timeout(WAIT, async {
        while server.client_count().await != expected {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client count never reached the expected value");
}

async fn wait_for_state(client: &SecureTransportClient, done: impl Fn(&ConnectionState) -> bool) {
    let mut changes = client.state_changes();
    timeout(WAIT, async {
        loop {
            let reached = done(&changes.borrow_and_update());
            if reached {
                return;
            }
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("client never reached the expected state");
}

async fn start_server_with(
    node: &Node,
    options: TransportOptions,
) -> (SecureTransportServer, SocketAddr) {
    let server = SecureTransportServer::new(
        0,
        Arc::new(MeshSecurityConfig::preset(SecurityPreset::Secure)),
        Some(node.identity.clone()),
    )
    .unwrap()
    .with_options(options)
    .unwrap()
    .with_keystore(node.keystore.clone())
    .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn next_frame(stream: &mut TcpStream) -> Option<Frame> {
    let bytes = timeout(WAIT, read_frame(stream))
        .await
        .expect("timed out waiting for a frame")
        .unwrap()?;
    Some(Frame::decode(&bytes).unwrap())
}

async fn expect_challenge(stream: &mut TcpStream) {
    assert!(matches!(
        next_frame(stream).await,
        Some(Frame::Auth(AuthFrame::Challenge(_)))
    ));
}

fn ping(payload: serde_json::Value) -> TransportMessage {
    TransportMessage::new("ping", payload)
}

#[tokio::test]
async fn test_happy_path_with_required_encryption() {
    let server_node = node();
    let client_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();
    let mut server_inbox = server.on_message();

    let client = client_for(&client_node, addr, SecurityPreset::Secure, options());
    let mut client_inbox = client.on_message();
    client.connect().await.unwrap();

    assert!(client.is_authenticated());
    assert!(client.is_encrypted());
    assert_eq!(
        client.server_fingerprint().as_deref(),
        Some(server_node.identity.fingerprint())
    );
    assert_eq!(server.client_count().await, 1);
    let summary = &server.clients().await[0];
    assert_eq!(
        summary.fingerprint.as_deref(),
        Some(client_node.identity.fingerprint())
    );
    assert!(summary.encrypted);

    client.send(ping(json!("x"))).await.unwrap();
    let inbound = recv(&mut server_inbox).await;
    assert_eq!(inbound.message.kind, "ping");
    assert_eq!(inbound.message.payload, json!("x"));
    assert_eq!(
        inbound.sender_fingerprint.as_deref(),
        Some(client_node.identity.fingerprint())
    );

    let reply = TransportMessage::new("pong", json!({"echo": "x"}));
    assert!(server.send_to(inbound.connection, reply).await.unwrap());
    let answer = recv(&mut client_inbox).await;
    assert_eq!(answer.message.kind, "pong");
    assert_eq!(
        answer.sender_fingerprint.as_deref(),
        Some(server_node.identity.fingerprint())
    );

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_revoked_peer_is_rejected() {
    let server_node = node();
    let client_node = node();
    server_node
        .keystore
        .revoke(client_node.identity.fingerprint(), Some("lost laptop".into()))
        .unwrap();

    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();
    let client = client_for(&client_node, addr, SecurityPreset::Secure, options());

    let err = client.connect().await.unwrap_err();
    assert!(
        matches!(err, TransportError::AuthRejected(ref reason) if reason.contains("revoked")),
        "unexpected error: {err}"
    );
    assert!(!client.is_connected());
    assert_eq!(server.client_count().await, 0);

    // Rejections are not retried.
    let attempts = client.connection_attempts();
    assert!(client.connect_with_retry().await.is_err());
    assert_eq!(client.connection_attempts(), attempts + 1);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let server_node = node();
    let client_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();
    let mut inbox = server.on_message();

    // Drive the handshake by hand so we can write arbitrary frames afterwards.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let auth = AuthManager::new(client_node.identity.clone(), &options());

    let frame = read_frame(&mut stream).await.unwrap().unwrap();
    let Frame::Auth(AuthFrame::Challenge(challenge)) = Frame::decode(&frame).unwrap() else {
        panic!("expected a challenge");
    };
    let response = auth.respond_to_challenge(&challenge).unwrap();
    write_frame(
        &mut stream,
        &Frame::Auth(AuthFrame::Response(response)).encode().unwrap(),
    )
    .await
    .unwrap();

    let frame = read_frame(&mut stream).await.unwrap().unwrap();
    let Frame::Auth(AuthFrame::Success {
        server_fingerprint,
        server_public_key,
        proof,
    }) = Frame::decode(&frame).unwrap()
    else {
        panic!("expected auth:success");
    };
    let server_peer = auth
        .verify_server(&challenge, &server_public_key, &server_fingerprint, &proof)
        .unwrap();

    let config = MeshSecurityConfig::preset(SecurityPreset::Secure);
    let mut codec = WireCodec::new(Some(client_node.identity.clone()), &config);
    codec.establish(server_peer).unwrap();

    write_frame(&mut stream, b"{this is not json").await.unwrap();
    write_frame(&mut stream, br#"{"id":"no-type"}"#).await.unwrap();
    let mut downgrade = ping(json!("plain"));
    downgrade.fill_defaults();
    write_frame(&mut stream, &Frame::Plain(downgrade).encode().unwrap())
        .await
        .unwrap();

    let mut next = ping(json!("after"));
    next.fill_defaults();
    let sealed = codec.encode(next).unwrap();
    assert!(matches!(sealed, Frame::Encrypted(_)));
    write_frame(&mut stream, &sealed.encode().unwrap())
        .await
        .unwrap();

    let inbound = recv(&mut inbox).await;
    assert_eq!(inbound.message.payload, json!("after"));
    assert!(inbox.try_recv().is_none());
    assert_eq!(server.client_count().await, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let server_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();

    let mut peers = Vec::new();
    for _ in 0..3 {
        let client_node = node();
        let client = client_for(&client_node, addr, SecurityPreset::Secure, options());
        let inbox = client.on_message();
        client.connect().await.unwrap();
        peers.push((client_node, client, inbox));
    }
    assert_eq!(server.client_count().await, 3);

    let delivered = server
        .broadcast(TransportMessage::new("announce", json!({"n": 1})))
        .await
        .unwrap();
    assert_eq!(delivered, 3);

    for (_, _, inbox) in peers.iter_mut() {
        let inbound = recv(inbox).await;
        assert_eq!(inbound.message.kind, "announce");
        assert_eq!(
            inbound.sender_fingerprint.as_deref(),
            Some(server_node.identity.fingerprint())
        );
    }

    server.stop().await;
}

#[tokio::test]
async fn test_closed_connections_are_deregistered() {
    let server_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Signed, 0)
        .await
        .unwrap();

    let first_node = node();
    let second_node = node();
    let first = client_for(&first_node, addr, SecurityPreset::Signed, options());
    let second = client_for(&second_node, addr, SecurityPreset::Signed, options());
    first.connect().await.unwrap();
    second.connect().await.unwrap();
    assert!(!first.is_encrypted());
    wait_for_count(&server, 2).await;

    first.disconnect().await;
    assert_eq!(first.state(), ConnectionState::Disconnected);
    wait_for_count(&server, 1).await;

    let remaining = server.clients().await;
    assert_eq!(
        remaining[0].fingerprint.as_deref(),
        Some(second_node.identity.fingerprint())
    );

    drop(second);
    wait_for_count(&server, 0).await;
    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_clients() {
    let server_node = node();
    let client_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();
    let client = client_for(&client_node, addr, SecurityPreset::Secure, options());
    client.connect().await.unwrap();

    server.stop().await;
    assert_eq!(server.client_count().await, 0);
    wait_for_state(&client, |state| *state == ConnectionState::Disconnected).await;
    assert!(matches!(
        client.send(ping(json!("late"))).await,
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn test_reconnects_after_server_restart() {
    let server_node = node();
    let client_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();

    let reconnecting = TransportOptions {
        reconnect: true,
        max_reconnect_attempts: 40,
        ..options()
    };
    let client = client_for(&client_node, addr, SecurityPreset::Secure, reconnecting);
    client.connect().await.unwrap();
    server.stop().await;
    drop(server);

    // The old listener is released asynchronously; retry the bind briefly.
    let mut restarted = None;
    for _ in 0..40 {
        match start_server(&server_node, SecurityPreset::Secure, addr.port()).await {
            Ok((server, _)) => {
                restarted = Some(server);
                break;
            }
            Err(_) => sleep(Duration::from_millis(25)).await,
        }
    }
    let server = restarted.expect("could not rebind the server port");
    let mut inbox = server.on_message();

    wait_for_state(&client, |state| {
        matches!(state, ConnectionState::Connected { encrypted: true, .. })
    })
    .await;
    assert!(client.connection_attempts() >= 2);

    client.send(ping(json!("again"))).await.unwrap();
    assert_eq!(recv(&mut inbox).await.message.payload, json!("again"));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_gives_up_at_the_cap() {
    let server_node = node();
    let client_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();

    let capped = TransportOptions {
        reconnect: true,
        reconnect_interval: Duration::from_millis(20),
        max_reconnect_attempts: 2,
        ..options()
    };
    let client = client_for(&client_node, addr, SecurityPreset::Secure, capped);
    client.connect().await.unwrap();
    server.stop().await;

    wait_for_state(&client, |state| {
        *state == ConnectionState::ReconnectExhausted { attempts: 2 }
    })
    .await;
    // One initial connect plus exactly two reconnect attempts.
    assert_eq!(client.connection_attempts(), 3);
}

#[tokio::test]
async fn test_tls_wrapped_happy_path() {
    let server_node = node();
    let client_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Strict, 0)
        .await
        .unwrap();
    let mut inbox = server.on_message();

    let client = client_for(&client_node, addr, SecurityPreset::Strict, options());
    client.connect().await.unwrap();
    assert!(client.is_encrypted());

    client.send(ping(json!("x"))).await.unwrap();
    let inbound = recv(&mut inbox).await;
    assert_eq!(inbound.message.payload, json!("x"));
    assert_eq!(
        inbound.sender_fingerprint.as_deref(),
        Some(client_node.identity.fingerprint())
    );

    // The certificate was persisted under the server's TLS directory.
    let cert = server_node
        .dir
        .path()
        .join("tls")
        .join(format!("{}.crt", server_node.identity.fingerprint()));
    assert!(cert.exists());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_development_preset_carries_plain_messages() {
    let config = Arc::new(MeshSecurityConfig::preset(SecurityPreset::Development));
    let server = SecureTransportServer::new(0, config.clone(), None)
        .unwrap()
        .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let addr = server.start().await.unwrap();
    let mut inbox = server.on_message();

    let client =
        SecureTransportClient::new(Host::new("dev", "127.0.0.1", addr.port()), config, None)
            .unwrap();
    client.connect().await.unwrap();
    assert!(!client.is_authenticated());

    client.send(ping(json!("x"))).await.unwrap();
    let inbound = recv(&mut inbox).await;
    assert_eq!(inbound.message.payload, json!("x"));
    assert!(inbound.sender_fingerprint.is_none());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_handshake_timeout() {
    let server_node = node();
    let short = TransportOptions {
        handshake_timeout: Duration::from_millis(300),
        ..options()
    };
    let (server, addr) = start_server_with(&server_node, short).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    expect_challenge(&mut stream).await;

    let started = Instant::now();
    match next_frame(&mut stream).await {
        Some(Frame::Auth(AuthFrame::Failed { error })) => {
            assert!(error.contains("timed out"), "unexpected error: {error}")
        }
        other => panic!("expected auth:failed, got {other:?}"),
    }
    assert!(next_frame(&mut stream).await.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(server.client_count().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_client_gives_up_when_no_challenge_arrives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mute = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        sleep(WAIT).await;
        drop(socket);
    });

    let client_node = node();
    let short = TransportOptions {
        handshake_timeout: Duration::from_millis(300),
        ..options()
    };
    let client = SecureTransportClient::new(
        Host::new("mute", "127.0.0.1", port),
        Arc::new(MeshSecurityConfig::preset(SecurityPreset::Secure)),
        Some(client_node.identity.clone()),
    )
    .unwrap()
    .with_options(short)
    .unwrap();

    let started = Instant::now();
    let err = client.connect().await.unwrap_err();
    assert!(
        matches!(err, TransportError::Timeout("handshake")),
        "unexpected error: {err}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    mute.abort();
}

#[tokio::test]
async fn test_oversized_frame_before_auth_is_refused() {
    let server_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    expect_challenge(&mut stream).await;
    // Only the length prefix; the server must refuse before reading a body.
    stream.write_all(&(1024u32 * 1024).to_be_bytes()).await.unwrap();

    match next_frame(&mut stream).await {
        Some(Frame::Auth(AuthFrame::Failed { error })) => {
            assert!(error.contains("too large"), "unexpected error: {error}")
        }
        other => panic!("expected auth:failed, got {other:?}"),
    }
    assert!(next_frame(&mut stream).await.is_none());
    assert_eq!(server.client_count().await, 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connects_succeed_while_broadcasting() {
    let server_node = node();
    let (server, addr) = start_server(&server_node, SecurityPreset::Secure, 0)
        .await
        .unwrap();
    let server = Arc::new(server);

    let mut loops = Vec::new();
    for _ in 0..2 {
        let server = Arc::clone(&server);
        loops.push(tokio::spawn(async move {
            loop {
                let _ = server
                    .broadcast(TransportMessage::new("tick", json!(null)))
                    .await;
                tokio::task::yield_now().await;
            }
        }));
    }

    let client_node = node();
    for _ in 0..30 {
        let client = client_for(&client_node, addr, SecurityPreset::Secure, options());
        client.connect().await.unwrap();
        client.disconnect().await;
    }

    for task in loops {
        task.abort();
    }
    server.stop().await;
}

