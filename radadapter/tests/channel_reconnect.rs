//! Reconnect behavior of the TCP channel against an in-process server

use radadapter::codec;
use radadapter::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

async fn handshake(socket: &mut TcpStream) {
    let (command, _) = codec::read_command(socket).await.unwrap();
    assert!(matches!(command, Command::ExchangeVersions(_)));
    let reply = Response::ExchangeVersions(ExchangeVersionsResponse {
        status: ExchangeVersionsStatus::Successful,
        server_version: CLIENT_VERSION,
        server_platform: Platform::Linux,
    });
    codec::write_response(socket, &reply).await.unwrap();
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_single_retry_then_connection_lost() {
    let (listener, port) = bind().await;
    let connections = Arc::new(AtomicUsize::new(0));

    let server = {
        let connections = connections.clone();
        tokio::spawn(async move {
            // Each connection reads the request and hangs up without replying
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                connections.fetch_add(1, Ordering::SeqCst);
                handshake(&mut socket).await;
                let (command, _) = codec::read_command(&mut socket).await.unwrap();
                assert_eq!(command, Command::ListEnvironmentVariables);
            }
            tokio::time::timeout(Duration::from_millis(300), listener.accept())
                .await
                .is_err()
        })
    };

    let channel = CommunicationChannel::new(ServerConnectionOptions::new("127.0.0.1", port));
    let err = channel
        .send_with_reply(Command::ListEnvironmentVariables, &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        ChannelError::ConnectionLost { endpoint, .. } => assert_eq!(endpoint, &format!("127.0.0.1:{}", port)),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_user_facing());
    assert!(server.await.unwrap(), "no third connection attempt expected");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert_eq!(channel.connection_state(), ClientState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_recovers_after_drop() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        handshake(&mut first).await;
        let _ = codec::read_command(&mut first).await.unwrap();
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        handshake(&mut second).await;
        let (command, _) = codec::read_command(&mut second).await.unwrap();
        assert!(matches!(command, Command::FetchMetadata(_)));
        let reply = Response::MetadataFetched(MetadataFetched {
            status: FetchStatus::Successful,
            timestamp: Timestamp(42),
            byte_count: 1024,
        });
        codec::write_response(&mut second, &reply).await.unwrap();
        let _ = codec::read_command(&mut second).await;
    });

    let channel = CommunicationChannel::new(ServerConnectionOptions::new("127.0.0.1", port))
        .with_reconnect_policy(ReconnectPolicy { max_retries: 1, backoff_ms: 10 });
    let metadata = channel
        .fetch_metadata(
            FetchMetadata { file_path: "/tmp/out.bin".into(), binary_output: true },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(metadata.timestamp, Timestamp(42));
    assert_eq!(metadata.byte_count, 1024);
    assert_eq!(channel.connection_state(), ClientState::Connected);

    channel.force_disconnect();
    server.await.unwrap();
}

#[tokio::test]
async fn test_cancelled_request_is_not_retried() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        handshake(&mut socket).await;
        let _ = codec::read_command(&mut socket).await.unwrap();
        // Never reply; hold the socket until the client gives up
        let _ = codec::read_command(&mut socket).await;
        tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err()
    });

    let channel = Arc::new(CommunicationChannel::new(ServerConnectionOptions::new("127.0.0.1", port)));
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let err = channel
        .send_with_reply(Command::ListEnvironmentVariables, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Cancelled));
    assert!(server.await.unwrap());
}

#[tokio::test]
async fn test_environment_cache_cleared_on_disconnect() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        for value in ["/usr/bin", "/opt/bin"] {
            let (mut socket, _) = listener.accept().await.unwrap();
            handshake(&mut socket).await;
            let (command, _) = codec::read_command(&mut socket).await.unwrap();
            assert_eq!(command, Command::ListEnvironmentVariables);
            let mut variables = BTreeMap::new();
            variables.insert("PATH".to_string(), value.to_string());
            let reply = Response::EnvironmentVariablesListed(EnvironmentVariablesListed { variables });
            codec::write_response(&mut socket, &reply).await.unwrap();
            let _ = codec::read_command(&mut socket).await;
        }
    });

    let channel = CommunicationChannel::new(ServerConnectionOptions::new("127.0.0.1", port));
    let cancel = CancellationToken::new();

    let env = channel.get_remote_environment(&cancel).await.unwrap();
    assert_eq!(env["PATH"], "/usr/bin");
    channel.force_disconnect();

    let env = channel.get_remote_environment(&cancel).await.unwrap();
    assert_eq!(env["PATH"], "/opt/bin");
    channel.force_disconnect();
    server.await.unwrap();
}
