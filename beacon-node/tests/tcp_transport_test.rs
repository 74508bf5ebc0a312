use anyhow::{anyhow, Result};
use beacon_common::logging::{Component, Logger};
use beacon_node::identity::{first_free_port, NodeIdentity};
use beacon_node::network::transport::{
    BoxFuture, CallEnvelope, ConnectionStatus, EnvelopeHandler, NetworkError, ResponseEnvelope,
    ResponseOutcome, RpcConnection, RpcListener, MAX_FRAME_SIZE,
};
use beacon_node::{
    Client, ErrorKind, KvEngine, LocalService, MemoryKvEngine, RpcTransport, Server, TcpTransport,
};
use beacon_test_utils::{create_test_config, math_service};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn logger() -> Arc<Logger> {
    Arc::new(Logger::new_root(Component::Transport, "tcp_transport_test"))
}

/// Echoes the params back, after waiting the number of milliseconds given
/// as the first byte.
fn delayed_echo() -> EnvelopeHandler {
    Arc::new(
        |envelope: CallEnvelope| -> BoxFuture<'static, ResponseEnvelope> {
            Box::pin(async move {
                let delay = envelope.params.first().copied().unwrap_or(0) as u64;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                ResponseEnvelope::result(envelope.call_id, envelope.params)
            })
        },
    )
}

/// Answers `huge` with a result no frame can carry, anything else with its
/// params
fn huge_or_echo() -> EnvelopeHandler {
    Arc::new(
        |envelope: CallEnvelope| -> BoxFuture<'static, ResponseEnvelope> {
            Box::pin(async move {
                if envelope.action == "huge" {
                    ResponseEnvelope::result(envelope.call_id, vec![b'x'; MAX_FRAME_SIZE + 1])
                } else {
                    ResponseEnvelope::result(envelope.call_id, envelope.params)
                }
            })
        },
    )
}

fn envelope(call_id: &str, params: Vec<u8>) -> CallEnvelope {
    CallEnvelope {
        sender_id: "tcp_transport_test".into(),
        call_id: call_id.into(),
        alias: "echo".into(),
        action: "echo".into(),
        params,
    }
}

fn free_port(start: u16) -> Result<u16> {
    first_free_port(start).ok_or_else(|| anyhow!("no free port at or above {start}"))
}

#[tokio::test]
async fn test_calls_are_multiplexed_on_one_stream() -> Result<()> {
    let transport = TcpTransport::new(logger());
    let listener = transport.listen("127.0.0.1", 0, delayed_echo()).await?;
    let address = listener.local_address();
    let port: u16 = address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| anyhow!("bad listener address {address}"))?;
    assert_ne!(port, 0);

    let connection = transport.connect("127.0.0.1", port).await?;
    assert_eq!(connection.peer_address(), format!("127.0.0.1:{port}"));

    // The slow call is sent first but answers last
    let slow = connection.send(envelope("slow", vec![200, 1]));
    let fast = connection.send(envelope("fast", vec![0, 2]));
    let joined = timeout(Duration::from_secs(5), async { tokio::join!(slow, fast) }).await;
    let (slow, fast) = match joined {
        Ok(results) => results,
        Err(_) => panic!("Test timed out after 5 seconds"),
    };
    let (slow, fast) = (slow?, fast?);
    assert_eq!(slow.call_id, "slow");
    assert_eq!(slow.outcome, ResponseOutcome::Result(vec![200, 1]));
    assert_eq!(fast.call_id, "fast");
    assert_eq!(fast.outcome, ResponseOutcome::Result(vec![0, 2]));

    connection.close().await;
    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_stopped_listener_closes_connections() -> Result<()> {
    let transport = TcpTransport::new(logger());
    let port = free_port(17300)?;
    let listener = transport.listen("127.0.0.1", port, delayed_echo()).await?;
    let connection = transport.connect("127.0.0.1", port).await?;
    let response = connection.send(envelope("c1", vec![0])).await?;
    assert_eq!(response.outcome, ResponseOutcome::Result(vec![0]));

    let mut status = connection.status();
    assert!(status.borrow().is_open());
    listener.stop().await;

    let closed = timeout(Duration::from_secs(5), async {
        while status.borrow().is_open() {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed within 5 seconds");
    assert!(!matches!(*status.borrow(), ConnectionStatus::Open));
    assert!(connection.send(envelope("c2", vec![0])).await.is_err());
    Ok(())
}

/// Calls racing a closing connection all settle, none waits forever
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_racing_a_close_all_settle() -> Result<()> {
    let transport = TcpTransport::new(logger());
    let port = free_port(17800)?;
    let listener = transport.listen("127.0.0.1", port, delayed_echo()).await?;
    let connection = transport.connect("127.0.0.1", port).await?;

    let mut calls = Vec::new();
    for i in 0..200u32 {
        let connection = connection.clone();
        calls.push(tokio::spawn(async move {
            connection
                .send(envelope(&format!("race-{i}"), vec![(i % 5) as u8]))
                .await
        }));
        if i == 100 {
            listener.stop().await;
        }
    }

    let settled = timeout(Duration::from_secs(10), futures_util::future::join_all(calls)).await;
    let results = match settled {
        Ok(results) => results,
        Err(_) => panic!("a call never settled after the connection closed"),
    };
    assert_eq!(results.len(), 200);

    // Once closed, later calls fail immediately
    let mut status = connection.status();
    let closed = timeout(Duration::from_secs(5), async {
        while status.borrow().is_open() {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed within 5 seconds");
    let late = timeout(Duration::from_secs(5), connection.send(envelope("late", vec![0]))).await;
    assert!(matches!(late, Ok(Err(_))));
    Ok(())
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() -> Result<()> {
    let transport = TcpTransport::new(logger());
    let port = free_port(17400)?;
    assert!(transport.connect("127.0.0.1", port).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_oversized_frames_fail_only_their_call() -> Result<()> {
    let transport = TcpTransport::new(logger());
    let port = free_port(17600)?;
    let listener = transport.listen("127.0.0.1", port, huge_or_echo()).await?;
    let connection = transport.connect("127.0.0.1", port).await?;

    // Too large to send: refused before anything is written
    let err = connection
        .send(envelope("big-call", vec![0; MAX_FRAME_SIZE + 1]))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::FrameTooLarge(_)));

    // Too large to answer: the server sends an error response instead
    let mut huge = envelope("big-result", vec![1]);
    huge.action = "huge".into();
    let response = match timeout(Duration::from_secs(10), connection.send(huge)).await {
        Ok(response) => response?,
        Err(_) => panic!("Test timed out after 10 seconds"),
    };
    assert_eq!(response.call_id, "big-result");
    match response.outcome {
        ResponseOutcome::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::RemoteCallError);
            assert!(message.contains("result too large"));
        }
        other => panic!("expected an error response, got {other:?}"),
    }

    assert!(connection.status().borrow().is_open());
    let response = connection.send(envelope("small", vec![3])).await?;
    assert_eq!(response.outcome, ResponseOutcome::Result(vec![3]));

    connection.close().await;
    listener.stop().await;
    Ok(())
}

/// A service whose result cannot fit in one frame
fn oversized_service() -> LocalService {
    LocalService::new("blob")
        .with_sync_action("ping", |_| Ok(json!("pong")))
        .with_sync_action("huge", |_| Ok(json!("x".repeat(MAX_FRAME_SIZE))))
}

/// Oversized payloads in either direction fail the call without costing the
/// provider its place in the pool or the registry
#[tokio::test]
async fn test_oversized_payloads_keep_the_provider_listed() -> Result<()> {
    let kv = Arc::new(MemoryKvEngine::new());
    let config = create_test_config("flat-ttl");
    let port = free_port(17700)?;

    let server = Server::builder(config.clone())
        .with_identity(NodeIdentity::new("127.0.0.1", port))
        .with_kv_engine(kv.clone())
        .build()
        .await?;
    server
        .add("blob", Arc::new(oversized_service()), Vec::<String>::new())
        .await?;
    let client = Client::builder(config).with_kv_engine(kv.clone()).build().await?;

    let result = timeout(Duration::from_secs(20), async {
        assert_eq!(client.call("blob", "ping", vec![]).await?, json!("pong"));

        let err = client
            .call("blob", "ping", vec![json!("y".repeat(MAX_FRAME_SIZE))])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);

        let err = client.call("blob", "huge", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteCallError);
        assert!(err.to_string().contains("result too large"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.provider_count("blob"), 1);
        assert_eq!(kv.scan("beacon/services/blob/*").await?.len(), 1);
        assert_eq!(client.call("blob", "ping", vec![]).await?, json!("pong"));
        Ok::<_, anyhow::Error>(())
    })
    .await;
    match result {
        Ok(result) => result?,
        Err(_) => panic!("Test timed out after 20 seconds"),
    }

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

/// Facades over real sockets with the default transport
#[tokio::test]
async fn test_client_and_server_over_tcp() -> Result<()> {
    let kv = Arc::new(MemoryKvEngine::new());
    let config = create_test_config("flat-ttl");
    let port = free_port(17500)?;

    let server = Server::builder(config.clone())
        .with_identity(NodeIdentity::new("127.0.0.1", port))
        .with_kv_engine(kv.clone())
        .build()
        .await?;
    server
        .add("math", Arc::new(math_service()), ["add", "slowEcho"])
        .await?;
    assert!(server.is_listening());

    let client = Client::builder(config).with_kv_engine(kv).build().await?;

    let result = timeout(Duration::from_secs(10), async {
        let (sum, echoed) = tokio::join!(
            client.call("math", "add", vec![json!(1.5), json!(2.5)]),
            client.call("math", "slowEcho", vec![json!("hi"), json!(20)]),
        );
        Ok::<_, anyhow::Error>((sum?, echoed?))
    })
    .await;
    let (sum, echoed) = match result {
        Ok(values) => values?,
        Err(_) => panic!("Test timed out after 10 seconds"),
    };
    assert_eq!(sum, json!(4.0));
    assert_eq!(echoed, json!("hi"));

    let err = client
        .call("math", "divide", vec![json!(1), json!(1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), beacon_node::ErrorKind::ActionForbidden);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
