use anyhow::Result;
use beacon_common::logging::{Component, Logger};
use beacon_node::{BeaconConfig, Client, ErrorKind, KvEngine, NodeIdentity, Server};
use beacon_test_utils::{
    init_test_logging, math_service, string_predicates, TestBackend, TEST_HOST,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// A server exposes `isString` (and an action its object does not have)
/// under `lodash`; a client discovers it and calls through the pool.
///
/// INTENTION: Exercise the whole call path (registration, discovery,
/// selection, permission check, dispatch) on one registry backend.
async fn lodash_round_trip(backend: &str, port: u16) -> Result<()> {
    init_test_logging();
    let logger = Arc::new(Logger::new_root(Component::Client, "client_server_test"));
    let world = TestBackend::new(backend);

    let server = world.server(port).await?;
    let permitted = server
        .add(
            "lodash",
            Arc::new(string_predicates()),
            ["isString", "no_such_action"],
        )
        .await?;
    assert!(permitted.allows("isString"));
    assert!(!permitted.allows("no_such_action"));
    logger.info(format!("registered lodash on {backend}: {permitted}"));

    let client = world.client().await?;

    let result = client.call("lodash", "isString", vec![json!("a")]).await?;
    assert_eq!(result, json!(true));
    let result: bool = client.call_as("lodash", "isString", vec![json!(1)]).await?;
    assert!(!result);

    // Present on the object, but not exposed under this alias
    let err = client
        .call("lodash", "isNumber", vec![json!(1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActionForbidden);

    let err = client
        .call("lodash", "no_such_action", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActionForbidden);

    let err = client
        .call("missingAlias", "isString", vec![json!("a")])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoServiceFound);

    assert_eq!(client.provider_count("lodash"), 1);
    assert_eq!(
        client.provider_ids("lodash"),
        vec![TestBackend::address(port)]
    );

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_lodash_over_flat_ttl() {
    match timeout(Duration::from_secs(10), lodash_round_trip("flat-ttl", 7101)).await {
        Ok(result) => result.unwrap(),
        Err(_) => panic!("Test timed out after 10 seconds"),
    }
}

#[tokio::test]
async fn test_lodash_over_hierarchical() {
    match timeout(
        Duration::from_secs(10),
        lodash_round_trip("hierarchical", 7102),
    )
    .await
    {
        Ok(result) => result.unwrap(),
        Err(_) => panic!("Test timed out after 10 seconds"),
    }
}

#[tokio::test]
async fn test_server_listens_once_for_many_aliases() -> Result<()> {
    let world = TestBackend::new("hierarchical");
    let server = world.server(7110).await?;
    assert!(!server.is_listening());
    assert!(!world.network.is_listening(&TestBackend::address(7110)));

    server
        .add("lodash", Arc::new(string_predicates()), Vec::<String>::new())
        .await?;
    assert!(server.is_listening());
    // A second listen on the same address would fail; this must not
    server
        .add("math", Arc::new(math_service()), Vec::<String>::new())
        .await?;
    assert_eq!(server.aliases(), vec!["lodash", "math"]);

    let client = world.client().await?;
    let sum = client
        .call("math", "add", vec![json!(2), json!(3)])
        .await?;
    assert_eq!(sum, json!(5.0));
    assert_eq!(
        client.call("lodash", "isArray", vec![json!([1])]).await?,
        json!(true)
    );

    server.shutdown().await;
    assert!(!server.is_listening());
    Ok(())
}

#[tokio::test]
async fn test_handler_failures_become_remote_call_errors() -> Result<()> {
    let world = TestBackend::new("flat-ttl");
    let server = world.server(7120).await?;
    server
        .add("math", Arc::new(math_service()), Vec::<String>::new())
        .await?;
    let client = world.client().await?;

    let err = client
        .call("math", "divide", vec![json!(1), json!(0)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteCallError);
    assert!(err.to_string().contains("Division by zero"));

    // Allowed by an empty action list, but not on the object
    let err = client.call("math", "sqrt", vec![json!(4)]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteCallError);

    assert_eq!(
        client.call("math", "divide", vec![json!(9), json!(3)]).await?,
        json!(3.0)
    );
    Ok(())
}

#[tokio::test]
async fn test_invalid_arguments_fail_before_the_network() -> Result<()> {
    let world = TestBackend::new("flat-ttl");
    let client = world.client().await?;

    let err = client.call("", "isString", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
    let err = client.call("lodash", " ", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
    let err = client.call("lo/dash", "isString", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
    Ok(())
}

#[tokio::test]
async fn test_unknown_backend_is_unsupported() {
    let err = Client::builder(BeaconConfig::new("mongodb"))
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterUnsupported);

    let err = Server::builder(BeaconConfig::new("etcd"))
        .with_identity(NodeIdentity::new("127.0.0.1", 7130))
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterUnsupported);
}

#[tokio::test]
async fn test_known_backend_without_engine_is_unavailable() {
    let err = Client::builder(BeaconConfig::new("hierarchical"))
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);
}

#[tokio::test]
async fn test_rejected_alias_does_not_start_listening() -> Result<()> {
    let world = TestBackend::new("flat-ttl");
    let server = world.server(7150).await?;

    let err = server
        .add("lo/dash", Arc::new(string_predicates()), Vec::<String>::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
    assert!(!server.is_listening());
    assert!(!world.network.is_listening(&TestBackend::address(7150)));
    assert!(server.aliases().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_server_without_a_concrete_port_is_rejected() {
    let world = TestBackend::new("flat-ttl");
    let err = Server::builder(world.config())
        .with_identity(NodeIdentity::new(TEST_HOST, 0))
        .with_engines(world.engines())
        .with_transport(world.transport())
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);

    let err = Server::builder(world.config().with_port(0))
        .with_engines(world.engines())
        .with_transport(world.transport())
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
}

/// The registry is down while the first alias registers; the republish loop
/// announces it once the registry is back.
async fn presence_recovers_after_failed_first_publish() -> Result<()> {
    let world = TestBackend::new("flat-ttl");
    let server = Server::builder(world.config().with_republish_interval_secs(1))
        .with_identity(NodeIdentity::new(TEST_HOST, 7140))
        .with_engines(world.engines())
        .with_transport(world.transport())
        .build()
        .await?;

    world.kv.set_offline(true);
    let err = server
        .add("lodash", Arc::new(string_predicates()), ["isString"])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);
    assert_eq!(server.aliases(), vec!["lodash"]);
    assert!(server.is_listening());

    world.kv.set_offline(false);
    let key = "beacon/services/lodash/127.0.0.1:7140".to_string();
    while world.kv.scan("beacon/services/lodash/*").await? != vec![key.clone()] {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let client = world.client().await?;
    assert_eq!(
        client.call("lodash", "isString", vec![json!("a")]).await?,
        json!(true)
    );

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_presence_recovers_after_failed_first_publish() {
    match timeout(
        Duration::from_secs(10),
        presence_recovers_after_failed_first_publish(),
    )
    .await
    {
        Ok(result) => result.unwrap(),
        Err(_) => panic!("Test timed out after 10 seconds"),
    }
}
