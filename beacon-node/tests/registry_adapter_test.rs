use anyhow::Result;
use beacon_common::logging::{Component, Logger};
use beacon_node::config::BackendOptions;
use beacon_node::errors::RpcError;
use beacon_node::network::discovery::{create_adapter, ChangeListener, RegistryEngines};
use beacon_node::{
    BackendKind, BeaconEvent, ErrorKind, EventBus, MemoryKvEngine, MemoryTreeEngine,
    RegistryAdapter,
};
use beacon_test_utils::wait_until;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const LIVENESS: Duration = Duration::from_secs(60);

fn options() -> BackendOptions {
    BackendOptions {
        root: None,
        resubscribe_interval_ms: 20,
    }
}

async fn adapter(
    backend: &str,
    engines: &RegistryEngines,
) -> Result<(Arc<dyn RegistryAdapter>, EventBus)> {
    let logger = Arc::new(Logger::new_root(Component::Adapter, "registry_adapter_test"));
    let events = EventBus::new(logger.clone());
    let adapter = create_adapter(backend, &options(), engines, events.clone(), logger)?;
    adapter.connect().await?;
    Ok((adapter, events))
}

/// Listener that forwards every notification into a channel
fn collecting_listener() -> (
    ChangeListener,
    mpsc::UnboundedReceiver<Result<Vec<String>, RpcError>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: ChangeListener = Arc::new(
        move |change: Result<Vec<String>, RpcError>| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(change);
            })
        },
    );
    (listener, rx)
}

async fn next_keys(
    rx: &mut mpsc::UnboundedReceiver<Result<Vec<String>, RpcError>>,
) -> Vec<String> {
    loop {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Ok(keys))) => return keys,
            Ok(Some(Err(_))) => continue,
            Ok(None) => panic!("listener channel closed"),
            Err(_) => panic!("no notification within 2 seconds"),
        }
    }
}

/// Publish, look up, fetch and remove through one adapter
async fn presence_lifecycle(backend: &str) -> Result<()> {
    let engines = RegistryEngines::default()
        .with_kv(Arc::new(MemoryKvEngine::new()))
        .with_tree(Arc::new(MemoryTreeEngine::new()));
    let (adapter, _) = adapter(backend, &engines).await?;
    assert_eq!(adapter.kind(), BackendKind::from_name(backend)?);

    assert!(adapter.lookup("lodash").await?.is_empty());

    adapter
        .publish("lodash", "10.0.0.1:7007", b"one".to_vec(), LIVENESS)
        .await?;
    adapter
        .publish("lodash", "10.0.0.2:7007", b"two".to_vec(), LIVENESS)
        .await?;
    // Publishing the same presence again is not an error
    adapter
        .publish("lodash", "10.0.0.2:7007", b"two".to_vec(), LIVENESS)
        .await?;
    adapter
        .publish("math", "10.0.0.1:7007", b"other".to_vec(), LIVENESS)
        .await?;

    let mut keys = adapter.lookup("lodash").await?;
    keys.sort();
    assert_eq!(keys.len(), 2);
    let decoded: Vec<String> = keys
        .iter()
        .map(|key| adapter.decode_key(key).map(|k| k.provider_id))
        .collect::<Option<_>>()
        .unwrap_or_default();
    assert_eq!(decoded, vec!["10.0.0.1:7007", "10.0.0.2:7007"]);
    assert!(keys
        .iter()
        .all(|key| adapter.decode_key(key).map(|k| k.alias) == Some("lodash".into())));

    let values = adapter.fetch_values(&keys).await?;
    assert_eq!(values, vec![Some(b"one".to_vec()), Some(b"two".to_vec())]);

    adapter.remove("lodash", "10.0.0.1:7007").await?;
    // Removing twice is fine
    adapter.remove("lodash", "10.0.0.1:7007").await?;
    let keys = adapter.lookup("lodash").await?;
    assert_eq!(keys.len(), 1);
    assert_eq!(adapter.fetch_values(&[keys[0].clone()]).await?, vec![Some(b"two".to_vec())]);
    assert_eq!(adapter.lookup("math").await?.len(), 1);

    adapter.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_flat_ttl_presence_lifecycle() -> Result<()> {
    presence_lifecycle("flat-ttl").await
}

#[tokio::test]
async fn test_hierarchical_presence_lifecycle() -> Result<()> {
    presence_lifecycle("hierarchical").await
}

#[tokio::test(start_paused = true)]
async fn test_flat_ttl_presence_expires_without_republish() -> Result<()> {
    let engines = RegistryEngines::default().with_kv(Arc::new(MemoryKvEngine::new()));
    let (adapter, _) = adapter("flat-ttl", &engines).await?;

    adapter
        .publish("lodash", "10.0.0.1:7007", b"one".to_vec(), Duration::from_secs(5))
        .await?;
    tokio::time::advance(Duration::from_secs(3)).await;
    // Re-affirming extends the liveness
    adapter
        .publish("lodash", "10.0.0.1:7007", b"one".to_vec(), Duration::from_secs(5))
        .await?;
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(adapter.lookup("lodash").await?.len(), 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(adapter.lookup("lodash").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_flat_ttl_subscription_survives_store_outage() -> Result<()> {
    let kv = Arc::new(MemoryKvEngine::new());
    let engines = RegistryEngines::default().with_kv(kv.clone());
    let (adapter, events) = adapter("flat-ttl", &engines).await?;
    let mut event_rx = events.subscribe();

    let (listener, mut rx) = collecting_listener();
    adapter.subscribe("lodash", listener).await?;

    adapter
        .publish("lodash", "10.0.0.1:7007", b"one".to_vec(), LIVENESS)
        .await?;
    assert_eq!(
        next_keys(&mut rx).await,
        vec!["beacon/services/lodash/10.0.0.1:7007"]
    );

    kv.set_offline(true);
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Err(e))) => assert_eq!(e.kind(), ErrorKind::RegistryUnavailable),
        other => panic!("expected a subscription error, got {other:?}"),
    }
    let mut reported = false;
    while let Ok(event) = event_rx.try_recv() {
        reported |= matches!(
            event,
            BeaconEvent::Error { kind: ErrorKind::RegistryUnavailable, .. }
        );
    }
    assert!(reported);

    kv.set_offline(false);
    assert!(
        wait_until(Duration::from_secs(2), || kv
            .subscriber_count("beacon/services/lodash")
            == 1)
        .await
    );
    adapter
        .publish("lodash", "10.0.0.2:7007", b"two".to_vec(), LIVENESS)
        .await?;
    assert_eq!(
        next_keys(&mut rx).await,
        vec!["beacon/services/lodash/10.0.0.2:7007"]
    );

    adapter.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_hierarchical_watch_reports_only_new_children() -> Result<()> {
    let tree = Arc::new(MemoryTreeEngine::new());
    let engines = RegistryEngines::default().with_tree(tree.clone());
    let (adapter, _) = adapter("hierarchical", &engines).await?;

    adapter
        .publish("lodash", "10.0.0.1:7007", b"one".to_vec(), LIVENESS)
        .await?;
    let (listener, mut rx) = collecting_listener();
    adapter.subscribe("lodash", listener).await?;

    adapter
        .publish("lodash", "10.0.0.2:7007", b"two".to_vec(), LIVENESS)
        .await?;
    assert_eq!(
        next_keys(&mut rx).await,
        vec!["/beacon/services/lodash/10.0.0.2:7007"]
    );

    // Removal re-arms the watch without a notification; the next arrival is
    // still seen.
    adapter.remove("lodash", "10.0.0.1:7007").await?;
    adapter
        .publish("lodash", "10.0.0.3:7007", b"three".to_vec(), LIVENESS)
        .await?;
    assert_eq!(
        next_keys(&mut rx).await,
        vec!["/beacon/services/lodash/10.0.0.3:7007"]
    );

    adapter.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_hierarchical_presence_is_restored_after_session_expiry() -> Result<()> {
    let tree = Arc::new(MemoryTreeEngine::new());
    let engines = RegistryEngines::default().with_tree(tree.clone());
    let (server_side, events) = adapter("hierarchical", &engines).await?;
    let (client_side, _) = adapter("hierarchical", &engines).await?;
    let mut event_rx = events.subscribe();

    server_side
        .publish("lodash", "10.0.0.1:7007", b"one".to_vec(), LIVENESS)
        .await?;
    let (listener, mut rx) = collecting_listener();
    client_side.subscribe("lodash", listener).await?;

    let path = "/beacon/services/lodash/10.0.0.1:7007";
    tree.expire_session();
    assert!(wait_until(Duration::from_secs(2), || tree.exists(path)).await);
    assert!(tree.exists("/beacon/services/lodash"));

    let mut expired = false;
    while let Ok(event) = event_rx.try_recv() {
        expired |= matches!(
            event,
            BeaconEvent::Error { kind: ErrorKind::RegistryUnavailable, .. }
        );
    }
    assert!(expired);

    // The watch was lost with the session and re-armed
    server_side
        .publish("lodash", "10.0.0.2:7007", b"two".to_vec(), LIVENESS)
        .await?;
    let mut arrived = Vec::new();
    while !arrived.contains(&"/beacon/services/lodash/10.0.0.2:7007".to_string()) {
        arrived.extend(next_keys(&mut rx).await);
    }

    server_side.shutdown().await;
    client_side.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_offline_tree_fails_connect() {
    let tree = Arc::new(MemoryTreeEngine::new());
    tree.set_offline(true);
    let engines = RegistryEngines::default().with_tree(tree);
    let err = adapter("hierarchical", &engines).await.err().unwrap();
    let err = err.downcast::<RpcError>().unwrap();
    assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);
}
