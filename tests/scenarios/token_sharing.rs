//! Token refresh coordination between replicas sharing one credential store.

use super::{CountingSource, config_for, gateway_with, init_tracing};
use market_gateway::{CredentialStore, Gateway, MemoryStore, RequestDescriptor};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_accepting(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rsp_cd": "00000"})))
        .mount(server)
        .await;
}

async fn replica<S: CredentialStore + 'static>(
    server: &MockServer,
    store: &Arc<S>,
    source: &Arc<CountingSource>,
) -> Arc<Gateway> {
    Arc::new(
        Gateway::builder(config_for(server))
            .with_store(Arc::clone(store))
            .with_token_source(Arc::clone(source))
            .build_and_init()
            .await
            .expect("replica should build"),
    )
}

async fn hammer(replicas: &[Arc<Gateway>], calls_per_replica: usize) {
    let mut tasks = JoinSet::new();
    for gateway in replicas {
        for _ in 0..calls_per_replica {
            let gateway = Arc::clone(gateway);
            tasks.spawn(async move {
                gateway
                    .request(&RequestDescriptor::new("t1102", "/stock/market-data", json!({})))
                    .await
            });
        }
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_replicas_share_one_refresh() {
    init_tracing();
    let server = MockServer::start().await;
    mount_accepting(&server, "token-1").await;

    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(CountingSource::with_delay(Duration::from_millis(300)));
    let replicas = vec![
        replica(&server, &store, &source).await,
        replica(&server, &store, &source).await,
        replica(&server, &store, &source).await,
    ];

    hammer(&replicas, 4).await;

    assert_eq!(source.calls(), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 12);
    assert!(store.get("lock:integration").await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalidate_forces_next_refresh() {
    let server = MockServer::start().await;
    mount_accepting(&server, "token-1").await;
    mount_accepting(&server, "token-2").await;

    let source = Arc::new(CountingSource::default());
    let gateway = gateway_with(config_for(&server), &source).await;
    let descriptor = RequestDescriptor::new("t1102", "/stock/market-data", json!({}));

    gateway.request(&descriptor).await.unwrap();
    gateway.request(&descriptor).await.unwrap();
    assert_eq!(source.calls(), 1);

    gateway.token_manager().invalidate().await.unwrap();
    gateway.request(&descriptor).await.unwrap();
    assert_eq!(source.calls(), 2);

    let cached = gateway.token_manager().cached_token().await.unwrap().unwrap();
    assert_eq!(cached.value, "token-2");
}

#[cfg(feature = "sqlite-store")]
#[tokio::test]
async fn test_sqlite_replicas_share_one_refresh() {
    use market_gateway::storage::SqliteStore;

    let db_path = format!("/tmp/market_gateway_replicas_{}.db", std::process::id());
    for suffix in ["", "-wal", "-shm"] {
        std::fs::remove_file(format!("{db_path}{suffix}")).ok();
    }

    let server = MockServer::start().await;
    mount_accepting(&server, "token-1").await;
    let source = Arc::new(CountingSource::with_delay(Duration::from_millis(300)));

    // One store handle per replica, as separate processes would have
    let first = Arc::new(SqliteStore::new(&db_path).unwrap());
    let second = Arc::new(SqliteStore::new(&db_path).unwrap());
    let replicas = vec![
        replica(&server, &first, &source).await,
        replica(&server, &second, &source).await,
    ];

    hammer(&replicas, 3).await;
    assert_eq!(source.calls(), 1);

    drop(replicas);
    for suffix in ["", "-wal", "-shm"] {
        std::fs::remove_file(format!("{db_path}{suffix}")).ok();
    }
}

#[cfg(feature = "redis-store")]
#[tokio::test]
async fn test_redis_replicas_share_one_refresh() {
    use market_gateway::storage::RedisStore;

    let prefix = format!("market_gateway_it_{}", std::process::id());
    let Ok(first) = RedisStore::new("redis://localhost:6379", &prefix) else {
        return;
    };
    if first.init().await.is_err() {
        println!("Skipping Redis scenario - no Redis server available");
        return;
    }
    let second = RedisStore::new("redis://localhost:6379", &prefix).unwrap();
    let _ = first.delete("token:integration").await;

    let server = MockServer::start().await;
    mount_accepting(&server, "token-1").await;
    let source = Arc::new(CountingSource::with_delay(Duration::from_millis(300)));

    let first = Arc::new(first);
    let replicas = vec![
        replica(&server, &first, &source).await,
        replica(&server, &Arc::new(second), &source).await,
    ];

    hammer(&replicas, 3).await;
    assert_eq!(source.calls(), 1);
    let _ = first.delete("token:integration").await;
}
