//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up a Redis instance and are ignored by
//! default; run them with `--ignored` when Docker is available.

use calcflow_server::broker::{BrokerConnection, RedisTransport, RetryPolicy};
use calcflow_server::{CacheGateway, RedisConfig, create_cache_backend};
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

fn connection(url: &str) -> Arc<BrokerConnection> {
    Arc::new(BrokerConnection::new(
        Arc::new(RedisTransport::new(url, Duration::from_secs(2))),
        RetryPolicy::new(3, Duration::from_millis(100)),
        Duration::from_secs(1),
    ))
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn publish_reaches_subscriber() {
    let url = get_redis_url().await;
    let conn = connection(&url);
    conn.start().await.unwrap();

    let received: Arc<Mutex<Vec<Map<String, Value>>>> = Arc::default();
    let cancel = CancellationToken::new();
    let task = {
        let conn = conn.clone();
        let received = received.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            conn.subscribe("calcflow_test", cancel, move |m| received.lock().unwrap().push(m))
                .await
        })
    };

    // Give SUBSCRIBE time to register, then publish until delivered
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            conn.send("calcflow_test", &json!({"operation": "fibonacci"}))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !received.lock().unwrap().is_empty() {
                break;
            }
        }
    })
    .await
    .expect("message not delivered");

    assert_eq!(received.lock().unwrap()[0]["operation"], "fibonacci");

    cancel.cancel();
    task.await.unwrap().unwrap();
    conn.stop().await;
}

#[tokio::test]
async fn unreachable_broker_exhausts_retries() {
    let conn = connection("redis://127.0.0.1:1");
    let err = conn.start().await.unwrap_err();
    assert!(err.to_string().contains("3 attempt"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn redis_cache_round_trip() {
    let url = get_redis_url().await;
    let cache = create_cache_backend(&RedisConfig {
        enabled: true,
        url,
        pool_size: 4,
        timeout_ms: 2000,
    })
    .await;
    assert_eq!(cache.stats().mode, "redis");

    cache
        .set("factorial:5", "120", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(cache.get("factorial:5").await.unwrap().as_deref(), Some("120"));
    assert_eq!(cache.get("factorial:6").await.unwrap(), None);
}
