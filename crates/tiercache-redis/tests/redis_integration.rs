//! Integration tests against a real Redis started with testcontainers.

use std::time::Duration;

use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tiercache_core::{BusTransport, CacheDriver, InvalidationMessage, TransportEvent};
use tiercache_redis::{RedisBus, RedisDriver, RedisDriverConfig};
use tokio::sync::OnceCell;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let port = container.get_host_port_ipv4(6379).await.expect("get port");
            (container, format!("redis://127.0.0.1:{port}"))
        })
        .await;
    url.clone()
}

async fn driver(prefix: &str) -> RedisDriver {
    let config = RedisDriverConfig::new(redis_url().await).with_prefix(prefix);
    RedisDriver::connect(&config).await.expect("connect")
}

#[tokio::test]
async fn set_get_and_ttl() {
    let driver = driver("it-basic").await;

    driver
        .set("k", "v".into(), Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(driver.get("k").await.unwrap().as_deref(), Some("v"));
    assert!(driver.has("k").await.unwrap());

    let ttl = driver.remaining_ttl("k").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(30));
    assert!(ttl > Duration::from_secs(20));

    driver.set("forever", "v".into(), None).await.unwrap();
    assert_eq!(driver.remaining_ttl("forever").await.unwrap(), None);
    assert_eq!(driver.remaining_ttl("missing").await.unwrap(), None);
}

#[tokio::test]
async fn short_ttl_expires() {
    let driver = driver("it-expiry").await;
    driver
        .set("k", "v".into(), Some(Duration::from_millis(100)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(driver.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn pull_and_delete() {
    let driver = driver("it-pull").await;
    driver.set("k", "v".into(), None).await.unwrap();

    assert_eq!(driver.pull("k").await.unwrap().as_deref(), Some("v"));
    assert_eq!(driver.pull("k").await.unwrap(), None);

    driver.set("a", "1".into(), None).await.unwrap();
    driver.set("b", "2".into(), None).await.unwrap();
    assert!(driver.delete("a").await.unwrap());
    assert!(!driver.delete("a").await.unwrap());
    driver.delete_many(&["b".to_string()]).await.unwrap();
    assert!(!driver.has("b").await.unwrap());
}

#[tokio::test]
async fn clear_only_touches_own_namespace() {
    let root = driver("it-clear").await;
    let users = root.namespace("users");
    let posts = root.namespace("posts");

    users.set("1", "alice".into(), None).await.unwrap();
    users.set("2", "bob".into(), None).await.unwrap();
    posts.set("1", "hello".into(), None).await.unwrap();

    users.clear().await.unwrap();

    assert!(!users.has("1").await.unwrap());
    assert!(!users.has("2").await.unwrap());
    assert!(posts.has("1").await.unwrap());
    assert_eq!(root.get("posts:1").await.unwrap().as_deref(), Some("hello"));
}

#[tokio::test]
async fn bus_delivers_between_instances() {
    let url = redis_url().await;
    let config = RedisDriverConfig::new(url.clone());
    let a = RedisBus::new(config.create_pool().unwrap(), url.clone());
    let b = RedisBus::new(config.create_pool().unwrap(), url);

    let mut rx = b.subscribe("tiercache:it").await.unwrap();

    // The subscription is established in the background; publish until it lands.
    let message = InvalidationMessage::delete(vec!["k".into()], Some("users".into()), "node-a");
    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            a.publish("tiercache:it", &message).await.unwrap();
            if let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
            {
                return event;
            }
        }
    })
    .await
    .expect("message delivered");

    assert_eq!(received, TransportEvent::Message(message));

    a.disconnect().await.unwrap();
    b.disconnect().await.unwrap();
}
