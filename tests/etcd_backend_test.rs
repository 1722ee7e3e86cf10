//! etcd 后端集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test etcd_backend_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

use flare_mesh_core::config::RegistryConfig;
use flare_mesh_core::registry::{NotifyBus, RegistryFactory, ServiceRegistry, node_key};
use flare_mesh_core::store::{CoordinationStore, EtcdStore, EventType};
use futures::StreamExt;
use tokio::time::{Duration, sleep, timeout};

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> String {
    std::env::var("ETCD_ENDPOINTS").unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
}

fn create_test_config(service_name: &str, port: u16) -> RegistryConfig {
    RegistryConfig {
        backend: "etcd".to_string(),
        host: etcd_endpoints(),
        ip: Some("127.0.0.1".to_string()),
        service_name: service_name.to_string(),
        enable: true,
        port,
        ..RegistryConfig::default()
    }
}

#[tokio::test]
#[ignore]
async fn test_etcd_store_lease_and_watch() {
    let store = EtcdStore::connect(&create_test_config("etcd-store-test", 0))
        .await
        .expect("Failed to connect to etcd");

    let prefix = "/servers/etcd-store-test/";
    let mut events = store.watch(prefix).await.unwrap();

    let lease = store.lease_grant(10).await.unwrap();
    let key = node_key("etcd-store-test", "node-1");
    store.put(&key, b"{}".to_vec(), Some(lease)).await.unwrap();
    store.lease_keep_alive_once(lease).await.unwrap();

    let scanned = store.get_prefix(prefix).await.unwrap();
    assert!(scanned.iter().any(|kv| kv.key == key));

    let batch = timeout(Duration::from_secs(5), events.next())
        .await
        .expect("watch timeout")
        .expect("watch closed")
        .unwrap();
    assert!(batch.iter().any(|e| e.event_type == EventType::Put && e.key == key));

    store.delete(&key).await.unwrap();
    assert!(store.get_prefix(prefix).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_etcd_registry_register_and_discover() {
    let factory = RegistryFactory::with_defaults();
    let bus = NotifyBus::default();

    let provider = ServiceRegistry::init(
        &create_test_config("etcd-registry-test", 19001),
        &factory,
        bus.clone(),
    )
    .await;
    assert!(provider.is_enabled(), "etcd registry not initialized");
    provider.register().await.unwrap();

    let mut found = false;
    for _ in 0..50 {
        if let Ok(service) = provider.get_service("etcd-registry-test").await {
            assert_eq!(service.nodes[0].addr(), "127.0.0.1:19001");
            found = true;
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }
    assert!(found, "service not discovered");

    provider.deregister().await.unwrap();
}
