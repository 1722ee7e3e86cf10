//! 后端连接池
//!
//! 每个注册节点对应一个 [`BackendClient`]。收到拓扑通知后与注册中心对账：
//! 以 `(地址, 服务名)` 为键移除已下线的客户端，为新出现的创建客户端，
//! 然后基于池快照重建按服务名过滤的轮询选择器。

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::RoundRobin;
use crate::error::{MeshError, Result};
use crate::registry::ServiceRegistry;
use crate::utils::diff;

/// 指向单个后端节点的客户端
#[derive(Debug, Clone)]
pub struct BackendClient {
    addr: String,
    service_name: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(addr: impl Into<String>, service_name: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            addr: addr.into(),
            service_name: service_name.into(),
            http,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// 拼出指向本节点的 URL，`path_and_query` 以 `/` 开头
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// 某一时刻的池快照及其轮询计数
struct PoolSelector {
    clients: Vec<Arc<BackendClient>>,
    round_robin: RoundRobin,
}

impl PoolSelector {
    fn select(&self, service_name: &str) -> Option<Arc<BackendClient>> {
        let candidates: Vec<&Arc<BackendClient>> = self
            .clients
            .iter()
            .filter(|c| c.service_name == service_name)
            .collect();
        self.round_robin.pick(&candidates).map(|c| (*c).clone())
    }
}

pub struct BackendPool {
    registry: ServiceRegistry,
    http: reqwest::Client,
    clients: RwLock<Vec<Arc<BackendClient>>>,
    selector: ArcSwapOption<PoolSelector>,
    round_robin: RoundRobin,
}

impl BackendPool {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self::with_http(registry, reqwest::Client::new())
    }

    pub fn with_http(registry: ServiceRegistry, http: reqwest::Client) -> Self {
        Self {
            registry,
            http,
            clients: RwLock::new(Vec::new()),
            selector: ArcSwapOption::empty(),
            round_robin: RoundRobin::new(),
        }
    }

    /// 注册中心当前的 `地址 -> 服务名`，不可用时为空
    async fn targets(&self) -> Vec<(String, String)> {
        let names = match self.registry.list_services().await {
            Ok(names) => names,
            Err(e) => {
                debug!(error = %e, "Registry not ready, pool emptied");
                return Vec::new();
            }
        };

        let mut targets = Vec::new();
        for name in names {
            match self.registry.get_service(&name).await {
                Ok(service) => {
                    targets.extend(service.nodes.iter().map(|n| (n.addr(), name.clone())));
                }
                Err(e) => debug!(service = %name, error = %e, "Skip service during pool sync"),
            }
        }
        targets
    }

    /// 与注册中心对账并重建选择器
    pub async fn sync(&self) {
        let next = self.targets().await;

        let snapshot = {
            let mut clients = self.clients.write().await;
            let current: Vec<(String, String)> = clients
                .iter()
                .map(|c| (c.addr.clone(), c.service_name.clone()))
                .collect();
            let (added, removed) = diff(&current, &next);

            clients.retain(|c| {
                !removed
                    .iter()
                    .any(|(addr, name)| *addr == c.addr && *name == c.service_name)
            });
            for (addr, service_name) in &added {
                clients.push(Arc::new(BackendClient::new(
                    addr.clone(),
                    service_name.clone(),
                    self.http.clone(),
                )));
            }

            if !added.is_empty() || !removed.is_empty() {
                info!(added = ?added, removed = ?removed, total = clients.len(), "Backend pool updated");
            }
            clients.clone()
        };

        self.selector.store(Some(Arc::new(PoolSelector {
            clients: snapshot,
            round_robin: self.round_robin.clone(),
        })));
    }

    /// 按服务名轮询选择一个后端
    pub fn select(&self, service_name: &str) -> Result<Arc<BackendClient>> {
        let guard = self.selector.load();
        let selector = Option::as_ref(&*guard)
            .ok_or_else(|| MeshError::gateway("service registry not ready"))?;
        selector
            .select(service_name)
            .ok_or_else(|| MeshError::gateway("no available nodes"))
    }

    /// 当前池中的地址
    pub async fn addresses(&self) -> Vec<String> {
        self.clients.read().await.iter().map(|c| c.addr.clone()).collect()
    }

    /// 每收到一次通知对账一次，通道关闭后退出
    pub fn spawn_sync(self: &Arc<Self>, mut rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                pool.sync().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LeaseRegistry, LeaseSettings, Node, NotifyBus};
    use crate::store::{CoordinationStore, MemoryStore, WatchEvent};

    async fn setup() -> (MemoryStore, LeaseRegistry<MemoryStore>, ServiceRegistry) {
        let store = MemoryStore::new();
        let bus = NotifyBus::default();
        let backend = LeaseRegistry::new(
            Arc::new(store.clone()),
            Node::new("svc-a", "10.0.0.1", 9001),
            LeaseSettings::default(),
            bus.clone(),
        );
        let b1 = Node::new("svc-b", "10.0.0.2", 9002);
        store.put(&b1.path, serde_json::to_vec(&b1).unwrap(), None).await.unwrap();
        backend.tick().await.unwrap();
        let registry = ServiceRegistry::with_backend(Arc::new(backend.clone()), bus);
        (store, backend, registry)
    }

    #[tokio::test]
    async fn test_select_before_sync_fails() {
        let pool = BackendPool::new(ServiceRegistry::detached(NotifyBus::default()));
        let err = pool.select("svc-a").unwrap_err();
        assert_eq!(err.code(), 505);
        assert_eq!(err.reason(), "service registry not ready");
    }

    #[tokio::test]
    async fn test_sync_builds_clients_per_node() {
        let (_store, _backend, registry) = setup().await;
        let pool = BackendPool::new(registry);
        pool.sync().await;

        let mut addrs = pool.addresses().await;
        addrs.sort();
        assert_eq!(addrs, vec!["10.0.0.1:9001".to_string(), "10.0.0.2:9002".to_string()]);

        let a = pool.select("svc-a").unwrap();
        assert_eq!(a.addr(), "10.0.0.1:9001");
        assert_eq!(a.url("/ping"), "http://10.0.0.1:9001/ping");
        assert_eq!(pool.select("svc-b").unwrap().service_name(), "svc-b");
        assert_eq!(pool.select("svc-x").unwrap_err().reason(), "no available nodes");
    }

    #[tokio::test]
    async fn test_sync_removes_departed_nodes() {
        let (_store, backend, registry) = setup().await;
        let pool = BackendPool::new(registry);
        pool.sync().await;

        let b1 = Node::new("svc-b", "10.0.0.2", 9002);
        backend.apply_events(&[WatchEvent::delete(b1.path.clone())]).await;
        pool.sync().await;

        assert_eq!(pool.addresses().await, vec!["10.0.0.1:9001".to_string()]);
        assert!(pool.select("svc-b").is_err());
    }

    /// 轮询直到池中地址满足条件，最多等待 2 秒
    async fn wait_for_addresses(pool: &BackendPool, check: impl Fn(&[String]) -> bool) -> bool {
        for _ in 0..200 {
            if check(&pool.addresses().await) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_unavailable_registry_empties_pool() {
        let (_store, backend, registry) = setup().await;
        let pool = Arc::new(BackendPool::new(registry.clone()));
        pool.sync().await;
        assert_eq!(pool.addresses().await.len(), 2);

        // 只依赖通知驱动的对账
        let task = pool.spawn_sync(registry.subscribe());
        crate::registry::Registry::deregister(&backend).await.unwrap();

        assert!(wait_for_addresses(&pool, |addrs| addrs.is_empty()).await);
        assert_eq!(pool.select("svc-a").unwrap_err().reason(), "no available nodes");
        task.abort();
    }

    #[tokio::test]
    async fn test_address_moving_to_another_service() {
        let (_store, backend, registry) = setup().await;
        let pool = BackendPool::new(registry);
        pool.sync().await;

        // 同一地址下线 svc-b 后以 svc-c 身份上线
        let b1 = Node::new("svc-b", "10.0.0.2", 9002);
        let c1 = Node::new("svc-c", "10.0.0.2", 9002);
        backend
            .apply_events(&[
                WatchEvent::delete(b1.path.clone()),
                WatchEvent::put(c1.path.clone(), serde_json::to_vec(&c1).unwrap()),
            ])
            .await;
        pool.sync().await;

        assert_eq!(pool.select("svc-c").unwrap().addr(), "10.0.0.2:9002");
        assert_eq!(pool.select("svc-b").unwrap_err().reason(), "no available nodes");
        let mut addrs = pool.addresses().await;
        addrs.sort();
        assert_eq!(addrs, vec!["10.0.0.1:9001".to_string(), "10.0.0.2:9002".to_string()]);
    }
}
