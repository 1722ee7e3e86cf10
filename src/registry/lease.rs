//! 基于租约的注册中心后端
//!
//! 本节点以带租约的 key 写入协调存储，后台循环按固定节拍完成：
//!
//! 1. 未持有租约时申请租约并写入节点，失败则退避后重试
//! 2. 快照为空或超过同步间隔时全量扫描重建快照
//! 3. 续约一次，连续失败达到上限后放弃租约并清空快照
//!
//! 另一个循环订阅前缀变更，把 PUT/DELETE 事件增量应用到快照。
//! 查询只读快照，快照为空期间返回 `Unavailable`。

use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::node::{Node, SERVICE_PREFIX, Service};
use super::topology::Topology;
use super::trait_def::Registry;
use super::watcher::NotifyBus;
use crate::config::RegistryConfig;
use crate::error::{MeshError, Result};
use crate::store::{CoordinationStore, EventType, WatchEvent};
use crate::utils::local_ip;

/// 后台循环的时间参数
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// 维护循环节拍
    pub tick: Duration,
    /// 租约 TTL（秒）
    pub lease_ttl: i64,
    /// 注册失败后的退避
    pub retry_backoff: Duration,
    /// 快照全量同步间隔
    pub resync_interval: Duration,
    /// 连续续约失败上限
    pub max_keepalive_retry: u8,
    /// 单次存储调用超时
    pub call_timeout: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            lease_ttl: 10,
            retry_backoff: Duration::from_secs(5),
            resync_interval: Duration::from_secs(60),
            max_keepalive_retry: 3,
            call_timeout: Duration::from_secs(3),
        }
    }
}

impl LeaseSettings {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct LeaseState {
    lease_id: Option<i64>,
    keepalive_failures: u8,
    last_sync: Option<Instant>,
}

struct Inner<S> {
    store: Arc<S>,
    node: Node,
    settings: LeaseSettings,
    bus: NotifyBus,
    snapshot: RwLock<Option<Topology>>,
    state: Mutex<LeaseState>,
    cancel: CancellationToken,
    started: AtomicBool,
}

/// 基于租约的注册中心
///
/// 克隆后共享同一份状态
pub struct LeaseRegistry<S: CoordinationStore> {
    inner: Arc<Inner<S>>,
}

impl<S: CoordinationStore> Clone for LeaseRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: CoordinationStore> LeaseRegistry<S> {
    pub fn new(store: Arc<S>, node: Node, settings: LeaseSettings, bus: NotifyBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                node,
                settings,
                bus,
                snapshot: RwLock::new(None),
                state: Mutex::new(LeaseState::default()),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// 按配置构造本节点：地址优先取配置，否则自动探测
    pub fn from_config(store: Arc<S>, config: &RegistryConfig, bus: NotifyBus) -> Self {
        let ip = config
            .ip
            .clone()
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| local_ip().to_string());
        let node = Node::new(config.service_name.clone(), ip, config.port);
        Self::new(store, node, LeaseSettings::from_config(config), bus)
    }

    /// 执行一轮维护：注册、同步、续约
    ///
    /// 只有注册失败返回错误，调用方应退避后再试
    pub async fn tick(&self) -> Result<()> {
        self.inner.tick().await
    }

    /// 把一批变更事件应用到快照
    pub async fn apply_events(&self, events: &[WatchEvent]) {
        self.inner.apply_events(events).await
    }

    /// 当前持有的租约
    pub async fn lease_id(&self) -> Option<i64> {
        self.inner.state.lock().await.lease_id
    }

    /// 当前连续续约失败次数
    pub async fn keepalive_failures(&self) -> u8 {
        self.inner.state.lock().await.keepalive_failures
    }

    pub async fn is_synced(&self) -> bool {
        self.inner.snapshot.read().await.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// 下一轮维护是否会全量同步
    pub async fn needs_resync(&self) -> bool {
        self.inner.needs_resync().await
    }
}

impl<S: CoordinationStore> Inner<S> {
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        timeout(self.settings.call_timeout, fut)
            .await
            .map_err(|_| MeshError::unavailable("coordination store call timed out"))?
    }

    fn ensure_running(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MeshError::unavailable("registry already deregistered"));
        }
        Ok(())
    }

    async fn tick(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let holds_lease = self.state.lock().await.lease_id.is_some();
        if !holds_lease {
            self.register_node().await?;
        }

        // 同步失败保留旧快照，下一轮重试
        if self.needs_resync().await {
            if let Err(e) = self.resync().await {
                error!(error = %e, "Failed to sync services, keeping last snapshot");
            }
        }

        self.keep_alive().await;
        Ok(())
    }

    async fn register_node(&self) -> Result<()> {
        let lease_id = self
            .call(self.store.lease_grant(self.settings.lease_ttl))
            .await?;
        self.ensure_running()?;

        let value = serde_json::to_vec(&self.node)?;
        self.call(self.store.put(&self.node.path, value, Some(lease_id)))
            .await?;
        if let Err(e) = self.ensure_running() {
            // 注销与写入交错，撤回刚写入的节点
            if let Err(err) = self.call(self.store.delete(&self.node.path)).await {
                warn!(node = %self.node, error = %err, "Failed to delete node after deregister");
            }
            return Err(e);
        }

        let mut state = self.state.lock().await;
        state.lease_id = Some(lease_id);
        state.keepalive_failures = 0;
        info!(node = %self.node, lease_id = %format!("{:x}", lease_id), "Register success");
        Ok(())
    }

    async fn needs_resync(&self) -> bool {
        if self.snapshot.read().await.is_none() {
            return true;
        }
        match self.state.lock().await.last_sync {
            Some(at) => at.elapsed() >= self.settings.resync_interval,
            None => true,
        }
    }

    async fn resync(&self) -> Result<()> {
        let kvs = self.call(self.store.get_prefix(SERVICE_PREFIX)).await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let topology = Topology::from_scan(kvs.iter().map(|kv| (kv.key.as_str(), kv.value.as_slice())));
        let services = topology.len();

        *self.snapshot.write().await = Some(topology);
        self.state.lock().await.last_sync = Some(Instant::now());
        debug!(services, "Services synced");

        self.bus.notify().await;
        Ok(())
    }

    async fn keep_alive(&self) {
        let Some(lease_id) = self.state.lock().await.lease_id else {
            return;
        };

        let result = self.call(self.store.lease_keep_alive_once(lease_id)).await;
        if self.cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(()) => {
                self.state.lock().await.keepalive_failures = 0;
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.keepalive_failures += 1;
                warn!(
                    lease_id = %format!("{:x}", lease_id),
                    failures = state.keepalive_failures,
                    error = %e,
                    "Keep alive failed"
                );
                if state.keepalive_failures >= self.settings.max_keepalive_retry {
                    state.lease_id = None;
                    state.keepalive_failures = 0;
                    drop(state);
                    *self.snapshot.write().await = None;
                    info!("Release all services cache");
                }
            }
        }
    }

    async fn apply_events(&self, events: &[WatchEvent]) {
        for event in events {
            let changed = {
                let mut snapshot = self.snapshot.write().await;
                let Some(topology) = snapshot.as_mut() else {
                    debug!(key = %event.key, "Snapshot not ready, event ignored");
                    continue;
                };
                match event.event_type {
                    EventType::Put => topology.apply_put(&event.key, &event.value),
                    EventType::Delete => topology.apply_delete(&event.key),
                }
            };

            if changed {
                debug!(key = %event.key, event = ?event.event_type, "Topology changed");
                self.bus.notify().await;
            }
        }
    }

    async fn run_keepalive_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.settings.tick) => {}
            }

            if let Err(e) = self.tick().await {
                error!(node = %self.node, error = %e, "Register failed");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = sleep(self.settings.retry_backoff) => {}
                }
            }
        }
        info!("Keep alive loop stopped");
    }

    async fn run_watch_loop(self: Arc<Self>) {
        loop {
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break,
                stream = self.store.watch(SERVICE_PREFIX) => stream,
            };

            match stream {
                Ok(mut stream) => loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            info!("Watcher canceled");
                            return;
                        }
                        next = stream.next() => match next {
                            Some(Ok(events)) => self.apply_events(&events).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "Watch stream error, re-establishing");
                                break;
                            }
                            None => {
                                warn!("Watch stream closed, re-establishing");
                                break;
                            }
                        },
                    }
                },
                Err(e) => warn!(error = %e, "Failed to watch services"),
            }

            // 断流期间的事件已丢失，重建后强制全量同步
            self.state.lock().await.last_sync = None;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.settings.retry_backoff) => {}
            }
        }
        info!("Watcher canceled");
    }
}

#[async_trait]
impl<S: CoordinationStore> Registry for LeaseRegistry<S> {
    async fn register(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(MeshError::unavailable("registry already deregistered"));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tokio::spawn(self.inner.clone().run_keepalive_loop());
        tokio::spawn(self.inner.clone().run_watch_loop());
        info!(node = %self.inner.node, "Registry loops started");
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel.cancel();

        if let Err(e) = inner.call(inner.store.delete(&inner.node.path)).await {
            warn!(node = %inner.node, error = %e, "Failed to delete node on deregister");
        }

        *inner.state.lock().await = LeaseState::default();
        *inner.snapshot.write().await = None;
        info!(node = %inner.node, "Deregistered");

        inner.bus.notify().await;
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        let snapshot = self.inner.snapshot.read().await;
        let topology = snapshot
            .as_ref()
            .ok_or_else(|| MeshError::unavailable("service registry not ready"))?;
        topology
            .get(name)
            .cloned()
            .ok_or_else(|| MeshError::not_found(format!("service {} not found", name)))
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let snapshot = self.inner.snapshot.read().await;
        snapshot
            .as_ref()
            .map(Topology::names)
            .ok_or_else(|| MeshError::unavailable("service registry not ready"))
    }

    fn local_node(&self) -> &Node {
        &self.inner.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValue, MemoryStore, WatchStream};

    fn registry(store: &MemoryStore, port: u16) -> LeaseRegistry<MemoryStore> {
        registry_with(store, port, LeaseSettings::default(), NotifyBus::default())
    }

    fn registry_with(
        store: &MemoryStore,
        port: u16,
        settings: LeaseSettings,
        bus: NotifyBus,
    ) -> LeaseRegistry<MemoryStore> {
        let node = Node::new("svc-a", "127.0.0.1", port);
        LeaseRegistry::new(Arc::new(store.clone()), node, settings, bus)
    }

    /// 申请租约后停顿一段时间的存储，用于制造注销与注册交错
    struct SlowGrantStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl CoordinationStore for SlowGrantStore {
        async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<()> {
            self.inner.put(key, value, lease).await
        }

        async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
            self.inner.get_prefix(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn lease_grant(&self, ttl_secs: i64) -> Result<i64> {
            let lease = self.inner.lease_grant(ttl_secs).await?;
            sleep(self.delay).await;
            Ok(lease)
        }

        async fn lease_keep_alive_once(&self, lease: i64) -> Result<()> {
            self.inner.lease_keep_alive_once(lease).await
        }

        async fn watch(&self, prefix: &str) -> Result<WatchStream> {
            self.inner.watch(prefix).await
        }
    }

    #[tokio::test]
    async fn test_tick_registers_and_syncs() {
        let store = MemoryStore::new();
        let registry = registry(&store, 9001);

        assert!(matches!(
            registry.get_service("svc-a").await,
            Err(MeshError::Unavailable(_))
        ));

        registry.tick().await.unwrap();

        assert!(registry.lease_id().await.is_some());
        let service = registry.get_service("svc-a").await.unwrap();
        assert_eq!(service.nodes, vec![registry.local_node().clone()]);
        assert_eq!(registry.list_services().await.unwrap(), vec!["svc-a".to_string()]);
        assert!(matches!(
            registry.get_service("svc-x").await,
            Err(MeshError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registration_failure_is_reported() {
        let store = MemoryStore::new();
        store.set_available(false);
        let registry = registry(&store, 9001);

        assert!(registry.tick().await.is_err());
        assert!(registry.lease_id().await.is_none());
        assert!(!registry.is_synced().await);
    }

    #[tokio::test]
    async fn test_keepalive_failures_invalidate_snapshot() {
        let store = MemoryStore::new();
        let registry = registry(&store, 9001);
        registry.tick().await.unwrap();

        store.set_fail_keepalive(true);
        registry.tick().await.unwrap();
        registry.tick().await.unwrap();
        assert_eq!(registry.keepalive_failures().await, 2);
        assert!(registry.get_service("svc-a").await.is_ok());

        registry.tick().await.unwrap();
        assert!(registry.lease_id().await.is_none());
        assert!(matches!(
            registry.get_service("svc-a").await,
            Err(MeshError::Unavailable(_))
        ));

        // 下一轮重新申请租约并同步
        registry.tick().await.unwrap();
        assert!(registry.lease_id().await.is_some());
        assert!(registry.get_service("svc-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_events_before_sync_are_ignored() {
        let store = MemoryStore::new();
        let registry = registry(&store, 9001);
        let other = Node::new("svc-b", "127.0.0.1", 9002);

        registry
            .apply_events(&[WatchEvent::put(other.path.clone(), serde_json::to_vec(&other).unwrap())])
            .await;
        assert!(!registry.is_synced().await);

        registry.tick().await.unwrap();
        registry
            .apply_events(&[WatchEvent::put(other.path.clone(), serde_json::to_vec(&other).unwrap())])
            .await;
        assert_eq!(registry.get_service("svc-b").await.unwrap().nodes, vec![other.clone()]);

        registry.apply_events(&[WatchEvent::delete(other.path.clone())]).await;
        assert!(matches!(
            registry.get_service("svc-b").await,
            Err(MeshError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_change_notifies_bus() {
        let store = MemoryStore::new();
        let bus = NotifyBus::default();
        let mut rx = bus.subscribe();
        let registry = LeaseRegistry::new(
            Arc::new(store.clone()),
            Node::new("svc-a", "127.0.0.1", 9001),
            LeaseSettings::default(),
            bus,
        );

        registry.tick().await.unwrap();
        assert_eq!(rx.try_recv(), Ok(()));

        // 未变化的删除不发通知
        registry.apply_events(&[WatchEvent::delete("/servers/svc-x/none")]).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deregister_removes_node() {
        let store = MemoryStore::new();
        let registry = registry(&store, 9001);
        registry.tick().await.unwrap();
        let path = registry.local_node().path.clone();
        assert!(store.get(&path).await.is_some());

        registry.deregister().await.unwrap();

        assert!(store.get(&path).await.is_none());
        assert!(registry.is_cancelled());
        assert!(registry.register().await.is_err());
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_snapshot() {
        let store = MemoryStore::new();
        let settings = LeaseSettings {
            resync_interval: Duration::ZERO,
            ..LeaseSettings::default()
        };
        let registry = registry_with(&store, 9001, settings, NotifyBus::default());
        registry.tick().await.unwrap();
        assert!(registry.needs_resync().await);

        // 存储不可用：同步与续约都失败，但续约未到上限，快照保持可读
        store.set_available(false);
        registry.tick().await.unwrap();
        assert_eq!(registry.keepalive_failures().await, 1);
        assert!(registry.is_synced().await);
        assert_eq!(registry.get_service("svc-a").await.unwrap().nodes.len(), 1);
        assert_eq!(registry.list_services().await.unwrap(), vec!["svc-a".to_string()]);

        store.set_available(true);
        registry.tick().await.unwrap();
        assert_eq!(registry.keepalive_failures().await, 0);
        assert!(registry.get_service("svc-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_deregister_notifies_bus() {
        let store = MemoryStore::new();
        let bus = NotifyBus::default();
        let mut rx = bus.subscribe();
        let registry = registry_with(&store, 9001, LeaseSettings::default(), bus);
        registry.tick().await.unwrap();
        assert_eq!(rx.try_recv(), Ok(()));

        registry.deregister().await.unwrap();
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(matches!(
            registry.get_service("svc-a").await,
            Err(MeshError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_gap_forces_resync() {
        let store = MemoryStore::new();
        let settings = LeaseSettings {
            tick: Duration::from_secs(3600),
            retry_backoff: Duration::from_secs(3600),
            ..LeaseSettings::default()
        };
        let registry = registry_with(&store, 9001, settings, NotifyBus::default());
        registry.tick().await.unwrap();
        registry.register().await.unwrap();
        // 让监听循环完成订阅
        sleep(Duration::from_millis(20)).await;
        assert!(!registry.needs_resync().await);

        // 监听循环来不及消费，广播缓冲溢出，svc-b 的事件被挤掉
        let other = Node::new("svc-b", "127.0.0.1", 9002);
        tokio::task::unconstrained(async {
            store
                .put(&other.path, serde_json::to_vec(&other).unwrap(), None)
                .await
                .unwrap();
            for i in 0..1100 {
                store.put(&format!("/flood/{}", i), Vec::new(), None).await.unwrap();
            }
        })
        .await;

        let mut stale = false;
        for _ in 0..100 {
            if registry.needs_resync().await {
                stale = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(stale);

        registry.tick().await.unwrap();
        assert!(!registry.needs_resync().await);
        assert_eq!(registry.get_service("svc-b").await.unwrap().nodes, vec![other]);

        registry.deregister().await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_after_deregister_is_noop() {
        let store = MemoryStore::new();
        let registry = registry(&store, 9001);
        registry.deregister().await.unwrap();

        registry.tick().await.unwrap();
        assert!(registry.lease_id().await.is_none());
        assert!(!registry.is_synced().await);
        assert!(store.get(&registry.local_node().path).await.is_none());
    }

    #[tokio::test]
    async fn test_deregister_during_registration_leaves_no_node() {
        let store = MemoryStore::new();
        let registry = LeaseRegistry::new(
            Arc::new(SlowGrantStore {
                inner: store.clone(),
                delay: Duration::from_millis(100),
            }),
            Node::new("svc-a", "127.0.0.1", 9001),
            LeaseSettings::default(),
            NotifyBus::default(),
        );
        let path = registry.local_node().path.clone();

        let ticking = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.tick().await })
        };
        // 注册卡在申请租约之后
        sleep(Duration::from_millis(20)).await;
        registry.deregister().await.unwrap();

        assert!(ticking.await.unwrap().is_err());
        assert!(registry.lease_id().await.is_none());
        assert!(!registry.is_synced().await);
        assert!(store.get(&path).await.is_none());
    }
}
