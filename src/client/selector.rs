//! 轮询选择器
//!
//! 选择器在每次拓扑变更通知后重建，重建时沿用同一个计数器，
//! 第一个选择器的计数器从随机位置开始。

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::registry::{Node, ServiceRegistry};

/// 轮询计数器
///
/// 克隆后共享同一个计数
#[derive(Debug, Clone)]
pub struct RoundRobin {
    counter: Arc<AtomicUsize>,
}

impl RoundRobin {
    /// 从随机位置开始
    pub fn new() -> Self {
        Self::starting_at(rand::random::<u32>() as usize)
    }

    pub fn starting_at(start: usize) -> Self {
        Self {
            counter: Arc::new(AtomicUsize::new(start)),
        }
    }

    /// 选出 `items[counter % len]` 并递增计数器
    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        items.get(index % items.len())
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

/// 按服务名从注册中心取节点的轮询选择器
pub struct RoundRobinSelector {
    registry: ServiceRegistry,
    round_robin: RoundRobin,
}

impl RoundRobinSelector {
    pub fn new(registry: ServiceRegistry, round_robin: RoundRobin) -> Self {
        Self {
            registry,
            round_robin,
        }
    }

    /// 选择下一个节点
    pub async fn next(&self, service_name: &str) -> Result<Node> {
        let service = self
            .registry
            .get_service(service_name)
            .await
            .map_err(|e| MeshError::unavailable(format!("service no exist: {}", e)))?;
        self.round_robin
            .pick(&service.nodes)
            .cloned()
            .ok_or_else(|| MeshError::unavailable("no available nodes"))
    }
}

/// 当前选择器的槽位
///
/// 收到第一次通知之前为空
#[derive(Clone)]
pub struct SelectorSlot {
    registry: ServiceRegistry,
    round_robin: RoundRobin,
    current: Arc<ArcSwapOption<RoundRobinSelector>>,
}

impl SelectorSlot {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self::with_round_robin(registry, RoundRobin::new())
    }

    pub fn with_round_robin(registry: ServiceRegistry, round_robin: RoundRobin) -> Self {
        Self {
            registry,
            round_robin,
            current: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// 创建槽位并订阅注册中心的变更通知
    pub fn watch(registry: ServiceRegistry) -> (Self, JoinHandle<()>) {
        let slot = Self::new(registry.clone());
        let handle = slot.spawn_rebuild(registry.subscribe());
        (slot, handle)
    }

    /// 重建选择器，计数器沿用
    pub fn rebuild(&self) {
        let selector = RoundRobinSelector::new(self.registry.clone(), self.round_robin.clone());
        self.current.store(Some(Arc::new(selector)));
    }

    pub fn current(&self) -> Option<Arc<RoundRobinSelector>> {
        self.current.load_full()
    }

    /// 每收到一次通知重建一次，通道关闭后退出
    pub fn spawn_rebuild(&self, mut rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let slot = self.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                slot.rebuild();
                debug!("Selector rebuilt");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LeaseRegistry, LeaseSettings, NotifyBus, Registry};
    use crate::store::{CoordinationStore, MemoryStore};
    use std::collections::HashMap;

    #[test]
    fn test_round_robin_is_fair_and_cyclic() {
        let items = vec!["a", "b", "c"];
        let rr = RoundRobin::starting_at(7);
        let picks: Vec<&str> = (0..9).map(|_| *rr.pick(&items).unwrap()).collect();
        assert_eq!(picks, vec!["b", "c", "a", "b", "c", "a", "b", "c", "a"]);

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for _ in 0..100 {
            *counts.entry(*rr.pick(&items).unwrap()).or_default() += 1;
        }
        assert!(counts.values().all(|&c| c >= 100 / 3));
    }

    #[test]
    fn test_round_robin_empty() {
        let rr = RoundRobin::new();
        assert!(rr.pick::<u8>(&[]).is_none());
    }

    #[test]
    fn test_clones_share_counter() {
        let items = vec![1, 2];
        let rr = RoundRobin::starting_at(0);
        let other = rr.clone();
        assert_eq!(rr.pick(&items), Some(&1));
        assert_eq!(other.pick(&items), Some(&2));
    }

    async fn warm_registry(store: &MemoryStore) -> ServiceRegistry {
        let bus = NotifyBus::default();
        let backend = LeaseRegistry::new(
            Arc::new(store.clone()),
            Node::new("svc-a", "10.0.0.1", 9001),
            LeaseSettings::default(),
            bus.clone(),
        );
        let other = Node::new("svc-a", "10.0.0.2", 9001);
        store
            .put(&other.path, serde_json::to_vec(&other).unwrap(), None)
            .await
            .unwrap();
        backend.tick().await.unwrap();
        assert_eq!(backend.get_service("svc-a").await.unwrap().nodes.len(), 2);
        ServiceRegistry::with_backend(Arc::new(backend), bus)
    }

    #[tokio::test]
    async fn test_slot_empty_until_rebuilt() {
        let store = MemoryStore::new();
        let registry = warm_registry(&store).await;
        let slot = SelectorSlot::with_round_robin(registry, RoundRobin::starting_at(0));
        assert!(slot.current().is_none());

        slot.rebuild();
        let selector = slot.current().unwrap();
        let first = selector.next("svc-a").await.unwrap();
        let second = selector.next("svc-a").await.unwrap();
        assert_ne!(first.id, second.id);

        assert!(matches!(
            selector.next("svc-x").await,
            Err(MeshError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_counter() {
        let store = MemoryStore::new();
        let registry = warm_registry(&store).await;
        let slot = SelectorSlot::with_round_robin(registry, RoundRobin::starting_at(0));

        slot.rebuild();
        let first = slot.current().unwrap().next("svc-a").await.unwrap();
        slot.rebuild();
        let second = slot.current().unwrap().next("svc-a").await.unwrap();
        assert_ne!(first.id, second.id);
    }
}
