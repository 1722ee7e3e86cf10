//! 进程内协调存储
//!
//! 单进程开发与测试使用，语义上模拟 etcd：租约过期删除绑定的 key，
//! 前缀订阅收到 PUT/DELETE 事件。另外提供故障注入开关。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{CoordinationStore, KeyValue, WatchEvent, WatchStream};
use crate::error::{MeshError, Result};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    kvs: BTreeMap<String, (Vec<u8>, Option<i64>)>,
    /// 租约 ID -> 绑定的 key
    leases: HashMap<i64, HashSet<String>>,
}

/// 内存协调存储
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<WatchEvent>,
    next_lease: Arc<AtomicI64>,
    available: Arc<AtomicBool>,
    fail_keepalive: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
            next_lease: Arc::new(AtomicI64::new(1)),
            available: Arc::new(AtomicBool::new(true)),
            fail_keepalive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 模拟存储整体不可达
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 只让续约失败，其余调用照常
    pub fn set_fail_keepalive(&self, fail: bool) {
        self.fail_keepalive.store(fail, Ordering::SeqCst);
    }

    /// 模拟租约过期：删除租约及其绑定的 key，并发布 DELETE 事件
    pub async fn expire_lease(&self, lease: i64) {
        let mut state = self.state.lock().await;
        let Some(keys) = state.leases.remove(&lease) else {
            return;
        };
        for key in keys {
            if state.kvs.remove(&key).is_some() {
                let _ = self.events.send(WatchEvent::delete(key));
            }
        }
        debug!(lease_id = lease, "Lease expired");
    }

    /// 当前有效的租约数量
    pub async fn lease_count(&self) -> usize {
        self.state.lock().await.leases.len()
    }

    /// 读取单个 key（测试辅助）
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().await.kvs.get(key).map(|(v, _)| v.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MeshError::unavailable("coordination store unreachable"))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(id) = lease {
            let keys = state
                .leases
                .get_mut(&id)
                .ok_or_else(|| MeshError::not_found(format!("lease {:x} not found", id)))?;
            keys.insert(key.to_string());
        }
        if let Some((_, Some(old))) = state.kvs.insert(key.to_string(), (value.clone(), lease)) {
            if lease != Some(old) {
                if let Some(keys) = state.leases.get_mut(&old) {
                    keys.remove(key);
                }
            }
        }
        let _ = self.events.send(WatchEvent::put(key, value));
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some((_, lease)) = state.kvs.remove(key) {
            if let Some(keys) = lease.and_then(|id| state.leases.get_mut(&id)) {
                keys.remove(key);
            }
            let _ = self.events.send(WatchEvent::delete(key));
        }
        Ok(())
    }

    async fn lease_grant(&self, _ttl_secs: i64) -> Result<i64> {
        self.check_available()?;
        let id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        self.state.lock().await.leases.insert(id, HashSet::new());
        Ok(id)
    }

    async fn lease_keep_alive_once(&self, lease: i64) -> Result<()> {
        self.check_available()?;
        if self.fail_keepalive.load(Ordering::SeqCst) {
            return Err(MeshError::unavailable("keep-alive rejected"));
        }
        if self.state.lock().await.leases.contains_key(&lease) {
            Ok(())
        } else {
            Err(MeshError::unavailable(format!("lease {:x} expired", lease)))
        }
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.check_available()?;
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            match item {
                Ok(event) if event.key.starts_with(&prefix) => Some(Ok(vec![event])),
                Ok(_) => None,
                Err(e) => Some(Err(MeshError::unavailable(format!("watch lagged: {}", e)))),
            }
        });
        Ok(Box::pin(stream))
    }
}
