//! 协调存储抽象
//!
//! 注册中心后端只通过这里的窄接口访问强一致的 KV 存储：
//! 租约、带租约的写入、前缀扫描、删除以及前缀变更订阅。

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// 前缀扫描返回的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// 变更事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// 一条变更事件，DELETE 事件的 `value` 为空
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub key: String,
    pub value: Vec<u8>,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            event_type: EventType::Put,
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// 变更流，每个元素是一批事件
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

/// 协调存储 trait
///
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// 写入 key，`lease` 不为空时与租约绑定，租约过期后 key 自动删除
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<()>;

    /// 前缀扫描
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// 申请租约，返回租约 ID
    async fn lease_grant(&self, ttl_secs: i64) -> Result<i64>;

    /// 续约一次
    async fn lease_keep_alive_once(&self, lease: i64) -> Result<()>;

    /// 订阅前缀下的变更
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
}
