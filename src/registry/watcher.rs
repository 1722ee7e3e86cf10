//! 拓扑变更通知总线
//!
//! 通道里不携带任何数据，只表示"拓扑变了"，消费者收到后必须重新拉取完整状态。
//!
//! # 投递策略
//!
//! - [`NotifyPolicy::Block`]：队列满时通知方等待，信号不会丢失。
//!   代价是如果某个消费者停止消费，通知方（注册中心的后台循环）会被卡住，
//!   这是一个活性风险，消费者必须保证持续消费。
//! - [`NotifyPolicy::Coalesce`]：队列满时直接丢弃本次信号。由于信号没有负载，
//!   队列中已经存在的未消费信号足以让消费者重新拉取，语义上不丢失变更。

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::config::{NotifyConfig, NotifyPolicy};

/// 进程内的通知总线
///
/// 克隆后共享同一组订阅者
#[derive(Clone)]
pub struct NotifyBus {
    watchers: Arc<Mutex<Vec<mpsc::Sender<()>>>>,
    capacity: usize,
    policy: NotifyPolicy,
}

impl NotifyBus {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            watchers: Arc::new(Mutex::new(Vec::new())),
            capacity: config.capacity.max(1),
            policy: config.policy,
        }
    }

    pub fn policy(&self) -> NotifyPolicy {
        self.policy
    }

    /// 注册一个通知接收端（启动阶段调用一次）
    pub fn add_watcher(&self, watcher: mpsc::Sender<()>) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.push(watcher);
        }
    }

    /// 创建一个按配置容量的通道并注册
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.add_watcher(tx);
        rx
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// 向所有订阅者推送一次信号
    ///
    /// 接收端已关闭的订阅者会被移除
    pub async fn notify(&self) {
        let watchers: Vec<mpsc::Sender<()>> = match self.watchers.lock() {
            Ok(watchers) => watchers.clone(),
            Err(_) => return,
        };

        let mut closed = false;
        for watcher in &watchers {
            match self.policy {
                NotifyPolicy::Block => {
                    if watcher.send(()).await.is_err() {
                        closed = true;
                    }
                }
                NotifyPolicy::Coalesce => match watcher.try_send(()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!("Watcher inbox full, signal coalesced");
                    }
                    Err(TrySendError::Closed(_)) => closed = true,
                },
            }
        }

        if closed {
            if let Ok(mut watchers) = self.watchers.lock() {
                let before = watchers.len();
                watchers.retain(|w| !w.is_closed());
                warn!(removed = before - watchers.len(), "Dropped closed topology watchers");
            }
        }
    }
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new(&NotifyConfig::default())
    }
}
