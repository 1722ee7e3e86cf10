//! `lb` 方案的 gRPC 地址解析
//!
//! 与 HTTP 客户端每次只选一个节点不同，这里把服务的全部节点推给
//! tonic 的负载均衡通道，由传输层按调用挑选。
//!
//! 负载均衡通道只在发起调用时消费地址变更，因此变更先进入无界队列，
//! 由每个解析器独立的转发任务写入通道，推送方永不阻塞。

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::error::{MeshError, Result};
use crate::registry::ServiceRegistry;
use crate::utils::diff;

pub const LB_RPC_SCHEME: &str = "lb";

const BALANCE_CHANNEL_CAPACITY: usize = 64;

/// 单个目标服务的地址解析器
pub struct RpcResolver {
    service_name: String,
    registry: ServiceRegistry,
    changes: mpsc::UnboundedSender<Change<String, Endpoint>>,
    current: Mutex<Vec<String>>,
}

/// 把排队的变更写入负载均衡通道，通道关闭后退出
fn spawn_forwarder(
    service_name: String,
    mut queued: mpsc::UnboundedReceiver<Change<String, Endpoint>>,
    balance: mpsc::Sender<Change<String, Endpoint>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = queued.recv().await {
            if balance.send(change).await.is_err() {
                debug!(service = %service_name, "Balance channel closed, resolver stopped");
                break;
            }
        }
    })
}

impl RpcResolver {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// 服务的全部节点地址
    pub async fn addresses(&self) -> Result<Vec<String>> {
        let service = self.registry.get_service(&self.service_name).await?;
        if service.is_empty() {
            return Err(MeshError::unavailable("no available nodes"));
        }
        Ok(service.nodes.iter().map(|n| n.addr()).collect())
    }

    /// 已推送给通道的地址
    pub async fn current(&self) -> Vec<String> {
        self.current.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.changes.is_closed()
    }

    /// 重新推送完整地址列表，查询失败时推送空列表
    pub async fn notify(&self) {
        let next = match self.addresses().await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(service = %self.service_name, error = %e, "No resolvable addresses");
                Vec::new()
            }
        };

        // 入队不等待，持锁期间只保证多次推送的顺序与 current 一致
        let mut current = self.current.lock().await;
        let (added, removed) = diff(&current, &next);
        for addr in removed {
            if self.changes.send(Change::Remove(addr)).is_err() {
                return;
            }
        }
        for addr in added {
            match Endpoint::from_shared(format!("http://{}", addr)) {
                Ok(endpoint) => {
                    if self.changes.send(Change::Insert(addr, endpoint)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(addr = %addr, error = %e, "Skip invalid endpoint"),
            }
        }
        *current = next;
    }
}

/// 解析器构造器
///
/// 持有所有已创建的解析器，收到拓扑通知后逐个重新推送
#[derive(Clone)]
pub struct RpcResolverBuilder {
    registry: ServiceRegistry,
    resolvers: Arc<Mutex<Vec<Arc<RpcResolver>>>>,
}

impl RpcResolverBuilder {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            resolvers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 创建构造器并订阅注册中心通知
    pub fn watch(registry: ServiceRegistry) -> (Self, JoinHandle<()>) {
        let builder = Self::new(registry.clone());
        let handle = builder.spawn_notify(registry.subscribe());
        (builder, handle)
    }

    pub fn scheme(&self) -> &'static str {
        LB_RPC_SCHEME
    }

    /// 按 `lb:///<服务名>` 创建负载均衡通道，立即推送当前全部节点
    pub async fn build(&self, target: &str) -> Result<(Channel, Arc<RpcResolver>)> {
        let service_name = parse_target(target)?;
        let (channel, balance) = Channel::balance_channel::<String>(BALANCE_CHANNEL_CAPACITY);
        let (changes, queued) = mpsc::unbounded_channel();
        spawn_forwarder(service_name.to_string(), queued, balance);

        let resolver = Arc::new(RpcResolver {
            service_name: service_name.to_string(),
            registry: self.registry.clone(),
            changes,
            current: Mutex::new(Vec::new()),
        });
        resolver.notify().await;
        self.resolvers.lock().await.push(resolver.clone());

        info!(target, "RPC resolver built");
        Ok((channel, resolver))
    }

    /// 通知所有解析器，通道已关闭的解析器被移除
    pub async fn notify_all(&self) {
        let resolvers = {
            let mut resolvers = self.resolvers.lock().await;
            resolvers.retain(|r| !r.is_closed());
            resolvers.clone()
        };
        for resolver in resolvers {
            resolver.notify().await;
        }
    }

    pub fn spawn_notify(&self, mut rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let builder = self.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                builder.notify_all().await;
            }
        })
    }
}

fn parse_target(target: &str) -> Result<&str> {
    let service_name = target
        .strip_prefix(LB_RPC_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .map(|rest| rest.trim_start_matches('/'))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| MeshError::remote_call(format!("invalid rpc target: {}", target)))?;
    Ok(service_name)
}
