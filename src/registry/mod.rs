//! 服务注册发现模块
//!
//! - [`Registry`]：后端 trait，默认实现为基于租约的 [`LeaseRegistry`]
//! - [`RegistryFactory`]：后端名称到构造器的映射
//! - [`NotifyBus`]：拓扑变更信号
//! - [`ServiceRegistry`]：进程内共享的注册中心句柄

pub mod factory;
pub mod lease;
pub mod node;
pub mod topology;
pub mod trait_def;
pub mod watcher;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::RegistryConfig;
use crate::error::{MeshError, Result};

pub use factory::RegistryFactory;
pub use lease::{LeaseRegistry, LeaseSettings};
pub use node::{Node, SERVICE_PREFIX, Service, node_id, node_key, parse_node_key};
pub use topology::Topology;
pub use trait_def::Registry;
pub use watcher::NotifyBus;

/// 注册中心句柄
///
/// 克隆成本低，由应用启动时创建后传给负载均衡器和网关。
/// 未启用或初始化失败时为"游离"状态：查询一律返回 `Unavailable`，
/// 通知总线仍可正常订阅。
#[derive(Clone)]
pub struct ServiceRegistry {
    backend: Option<Arc<dyn Registry>>,
    bus: NotifyBus,
}

impl ServiceRegistry {
    /// 按配置初始化并注册本节点
    ///
    /// 构造或注册失败只记录日志，进程继续以游离状态运行
    pub async fn init(config: &RegistryConfig, factory: &RegistryFactory, bus: NotifyBus) -> Self {
        if !config.enable {
            info!("Registry disabled");
            return Self::detached(bus);
        }

        let backend = match factory.create(config, bus.clone()).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(backend = %config.backend, error = %e, "Failed to initialize registry");
                return Self::detached(bus);
            }
        };
        if let Err(e) = backend.register().await {
            error!(backend = %config.backend, error = %e, "Failed to register node");
            return Self::detached(bus);
        }

        info!(backend = %config.backend, node = %backend.local_node(), "Registry initialized");
        Self::with_backend(backend, bus)
    }

    pub fn with_backend(backend: Arc<dyn Registry>, bus: NotifyBus) -> Self {
        Self {
            backend: Some(backend),
            bus,
        }
    }

    pub fn detached(bus: NotifyBus) -> Self {
        Self { backend: None, bus }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&Arc<dyn Registry>> {
        self.backend
            .as_ref()
            .ok_or_else(|| MeshError::unavailable("service registry not ready"))
    }

    pub async fn register(&self) -> Result<()> {
        self.backend()?.register().await
    }

    /// 游离状态下直接返回成功
    pub async fn deregister(&self) -> Result<()> {
        match &self.backend {
            Some(backend) => backend.deregister().await,
            None => Ok(()),
        }
    }

    pub async fn get_service(&self, name: &str) -> Result<Service> {
        self.backend()?.get_service(name).await
    }

    pub async fn list_services(&self) -> Result<Vec<String>> {
        self.backend()?.list_services().await
    }

    pub fn local_node(&self) -> Option<&Node> {
        self.backend.as_ref().map(|b| b.local_node())
    }

    /// 注册通知接收端
    pub fn add_watcher(&self, watcher: mpsc::Sender<()>) {
        self.bus.add_watcher(watcher);
    }

    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        self.bus.subscribe()
    }

    /// 主动推送一次变更信号
    pub async fn notify_watchers(&self) {
        self.bus.notify().await;
    }

    pub fn bus(&self) -> &NotifyBus {
        &self.bus
    }
}
