//! 应用生命周期
//!
//! 执行顺序：
//! 1. 初始化注册中心句柄（未启用或失败时为游离状态）
//! 2. 启动所有服务器
//! 3. 等待服务器端口就绪
//! 4. 注册本节点
//! 5. 等待关闭信号
//! 6. 注销本节点，逆序停止服务器

use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{error, info, warn};

use super::Server;
use super::config::RuntimeConfig;
use crate::config::Config;
use crate::registry::{NotifyBus, RegistryFactory, ServiceRegistry};
use crate::utils::wait_for_server_ready;

pub struct Application {
    config: Config,
    runtime: RuntimeConfig,
    factory: RegistryFactory,
    bus: NotifyBus,
    registry: Option<ServiceRegistry>,
    servers: Vec<Box<dyn Server>>,
}

impl Application {
    pub fn new(config: Config) -> Self {
        let bus = NotifyBus::new(&config.notify);
        Self {
            config,
            runtime: RuntimeConfig::default(),
            factory: RegistryFactory::with_defaults(),
            bus,
            registry: None,
            servers: Vec::new(),
        }
    }

    /// 替换注册中心后端工厂，需在 [`Application::init`] 之前调用
    pub fn with_factory(mut self, factory: RegistryFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_runtime_config(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_server(mut self, server: Box<dyn Server>) -> Self {
        info!(server = %server.name(), "Adding server to application");
        self.servers.push(server);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 初始化注册中心句柄，重复调用返回同一个句柄
    ///
    /// 服务器构造时需要句柄，因此在 `with_server` 之前调用
    pub async fn init(&mut self) -> ServiceRegistry {
        if let Some(registry) = &self.registry {
            return registry.clone();
        }
        let registry =
            ServiceRegistry::init(&self.config.registry, &self.factory, self.bus.clone()).await;
        self.registry = Some(registry.clone());
        registry
    }

    /// 运行直到 Ctrl+C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Shutdown signal received (Ctrl+C)");
        })
        .await
    }

    /// 运行直到 `shutdown` 完成
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let registry = self.init().await;
        info!(
            app = %self.config.app.name,
            servers = self.servers.len(),
            registry = registry.is_enabled(),
            "Starting application"
        );

        let mut started = 0;
        for server in &self.servers {
            if let Err(e) = server.start().await {
                error!(server = %server.name(), error = %e, "Failed to start server");
                self.stop_servers(started).await;
                return Err(e).with_context(|| format!("failed to start server {}", server.name()));
            }
            started += 1;
        }

        if let Err(e) = self.wait_for_servers_ready().await {
            self.stop_servers(started).await;
            return Err(e);
        }

        if registry.is_enabled() {
            if let Err(e) = registry.register().await {
                error!(error = %e, "Failed to register service");
                self.stop_servers(started).await;
                return Err(e).context("failed to register service");
            }
            if let Some(node) = registry.local_node() {
                info!(node = %node, "Service registered");
            }
        } else {
            info!("Registry not enabled, skipping registration");
        }

        shutdown.await;

        if let Err(e) = registry.deregister().await {
            warn!(error = %e, "Failed to deregister service");
        }
        self.stop_servers(started).await;
        info!(app = %self.config.app.name, "Application stopped");
        Ok(())
    }

    async fn wait_for_servers_ready(&self) -> Result<()> {
        if !self.runtime.enable_ready_check {
            return Ok(());
        }
        for server in &self.servers {
            let Some(addr) = server.local_addr() else {
                continue;
            };
            let addr = reachable(addr);
            tokio::time::timeout(self.runtime.ready_check_timeout, wait_for_server_ready(addr))
                .await
                .with_context(|| {
                    format!(
                        "server {} ready check timeout after {:?}",
                        server.name(),
                        self.runtime.ready_check_timeout
                    )
                })?
                .with_context(|| format!("server {} not ready", server.name()))?;
            info!(server = %server.name(), addr = %addr, "Server is ready");
        }
        Ok(())
    }

    /// 逆序停止前 `count` 个服务器
    async fn stop_servers(&self, count: usize) {
        for server in self.servers[..count].iter().rev() {
            match tokio::time::timeout(self.runtime.shutdown_timeout, server.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(server = %server.name(), error = %e, "Server stopped with error"),
                Err(_) => warn!(server = %server.name(), "Server stop timeout"),
            }
        }
    }
}

/// 监听在通配地址上时改用回环地址检查
fn reachable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}
