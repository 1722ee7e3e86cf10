//! 微服务运行时
//!
//! [`Application`] 统一管理服务生命周期：初始化注册中心、启动服务器、
//! 就绪后注册本节点、等待关闭信号、注销、停止服务器。
//!
//! ```rust,no_run
//! use flare_mesh_core::config::Config;
//! use flare_mesh_core::gateway::GatewayServer;
//! use flare_mesh_core::runtime::Application;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load_from_file("config.toml")?;
//! let mut app = Application::new(config.clone());
//! let registry = app.init().await;
//! let gateway = GatewayServer::new(registry, config.gateway.clone(), "0.0.0.0:8080".parse()?)
//!     .with_default_interceptors();
//! app.with_server(Box::new(gateway)).run().await
//! # }
//! ```

pub mod application;
pub mod config;

pub use application::Application;
pub use config::RuntimeConfig;

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::Result;

/// 由运行时托管的服务器
#[async_trait]
pub trait Server: Send + Sync {
    fn name(&self) -> &str;

    /// 启动后实际监听的地址，用于就绪检查
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// 开始服务，返回前完成绑定，服务循环在后台运行
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}
