//! 网关服务器
//!
//! 持有后端连接池、拦截器链和类型化适配器，把它们组合成一个 axum 路由。

use async_trait::async_trait;
use axum::Router;
use axum::extract::Request;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::dispatch::Dispatcher;
use super::endpoint::{EndpointAdapter, endpoint_key};
use super::interceptor::{
    AuthInterceptor, Handler, Interceptor, InterceptorChain, LogInterceptor, RecoverInterceptor,
    RouteMatchInterceptor,
};
use super::pool::BackendPool;
use crate::config::GatewayConfig;
use crate::error::{MeshError, Result};
use crate::registry::ServiceRegistry;
use crate::runtime::Server;
use crate::utils::local_ip;

pub struct GatewayServer {
    config: GatewayConfig,
    registry: ServiceRegistry,
    pool: Arc<BackendPool>,
    chain: InterceptorChain,
    endpoints: HashMap<String, Arc<dyn EndpointAdapter>>,
    addr: SocketAddr,
    cancel: CancellationToken,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl GatewayServer {
    /// 创建网关，拓扑通知在 `start`/`serve` 时才订阅
    pub fn new(registry: ServiceRegistry, config: GatewayConfig, addr: SocketAddr) -> Self {
        Self {
            config,
            pool: Arc::new(BackendPool::new(registry.clone())),
            registry,
            chain: InterceptorChain::new(),
            endpoints: HashMap::new(),
            addr,
            cancel: CancellationToken::new(),
            sync_task: Mutex::new(None),
            serve_task: Mutex::new(None),
            local_addr: OnceLock::new(),
        }
    }

    pub fn add_interceptor(mut self, priority: i32, interceptor: impl Interceptor + 'static) -> Self {
        self.chain.add(priority, Arc::new(interceptor));
        self
    }

    /// 恢复、日志、路由匹配、鉴权四个内置拦截器
    pub fn with_default_interceptors(self) -> Self {
        let routes = self.config.routes.clone();
        let white_list = self.config.white_list.clone();
        self.add_interceptor(-10, RecoverInterceptor)
            .add_interceptor(-9, LogInterceptor)
            .add_interceptor(1, RouteMatchInterceptor::new(routes))
            .add_interceptor(3, AuthInterceptor::new(white_list))
    }

    /// 注册类型化适配器，同键后注册的覆盖先注册的
    pub fn add_endpoint(mut self, adapter: impl EndpointAdapter + 'static) -> Self {
        let key = endpoint_key(&adapter);
        info!(key = %key, "Endpoint adapter registered");
        self.endpoints.insert(key, Arc::new(adapter));
        self
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// 组合后的处理器：拦截器链包裹分发器
    pub fn handler(&self) -> Handler {
        let dispatcher = Dispatcher::new(
            self.pool.clone(),
            Arc::new(self.endpoints.clone()),
            self.config.request_timeout(),
            local_ip().to_string(),
        );
        self.chain.build(dispatcher.into_handler())
    }

    pub fn router(&self) -> Router {
        let handler = self.handler();
        Router::new().fallback(move |req: Request| {
            let handler = handler.clone();
            async move { handler(req).await }
        })
    }

    /// 对账一次并启动通知驱动的同步任务，已在运行时不重复启动
    ///
    /// 订阅与消费同时建立，不存在无人消费的收件箱
    async fn ensure_sync(&self) {
        let mut sync_task = self.sync_task.lock().await;
        if sync_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let updates = self.registry.subscribe();
        self.pool.sync().await;
        *sync_task = Some(self.pool.spawn_sync(updates));
    }

    async fn stop_sync(&self) {
        // 同步任务在通道关闭前不会退出，直接终止
        if let Some(task) = self.sync_task.lock().await.take() {
            task.abort();
        }
    }

    /// 在给定监听器上运行直到 `shutdown` 完成，期间后端池随拓扑通知更新
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ensure_sync().await;
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;
        self.stop_sync().await;
        served?;
        Ok(())
    }
}

#[async_trait]
impl Server for GatewayServer {
    fn name(&self) -> &str {
        "gateway"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        self.ensure_sync().await;

        let router = self.router();
        let cancel = self.cancel.clone();
        *self.serve_task.lock().await = Some(tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "Gateway server exited with error");
            }
        }));

        info!(
            addr = %local_addr,
            routes = self.config.routes.len(),
            interceptors = ?self.chain.execution_order(),
            "Gateway server started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.stop_sync().await;
        if let Some(task) = self.serve_task.lock().await.take() {
            task.await
                .map_err(|e| MeshError::internal(format!("gateway task failed: {}", e)))?;
        }
        info!("Gateway server stopped");
        Ok(())
    }
}
