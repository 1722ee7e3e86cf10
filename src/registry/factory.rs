//! 注册中心后端工厂
//!
//! 后端名称到异步构造器的显式映射，由应用启动时组装，不依赖全局状态。

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::lease::LeaseRegistry;
use super::trait_def::Registry;
use super::watcher::NotifyBus;
use crate::config::RegistryConfig;
use crate::error::{MeshError, Result};
use crate::store::{EtcdStore, MemoryStore};

type Constructor =
    Arc<dyn Fn(RegistryConfig, NotifyBus) -> BoxFuture<'static, Result<Arc<dyn Registry>>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct RegistryFactory {
    constructors: HashMap<String, Constructor>,
}

impl RegistryFactory {
    /// 空工厂
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置 `etcd` 与 `memory` 两个后端
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("etcd", |config, bus| async move {
            let store = EtcdStore::connect(&config).await?;
            let registry: Arc<dyn Registry> =
                Arc::new(LeaseRegistry::from_config(Arc::new(store), &config, bus));
            Ok(registry)
        });
        factory.register("memory", |config, bus| async move {
            let registry: Arc<dyn Registry> = Arc::new(LeaseRegistry::from_config(
                Arc::new(MemoryStore::new()),
                &config,
                bus,
            ));
            Ok(registry)
        });
        factory
    }

    /// 注册后端构造器，同名覆盖
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(RegistryConfig, NotifyBus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Registry>>> + Send + 'static,
    {
        let constructor: Constructor = Arc::new(move |config, bus| Box::pin(constructor(config, bus)));
        self.constructors.insert(name.into(), constructor);
    }

    /// 已注册的后端名称
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按配置中的 `backend` 构造注册中心
    pub async fn create(&self, config: &RegistryConfig, bus: NotifyBus) -> Result<Arc<dyn Registry>> {
        let constructor = self.constructors.get(&config.backend).ok_or_else(|| {
            MeshError::config(format!("unknown registry backend: {}", config.backend))
        })?;
        constructor(config.clone(), bus).await
    }
}
