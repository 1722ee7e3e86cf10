//! Flare Mesh Core Library
//!
//! Service registry, client-side load balancing and gateway routing for
//! microservices: instances register themselves in a coordination store,
//! discover each other through change notifications, and requests are routed
//! to a live, round-robin-selected instance.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod utils;

// 服务注册与协调存储
pub mod registry;
pub mod store;

// 客户端负载均衡与网关
pub mod client;
pub mod gateway;

// 应用生命周期
pub mod runtime;

// Re-exports
pub use config::{AppConfig, Config, GatewayConfig, NotifyConfig, NotifyPolicy, RegistryConfig, Route};
pub use error::{AppResult, ErrorCode, MeshError, Result};

pub use registry::{
    LeaseRegistry, LeaseSettings, Node, NotifyBus, Registry, RegistryFactory, SERVICE_PREFIX,
    Service, ServiceRegistry, Topology,
};
pub use store::{CoordinationStore, EtcdStore, EventType, KeyValue, MemoryStore, WatchEvent};

pub use client::{
    ApiClient, LB_RPC_SCHEME, LB_SCHEME, LbHttpClient, RoundRobin, RoundRobinSelector,
    RpcResolver, RpcResolverBuilder, SelectorSlot,
};
pub use gateway::{ApiResult, EndpointAdapter, GatewayServer, Interceptor, JsonEndpoint};

pub use runtime::{Application, RuntimeConfig, Server};
pub use telemetry::init_logging;
