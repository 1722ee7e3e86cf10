//! 客户端负载均衡模块
//!
//! 两种调用方式共用同一个轮询算法：
//! - [`LbHttpClient`]：`lb://<服务名>` 地址，每个请求选一个节点
//! - [`RpcResolverBuilder`]：`lb:///<服务名>` 目标，推送全部节点给 tonic 通道

pub mod rest;
pub mod rpc;
pub mod selector;

pub use rest::{ApiClient, LB_SCHEME, LbHttpClient};
pub use rpc::{LB_RPC_SCHEME, RpcResolver, RpcResolverBuilder};
pub use selector::{RoundRobin, RoundRobinSelector, SelectorSlot};
