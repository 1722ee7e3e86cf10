//! 服务注册发现 Trait 定义

use async_trait::async_trait;

use super::node::{Node, Service};
use crate::error::Result;

/// 服务注册发现 Trait
///
/// 查询只读本地快照，不访问协调存储
#[async_trait]
pub trait Registry: Send + Sync {
    /// 注册本节点并启动后台维护任务，重复调用无副作用
    async fn register(&self) -> Result<()>;

    /// 停止后台任务并尽力删除本节点
    async fn deregister(&self) -> Result<()>;

    /// 获取服务及其节点
    ///
    /// 快照未就绪返回 `Unavailable`，服务不存在返回 `NotFound`
    async fn get_service(&self, name: &str) -> Result<Service>;

    /// 列出所有服务名
    async fn list_services(&self) -> Result<Vec<String>>;

    /// 本节点信息
    fn local_node(&self) -> &Node;
}
