//! 服务与节点定义

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// 所有服务节点在协调存储中的公共前缀
pub const SERVICE_PREFIX: &str = "/servers/";

/// 一个正在运行的服务实例
///
/// 创建后不可变，重新注册时整体替换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// 节点 ID（地址的稳定哈希）
    pub id: String,
    pub service_name: String,
    /// 协调存储中的 key：`<prefix><service>/<id>`
    pub path: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub info: HashMap<String, String>,
}

impl Node {
    /// 创建新节点，`id` 与 `path` 由地址推导
    pub fn new(service_name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        let service_name = service_name.into();
        let ip = ip.into();
        let id = node_id(&ip, port);
        let path = node_key(&service_name, &id);
        Self {
            id,
            service_name,
            path,
            ip,
            port,
            info: HashMap::new(),
        }
    }

    /// 添加附加信息
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    /// `ip:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// 转换为 HTTP URL
    pub fn to_http_url(&self) -> String {
        format!("http://{}", self.addr())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}:{} in {}", self.id, self.ip, self.port, self.path)
    }
}

/// 一个逻辑服务及其节点
///
/// 节点顺序即扫描/插入顺序，选择时按集合对待
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// 计算节点 ID：`ip:port` 的 SHA-256 取前 16 字节的十六进制
pub fn node_id(ip: &str, port: u16) -> String {
    let digest = Sha256::digest(format!("{}:{}", ip, port).as_bytes());
    hex::encode(&digest[..16])
}

/// 拼接节点 key
pub fn node_key(service_name: &str, node_id: &str) -> String {
    format!("{}{}/{}", SERVICE_PREFIX, service_name, node_id)
}

/// 从 key 中解析 `(服务名, 节点 ID)`
///
/// 服务名取前缀之后、最后一个 `/` 之前的部分，因此允许服务名内含 `/`
pub fn parse_node_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(SERVICE_PREFIX)?;
    let idx = rest.rfind('/')?;
    let (service, id) = (&rest[..idx], &rest[idx + 1..]);
    if service.is_empty() || id.is_empty() {
        return None;
    }
    Some((service, id))
}
