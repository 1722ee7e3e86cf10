use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub mode: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            addr: default_addr(),
            port: 0,
            mode: None,
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

/// 注册中心配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// 后端名称，对应 `RegistryFactory` 中注册的构造器
    #[serde(default = "default_backend")]
    pub backend: String,
    /// 协调存储地址，多个地址以逗号分隔
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 覆盖自动探测的本机地址
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub service_name: String,
    /// 预留字段，当前选择算法不使用
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub port: u16,
    /// 单次调用超时（秒）
    #[serde(default = "default_registry_timeout")]
    pub timeout: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            host: String::new(),
            user: None,
            password: None,
            ip: None,
            service_name: String::new(),
            weight: 0,
            enable: false,
            port: 0,
            timeout: default_registry_timeout(),
        }
    }
}

fn default_backend() -> String {
    "etcd".to_string()
}

fn default_registry_timeout() -> u64 {
    3
}

impl RegistryConfig {
    /// 解析协调存储地址列表
    pub fn endpoints(&self) -> Result<Vec<String>> {
        let endpoints: Vec<String> = self
            .host
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        if endpoints.is_empty() {
            return Err(MeshError::config("no registry servers address"));
        }
        Ok(endpoints)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }
}

/// 通知总线的投递策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    /// 队列满时等待消费者，信号不会丢失
    #[default]
    Block,
    /// 队列满时直接丢弃，队列里已有未消费的信号
    Coalesce,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub policy: NotifyPolicy,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            capacity: default_notify_capacity(),
            policy: NotifyPolicy::default(),
        }
    }
}

fn default_notify_capacity() -> usize {
    32
}

/// 网关路由
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Route {
    /// 目标服务名
    pub id: String,
    /// 匹配的路径前缀，例如 `/svc-a/`
    pub path: String,
    /// 后端协议：`reverse-proxy` / `typed-rpc`
    pub schema: String,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} : {} :// {}", self.id, self.schema, self.path)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// 转发超时（秒）
    #[serde(default = "default_gateway_timeout")]
    pub timeout: u64,
    #[serde(default, rename = "route")]
    pub routes: Vec<Route>,
    #[serde(default, rename = "white-list")]
    pub white_list: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: default_gateway_timeout(),
            routes: Vec::new(),
            white_list: Vec::new(),
        }
    }
}

fn default_gateway_timeout() -> u64 {
    30
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        // 注册信息默认继承应用自身的名称与端口
        if config.registry.service_name.is_empty() {
            config.registry.service_name = config.app.name.clone();
        }
        if config.registry.port == 0 {
            config.registry.port = config.app.port;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[app]
name = "gateway"
port = 8000

[registry]
host = "10.0.0.5:2379, 10.0.0.6:2379"
enable = true

[notify]
capacity = 8
policy = "coalesce"

[gateway]
timeout = 10
white-list = ["/server-api/login"]

[[gateway.route]]
id = "svc-a"
path = "/svc-a/"
schema = "reverse-proxy"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.app.addr, "0.0.0.0");
        assert_eq!(config.registry.backend, "etcd");
        assert_eq!(config.registry.service_name, "gateway");
        assert_eq!(config.registry.port, 8000);
        assert_eq!(config.registry.timeout, 3);
        assert_eq!(
            config.registry.endpoints().unwrap(),
            vec!["10.0.0.5:2379".to_string(), "10.0.0.6:2379".to_string()]
        );
        assert_eq!(config.notify.capacity, 8);
        assert_eq!(config.notify.policy, NotifyPolicy::Coalesce);
        assert_eq!(config.gateway.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.gateway.routes.len(), 1);
        assert_eq!(config.gateway.routes[0].schema, "reverse-proxy");
        assert_eq!(config.gateway.white_list, vec!["/server-api/login".to_string()]);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(!config.registry.enable);
        assert_eq!(config.gateway.timeout, 30);
        assert_eq!(config.notify.capacity, 32);
        assert_eq!(config.notify.policy, NotifyPolicy::Block);
    }

    #[test]
    fn test_empty_host_is_config_error() {
        let config = RegistryConfig::default();
        assert!(matches!(config.endpoints(), Err(MeshError::Config(_))));
    }
}
