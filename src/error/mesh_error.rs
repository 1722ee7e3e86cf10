//! 统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// 服务发现、负载均衡与网关共用的错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// 注册中心未就绪，或者服务没有任何可用节点
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// 服务名从未出现过
    #[error("not found: {0}")]
    NotFound(String),

    /// 客户端解析或转发失败
    #[error("remote call error: {0}")]
    RemoteCall(String),

    /// 网关路由或分发失败
    #[error("gateway error [{code}]: {message}")]
    Gateway { code: i32, message: String },

    /// 缺少必要配置
    #[error("config error: {0}")]
    Config(String),

    /// 序列化或后端的意外失败
    #[error("internal error: {0}")]
    Internal(String),

    /// 传输层状态（RPC 调用返回的 status）
    #[error("rpc status [{code}]: {message}")]
    Rpc { code: i32, message: String },
}

impl MeshError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        MeshError::Unavailable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        MeshError::NotFound(msg.into())
    }

    pub fn remote_call(msg: impl Into<String>) -> Self {
        MeshError::RemoteCall(msg.into())
    }

    /// 创建网关错误，错误码为 [`ErrorCode::Gateway`]
    pub fn gateway(msg: impl Into<String>) -> Self {
        MeshError::Gateway {
            code: ErrorCode::Gateway.as_i32(),
            message: msg.into(),
        }
    }

    /// 创建带自定义错误码的网关错误（例如认证拦截器使用的 `NoToken`）
    pub fn gateway_with_code(code: ErrorCode, msg: impl Into<String>) -> Self {
        MeshError::Gateway {
            code: code.as_i32(),
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        MeshError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MeshError::Internal(msg.into())
    }

    /// 获取对外暴露的数字错误码
    pub fn code(&self) -> i32 {
        match self {
            MeshError::Unavailable(_) | MeshError::NotFound(_) => ErrorCode::Registry.as_i32(),
            MeshError::RemoteCall(_) => ErrorCode::RemoteCall.as_i32(),
            MeshError::Gateway { code, .. } => *code,
            MeshError::Config(_) => ErrorCode::Config.as_i32(),
            MeshError::Internal(_) => ErrorCode::Common.as_i32(),
            MeshError::Rpc { code, .. } => *code,
        }
    }

    /// 获取错误原因（不带分类前缀）
    pub fn reason(&self) -> &str {
        match self {
            MeshError::Unavailable(msg)
            | MeshError::NotFound(msg)
            | MeshError::RemoteCall(msg)
            | MeshError::Config(msg)
            | MeshError::Internal(msg) => msg,
            MeshError::Gateway { message, .. } | MeshError::Rpc { message, .. } => message,
        }
    }

    /// 是否携带传输层状态码
    pub fn is_rpc_status(&self) -> bool {
        matches!(self, MeshError::Rpc { .. })
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        ErrorCode::from_i32(self.code())
            .map(|code| code.is_retryable())
            .unwrap_or(false)
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, MeshError>;
