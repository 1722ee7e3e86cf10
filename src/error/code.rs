//! 错误代码定义
//!
//! 与框架对外暴露的错误码保持一致，网关的失败信封 `code` 字段即取自这里。
//! `0` 保留给成功结果。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 代码从 500 起连续编号：
/// - 500: 通用错误
/// - 501: 远程调用错误（客户端解析、转发失败）
/// - 502: 消息代理错误
/// - 503: 注册中心错误
/// - 504: 配置错误
/// - 505: 网关错误
/// - 506: 请求参数错误
/// - 507: 缺少令牌
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum ErrorCode {
    Common = 500,
    RemoteCall = 501,
    Broker = 502,
    Registry = 503,
    Config = 504,
    Gateway = 505,
    ReqParameter = 506,
    NoToken = 507,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// 从数字值创建错误代码
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            500 => Some(ErrorCode::Common),
            501 => Some(ErrorCode::RemoteCall),
            502 => Some(ErrorCode::Broker),
            503 => Some(ErrorCode::Registry),
            504 => Some(ErrorCode::Config),
            505 => Some(ErrorCode::Gateway),
            506 => Some(ErrorCode::ReqParameter),
            507 => Some(ErrorCode::NoToken),
            _ => None,
        }
    }

    /// 获取错误代码的字符串表示
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Common => "COMMON",
            ErrorCode::RemoteCall => "REMOTE_CALL",
            ErrorCode::Broker => "BROKER",
            ErrorCode::Registry => "REGISTRY",
            ErrorCode::Config => "CONFIG",
            ErrorCode::Gateway => "GATEWAY",
            ErrorCode::ReqParameter => "REQ_PARAMETER",
            ErrorCode::NoToken => "NO_TOKEN",
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 注册中心和远程调用错误通常是拓扑抖动造成的，稍后重试即可
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::RemoteCall | ErrorCode::Registry)
    }
}
