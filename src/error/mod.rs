//! 错误处理模块
//!
//! 提供统一的错误类型、错误代码以及与外部错误类型之间的转换

pub mod code;
pub mod conversions;
pub mod mesh_error;

pub use code::ErrorCode;
pub use mesh_error::{MeshError, Result};

/// 应用层默认使用的结果类型
pub type AppResult<T> = anyhow::Result<T>;
