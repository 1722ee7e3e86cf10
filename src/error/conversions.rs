//! 错误类型转换实现

use super::MeshError;
use std::io;

impl From<io::Error> for MeshError {
    fn from(err: io::Error) -> Self {
        MeshError::internal(format!("io error: {}", err))
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::internal(format!("json error: {}", err))
    }
}

impl From<toml::de::Error> for MeshError {
    fn from(err: toml::de::Error) -> Self {
        MeshError::config(format!("toml error: {}", err))
    }
}

impl From<etcd_client::Error> for MeshError {
    fn from(err: etcd_client::Error) -> Self {
        MeshError::unavailable(format!("etcd error: {}", err))
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        MeshError::remote_call(err.to_string())
    }
}

impl From<tonic::Status> for MeshError {
    fn from(status: tonic::Status) -> Self {
        MeshError::Rpc {
            code: status.code() as i32,
            message: status.message().to_string(),
        }
    }
}

impl From<MeshError> for tonic::Status {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::Rpc { code, message } => tonic::Status::new(tonic::Code::from(code), message),
            MeshError::Unavailable(msg) => tonic::Status::unavailable(msg),
            MeshError::NotFound(msg) => tonic::Status::not_found(msg),
            MeshError::Config(msg) => tonic::Status::failed_precondition(msg),
            other => tonic::Status::internal(other.reason().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_keeps_code() {
        let err: MeshError = tonic::Status::not_found("user 1").into();
        assert_eq!(err.code(), tonic::Code::NotFound as i32);
        assert_eq!(err.reason(), "user 1");
        assert!(err.is_rpc_status());

        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_json_error_is_internal() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let mesh: MeshError = err.into();
        assert!(matches!(mesh, MeshError::Internal(_)));
    }
}
