//! 统一响应体 `{code, msg, data}`
//!
//! `code == 0` 表示成功。网关处理的失败一律以 HTTP 200 返回此结构，
//! 调用方需要检查 `code`。

use axum::response::{IntoResponse, Response};
use http::{HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, MeshError};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResult {
    pub code: i32,
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl ApiResult {
    pub fn success(data: impl Serialize) -> Self {
        Self {
            code: 0,
            msg: String::new(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn failed(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: Value::Null,
        }
    }

    pub fn failed_with(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::failed(code.as_i32(), msg)
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // 只含 String/Value 字段，序列化不会失败
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl From<&MeshError> for ApiResult {
    fn from(err: &MeshError) -> Self {
        Self::failed(err.code(), err.reason())
    }
}

impl IntoResponse for ApiResult {
    fn into_response(self) -> Response {
        let mut resp = (StatusCode::OK, self.to_bytes()).into_response();
        resp.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_shape() {
        let json = serde_json::to_value(ApiResult::failed_with(ErrorCode::Gateway, "non router exist")).unwrap();
        assert_eq!(json["code"], 505);
        assert_eq!(json["msg"], "non router exist");
        assert!(json["data"].is_null());
    }

    #[test]
    fn test_success_shape() {
        let result = ApiResult::success(serde_json::json!({"id": 1}));
        assert!(result.is_success());
        assert_eq!(result.data["id"], 1);
    }

    #[test]
    fn test_from_error() {
        let result = ApiResult::from(&MeshError::gateway("no service instance"));
        assert_eq!(result.code, 505);
        assert_eq!(result.msg, "no service instance");
    }

    #[tokio::test]
    async fn test_response_is_json_200() {
        let resp = ApiResult::failed(500, "boom").into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], CONTENT_TYPE_JSON);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let decoded: ApiResult = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, ApiResult::failed(500, "boom"));
    }
}
