//! 类型化调用适配器
//!
//! `typed-rpc` 路由不透传字节，而是交给按 `/<lb名>/<服务名>/` 注册的适配器，
//! 由适配器把输入解码成具体的 RPC 调用。

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::{MetadataMap, MetadataValue};

use crate::error::{MeshError, Result};

/// 一次调用的上下文
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// 传给后端的调用元数据，包含 `authorization`
    pub metadata: MetadataMap,
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            metadata: MetadataMap::new(),
            timeout: Some(timeout),
        }
    }

    /// 携带调用方的令牌，空值或非法值忽略
    pub fn with_authorization(mut self, token: &str) -> Self {
        if let Ok(value) = MetadataValue::try_from(token) {
            self.metadata.insert("authorization", value);
        }
        self
    }

    pub fn authorization(&self) -> Option<&str> {
        self.metadata
            .get("authorization")
            .and_then(|v| v.to_str().ok())
    }

    /// 构造带元数据和超时的 tonic 请求
    pub fn into_request<T>(self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.metadata;
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        request
    }
}

/// 类型化调用适配器
#[async_trait]
pub trait EndpointAdapter: Send + Sync {
    /// 路由键的第一段
    fn lb_name(&self) -> &str;

    /// 路由键的第二段
    fn service_name(&self) -> &str;

    /// 执行调用，返回序列化后的响应
    ///
    /// GET/DELETE 的 `input` 是完整 URI，POST/PUT 是请求体
    async fn call(&self, ctx: CallContext, method: &str, path: &str, input: Bytes) -> Result<Bytes>;
}

/// 适配器的路由键：`/<lb名>/<小写服务名>/`
pub fn endpoint_key(adapter: &dyn EndpointAdapter) -> String {
    format!(
        "/{}/{}/",
        adapter.lb_name(),
        adapter.service_name().to_lowercase()
    )
}

type RouteFn = Arc<dyn Fn(CallContext, Bytes) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// 以 JSON 为输出的适配器
///
/// 路由表键为 `"<METHOD>:<path>"`
pub struct JsonEndpoint {
    lb_name: String,
    service_name: String,
    routes: HashMap<String, RouteFn>,
}

impl JsonEndpoint {
    pub fn new(lb_name: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            lb_name: lb_name.into(),
            service_name: service_name.into(),
            routes: HashMap::new(),
        }
    }

    pub fn route<F, Fut>(mut self, method: &str, path: &str, f: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RouteFn =
            Arc::new(move |ctx, input| -> BoxFuture<'static, Result<Value>> { Box::pin(f(ctx, input)) });
        self.routes
            .insert(format!("{}:{}", method.to_uppercase(), path), handler);
        self
    }
}

#[async_trait]
impl EndpointAdapter for JsonEndpoint {
    fn lb_name(&self) -> &str {
        &self.lb_name
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn call(&self, ctx: CallContext, method: &str, path: &str, input: Bytes) -> Result<Bytes> {
        let key = format!("{}:{}", method.to_uppercase(), path);
        let handler = self
            .routes
            .get(&key)
            .ok_or_else(|| MeshError::internal("endpoint not found"))?;
        let output = handler(ctx, input).await?;
        Ok(Bytes::from(serde_json::to_vec(&output)?))
    }
}

/// 把 URI 的查询串解码成 JSON 对象
///
/// 同名参数合并为数组，值一律为字符串
pub fn query_to_json(uri: &str) -> Value {
    let parsed = reqwest::Url::parse(uri)
        .or_else(|_| reqwest::Url::parse("http://localhost").and_then(|base| base.join(uri)));
    let mut object = Map::new();
    let Ok(url) = parsed else {
        return Value::Object(object);
    };

    for (key, value) in url.query_pairs() {
        let value = Value::String(value.into_owned());
        match object.get_mut(key.as_ref()) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                object.insert(key.into_owned(), value);
            }
        }
    }
    Value::Object(object)
}
