//! `lb://` HTTP 客户端
//!
//! 请求目标写成 `lb://<服务名><路径>`，发送前用当前选择器换成
//! `http://<ip>:<port><路径>`。其它地址原样发送。

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::selector::SelectorSlot;
use crate::error::{MeshError, Result};
use crate::registry::ServiceRegistry;

pub const LB_SCHEME: &str = "lb://";

/// 负载均衡的 HTTP 客户端
#[derive(Clone)]
pub struct LbHttpClient {
    http: reqwest::Client,
    slot: SelectorSlot,
}

impl LbHttpClient {
    /// 订阅注册中心通知，每次变更重建选择器
    pub fn new(registry: ServiceRegistry) -> Self {
        let (slot, _) = SelectorSlot::watch(registry);
        Self::with_slot(slot, reqwest::Client::new())
    }

    pub fn with_slot(slot: SelectorSlot, http: reqwest::Client) -> Self {
        Self { http, slot }
    }

    /// 把 `lb://` 地址解析为具体节点地址
    pub async fn resolve(&self, url: &str) -> Result<String> {
        let Some(rest) = url.strip_prefix(LB_SCHEME) else {
            return Ok(url.to_string());
        };
        let (service_name, path) = match rest.find(['/', '?']) {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let selector = self
            .slot
            .current()
            .ok_or_else(|| MeshError::remote_call("service registry not ready"))?;
        let node = selector
            .next(service_name)
            .await
            .map_err(|e| MeshError::remote_call(e.reason().to_string()))?;

        let resolved = format!("http://{}{}", node.addr(), path);
        debug!(from = %url, to = %resolved, "Resolved lb address");
        Ok(resolved)
    }

    /// 发送请求，`url` 可以是 `lb://` 地址
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let target = self.resolve(url).await?;
        let mut request = self.http.request(method, target).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        Ok(request.send().await?)
    }

    pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
        self.send(Method::GET, url, HeaderMap::new(), None, None).await
    }
}

/// 绑定单个服务的 API 客户端
///
/// 基础地址为 `lb://<服务名>`，路径相对于服务根
#[derive(Clone)]
pub struct ApiClient {
    client: LbHttpClient,
    base_url: String,
    headers: HeaderMap,
}

impl ApiClient {
    pub fn new(client: LbHttpClient, service_name: &str) -> Self {
        Self {
            client,
            base_url: format!("{}{}", LB_SCHEME, service_name),
            headers: HeaderMap::new(),
        }
    }

    /// 每个请求附带的请求头
    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .send(Method::GET, &url, self.headers.clone(), None, None)
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut headers = self.headers.clone();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        let body = Bytes::from(serde_json::to_vec(body)?);
        let resp = self
            .client
            .send(Method::POST, &url, headers, Some(body), None)
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}
