//! 终端分发
//!
//! 读取路由匹配拦截器写入的三个请求头，按后端协议分发：
//! `reverse-proxy` 透明转发到选中的节点，`typed-rpc` 交给注册的适配器。
//! 任何失败都以统一响应体返回。

use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::endpoint::{CallContext, EndpointAdapter};
use super::envelope::{ApiResult, CONTENT_TYPE_JSON};
use super::interceptor::Handler;
use super::pool::BackendPool;
use crate::error::{ErrorCode, MeshError};

pub const SERVICE_NAME_HEADER: &str = "micro-service-name";
pub const SERVICE_PATH_HEADER: &str = "micro-service-path";
pub const SERVICE_SCHEMA_HEADER: &str = "micro-service-schema";

/// 转发时读取请求体的上限
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// 逐跳头，不转发
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// 后端协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    ReverseProxy,
    TypedRpc,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reverse-proxy" | "controller" => Some(Scheme::ReverseProxy),
            "typed-rpc" | "rpc" => Some(Scheme::TypedRpc),
            _ => None,
        }
    }
}

/// 去掉匹配的前缀，结果总以 `/` 开头，保留查询串
pub fn rewrite_path(path: &str, query: Option<&str>, prefix: &str) -> String {
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    let mut rewritten = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };
    if let Some(query) = query {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    rewritten
}

/// 路由键：路径的前两段，`/<lb名>/<服务名>/`
pub fn routing_key(path: &str) -> Option<String> {
    let mut segments = path.strip_prefix('/')?.splitn(3, '/');
    let lb_name = segments.next().filter(|s| !s.is_empty())?;
    let service_name = segments.next().filter(|s| !s.is_empty())?;
    // 至少还要有一个分隔符，即 `/lb/svc/...`
    segments.next()?;
    Some(format!("/{}/{}/", lb_name, service_name))
}

/// 转发给后端的请求头：去掉路由头、逐跳头、Host 与长度，追加 `X-Forwarded-For`
pub fn forward_headers(headers: &HeaderMap, forwarded_for: &str) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len() + 1);
    for (name, value) in headers {
        let n = name.as_str();
        if n == SERVICE_NAME_HEADER
            || n == SERVICE_PATH_HEADER
            || n == SERVICE_SCHEMA_HEADER
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || HOP_BY_HOP.contains(&n)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(forwarded_for) {
        out.append(HeaderName::from_static("x-forwarded-for"), value);
    }
    out
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn failed(code: ErrorCode, msg: impl Into<String>) -> Response {
    ApiResult::failed_with(code, msg).into_response()
}

/// 终端处理器
pub struct Dispatcher {
    pool: Arc<BackendPool>,
    endpoints: Arc<HashMap<String, Arc<dyn EndpointAdapter>>>,
    timeout: Duration,
    forwarded_for: String,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<BackendPool>,
        endpoints: Arc<HashMap<String, Arc<dyn EndpointAdapter>>>,
        timeout: Duration,
        forwarded_for: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            endpoints,
            timeout,
            forwarded_for: forwarded_for.into(),
        }
    }

    pub fn into_handler(self) -> Handler {
        let dispatcher = Arc::new(self);
        Arc::new(move |req: Request| -> BoxFuture<'static, Response> {
            let dispatcher = dispatcher.clone();
            Box::pin(async move { dispatcher.dispatch(req).await })
        })
    }

    pub async fn dispatch(&self, req: Request) -> Response {
        let headers = req.headers();
        let service_name = header_str(headers, SERVICE_NAME_HEADER).to_string();
        let prefix = header_str(headers, SERVICE_PATH_HEADER).to_string();
        let schema = header_str(headers, SERVICE_SCHEMA_HEADER).to_string();

        match Scheme::parse(&schema) {
            Some(Scheme::ReverseProxy) => self.reverse_proxy(req, &service_name, &prefix).await,
            Some(Scheme::TypedRpc) => self.typed_rpc(req).await,
            None => {
                error!(schema = %schema, "No support schema");
                failed(ErrorCode::Gateway, "no support schema")
            }
        }
    }

    async fn reverse_proxy(&self, req: Request, service_name: &str, prefix: &str) -> Response {
        let backend = match self.pool.select(service_name) {
            Ok(backend) => backend,
            Err(e) => {
                error!(service = %service_name, error = %e, "Remote controller call error");
                return failed(ErrorCode::Gateway, "no service instance");
            }
        };

        let (parts, body) = req.into_parts();
        let target = backend.url(&rewrite_path(parts.uri.path(), parts.uri.query(), prefix));
        let headers = forward_headers(&parts.headers, &self.forwarded_for);
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return failed(ErrorCode::Gateway, e.to_string());
            }
        };

        let result = backend
            .http()
            .request(parts.method, &target)
            .headers(headers)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(resp) => relay(resp).await,
            Err(e) => {
                error!(target = %target, error = %e, "Remote controller call error");
                failed(ErrorCode::Gateway, MeshError::from(e).reason())
            }
        }
    }

    async fn typed_rpc(&self, req: Request) -> Response {
        let path = req.uri().path().to_string();
        let Some(key) = routing_key(&path) else {
            error!(path = %path, "Url parse error");
            return failed(ErrorCode::Gateway, "url parse error");
        };
        let Some(endpoint) = self.endpoints.get(&key).cloned() else {
            error!(key = %key, "No endpoint instance");
            return failed(ErrorCode::Gateway, "no endpoint instance");
        };

        let token = header_str(req.headers(), header::AUTHORIZATION.as_str()).to_string();
        let method = req.method().clone();
        let input = match method {
            Method::GET | Method::DELETE => Bytes::from(full_uri(&req)),
            Method::POST | Method::PUT => match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
                Ok(body) => body,
                Err(e) => return failed(ErrorCode::Gateway, e.to_string()),
            },
            _ => {
                error!(method = %method, "Method not allowed");
                return failed(ErrorCode::Gateway, "method not allowed");
            }
        };

        let ctx = CallContext::new(self.timeout).with_authorization(&token);
        let outcome = tokio::time::timeout(
            self.timeout,
            endpoint.call(ctx, method.as_str(), &path, input),
        )
        .await
        .unwrap_or_else(|_| Err(MeshError::gateway("request timeout")));

        match outcome {
            Ok(out) => {
                let mut resp = (http::StatusCode::OK, out).into_response();
                let headers = resp.headers_mut();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
                if let Ok(date) = HeaderValue::from_str(&http_date()) {
                    headers.insert(header::DATE, date);
                }
                resp
            }
            Err(e) => {
                error!(key = %key, error = %e, "Endpoint call failed");
                let code = if e.is_rpc_status() {
                    e.code()
                } else {
                    ErrorCode::Gateway.as_i32()
                };
                ApiResult::failed(code, e.reason()).into_response()
            }
        }
    }
}

/// 带 scheme 和 host 的完整 URI
fn full_uri(req: &Request) -> String {
    let uri = req.uri();
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    let host = header_str(req.headers(), header::HOST.as_str());
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("http://{}{}", host, path_and_query)
}

/// RFC 1123 格式的当前时间
fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// 把后端响应原样返回，去掉逐跳头
async fn relay(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let mut headers = HeaderMap::with_capacity(resp.headers().len());
    for (name, value) in resp.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match resp.bytes().await {
        Ok(body) => {
            let mut out = Response::new(Body::from(body));
            *out.status_mut() = status;
            *out.headers_mut() = headers;
            out
        }
        Err(e) => {
            error!(error = %e, "Failed to read backend response");
            failed(ErrorCode::Gateway, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NotifyBus, ServiceRegistry};

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("/svc-a/ping", None, "/svc-a/"), "/ping");
        assert_eq!(rewrite_path("/svc-a/ping", Some("x=1"), "/svc-a"), "/ping?x=1");
        assert_eq!(rewrite_path("/svc-a/", None, "/svc-a/"), "/");
    }

    #[test]
    fn test_routing_key() {
        assert_eq!(routing_key("/rpc/example/call").as_deref(), Some("/rpc/example/"));
        assert_eq!(routing_key("/rpc/example/a/b").as_deref(), Some("/rpc/example/"));
        assert_eq!(routing_key("/rpc/example"), None);
        assert_eq!(routing_key("//example/call"), None);
    }

    #[test]
    fn test_forward_headers_strip_gateway_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(SERVICE_NAME_HEADER, HeaderValue::from_static("svc-a"));
        headers.insert(SERVICE_PATH_HEADER, HeaderValue::from_static("/svc-a/"));
        headers.insert(SERVICE_SCHEMA_HEADER, HeaderValue::from_static("reverse-proxy"));
        headers.insert(header::HOST, HeaderValue::from_static("gateway:8080"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("abc"));

        let out = forward_headers(&headers, "192.168.1.10");
        assert!(out.get(SERVICE_NAME_HEADER).is_none());
        assert!(out.get(SERVICE_PATH_HEADER).is_none());
        assert!(out.get(SERVICE_SCHEMA_HEADER).is_none());
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert_eq!(out[header::AUTHORIZATION], "abc");
        assert_eq!(out["x-forwarded-for"], "192.168.1.10");
    }

    fn dispatcher() -> Dispatcher {
        let pool = Arc::new(BackendPool::new(ServiceRegistry::detached(NotifyBus::default())));
        Dispatcher::new(pool, Arc::new(HashMap::new()), Duration::from_secs(1), "127.0.0.1")
    }

    async fn envelope(resp: Response) -> ApiResult {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_schema() {
        let req = Request::builder()
            .uri("/svc-a/ping")
            .header(SERVICE_SCHEMA_HEADER, "websocket")
            .body(Body::empty())
            .unwrap();
        let result = envelope(dispatcher().dispatch(req).await).await;
        assert_eq!(result, ApiResult::failed(505, "no support schema"));
    }

    #[tokio::test]
    async fn test_reverse_proxy_without_backend() {
        let req = Request::builder()
            .uri("/svc-a/ping")
            .header(SERVICE_NAME_HEADER, "svc-a")
            .header(SERVICE_PATH_HEADER, "/svc-a/")
            .header(SERVICE_SCHEMA_HEADER, "reverse-proxy")
            .body(Body::empty())
            .unwrap();
        let result = envelope(dispatcher().dispatch(req).await).await;
        assert_eq!(result, ApiResult::failed(505, "no service instance"));
    }

    #[tokio::test]
    async fn test_typed_rpc_misses() {
        let bad_path = Request::builder()
            .uri("/rpc")
            .header(SERVICE_SCHEMA_HEADER, "rpc")
            .body(Body::empty())
            .unwrap();
        let result = envelope(dispatcher().dispatch(bad_path).await).await;
        assert_eq!(result.msg, "url parse error");

        let unknown = Request::builder()
            .uri("/rpc/unknown/call")
            .header(SERVICE_SCHEMA_HEADER, "typed-rpc")
            .body(Body::empty())
            .unwrap();
        let result = envelope(dispatcher().dispatch(unknown).await).await;
        assert_eq!(result.msg, "no endpoint instance");
    }
}
