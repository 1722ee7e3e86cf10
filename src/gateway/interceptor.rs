//! 网关拦截器链
//!
//! 每个拦截器带一个优先级。构建时按优先级降序排序（同优先级保持注册顺序），
//! 再依次包裹终端处理器：先包裹的在内层，最后包裹的（优先级最低）在最外层，
//! 请求进入时最先执行。
//!
//! 常用优先级：
//!
//! | 优先级 | 拦截器 |
//! |--------|--------|
//! | -10 | [`RecoverInterceptor`] |
//! | -9 | [`LogInterceptor`] |
//! | 1 | [`RouteMatchInterceptor`] |
//! | 3 | [`AuthInterceptor`] |

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use futures::future::BoxFuture;
use http::HeaderValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use super::dispatch::{SERVICE_NAME_HEADER, SERVICE_PATH_HEADER, SERVICE_SCHEMA_HEADER};
use super::envelope::ApiResult;
use crate::config::Route;
use crate::error::ErrorCode;

/// 请求处理器
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// 把异步闭包包装成 [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req| -> BoxFuture<'static, Response> { Box::pin(f(req)) })
}

/// 拦截器
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// 包裹下一层处理器
    fn wrap(&self, next: Handler) -> Handler;
}

/// 有序拦截器列表
#[derive(Clone, Default)]
pub struct InterceptorChain {
    entries: Vec<(i32, Arc<dyn Interceptor>)>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, priority: i32, interceptor: Arc<dyn Interceptor>) {
        self.entries.push((priority, interceptor));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按包裹顺序（由内到外）排列
    fn sorted(&self) -> Vec<(i32, Arc<dyn Interceptor>)> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries
    }

    /// 请求进入时的执行顺序（由外到内）
    pub fn execution_order(&self) -> Vec<String> {
        self.sorted()
            .iter()
            .rev()
            .map(|(_, i)| i.name().to_string())
            .collect()
    }

    /// 组合出完整的处理器
    pub fn build(&self, terminal: Handler) -> Handler {
        self.sorted()
            .into_iter()
            .fold(terminal, |handler, (_, interceptor)| interceptor.wrap(handler))
    }
}

/// 捕获内层 panic，返回 `{code: 500}` 的响应体
pub struct RecoverInterceptor;

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown error".to_string()
    }
}

impl Interceptor for RecoverInterceptor {
    fn name(&self) -> &str {
        "recover"
    }

    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |req: Request| -> BoxFuture<'static, Response> {
            let next = next.clone();
            Box::pin(async move {
                let method = req.method().clone();
                let uri = req.uri().clone();
                let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| next(req))) {
                    Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                    Err(panic) => Err(panic),
                };
                outcome.unwrap_or_else(|panic| {
                    let msg = panic_message(panic.as_ref());
                    error!(method = %method, uri = %uri, panic = %msg, "Recover from panic");
                    ApiResult::failed_with(ErrorCode::Common, msg).into_response()
                })
            })
        })
    }
}

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 记录状态码、耗时、方法和路径
///
/// 请求没有 `x-request-id` 时生成一个，随请求转发给后端
pub struct LogInterceptor;

impl Interceptor for LogInterceptor {
    fn name(&self) -> &str {
        "log"
    }

    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |mut req: Request| -> BoxFuture<'static, Response> {
            let next = next.clone();
            Box::pin(async move {
                let start = Instant::now();
                let method = req.method().clone();
                let uri = req.uri().clone();
                let request_id = req
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                if let Ok(value) = HeaderValue::from_str(&request_id) {
                    req.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                let resp = next(req).await;
                info!(
                    request_id = %request_id,
                    code = resp.status().as_u16(),
                    took_ms = start.elapsed().as_millis() as u64,
                    method = %method,
                    path = %uri,
                    "Gateway request"
                );
                resp
            })
        })
    }
}

/// 按路径前缀匹配路由，写入三个路由头
pub struct RouteMatchInterceptor {
    routes: Arc<Vec<Route>>,
}

impl RouteMatchInterceptor {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: Arc::new(routes),
        }
    }
}

fn route_headers(route: &Route) -> Option<[HeaderValue; 3]> {
    Some([
        HeaderValue::from_str(&route.id).ok()?,
        HeaderValue::from_str(&route.path).ok()?,
        HeaderValue::from_str(&route.schema).ok()?,
    ])
}

impl Interceptor for RouteMatchInterceptor {
    fn name(&self) -> &str {
        "route-match"
    }

    fn wrap(&self, next: Handler) -> Handler {
        let routes = self.routes.clone();
        Arc::new(move |mut req: Request| -> BoxFuture<'static, Response> {
            let matched = routes
                .iter()
                .find(|r| req.uri().path().starts_with(&r.path))
                .and_then(route_headers);
            match matched {
                Some([name, path, schema]) => {
                    let headers = req.headers_mut();
                    headers.insert(SERVICE_NAME_HEADER, name);
                    headers.insert(SERVICE_PATH_HEADER, path);
                    headers.insert(SERVICE_SCHEMA_HEADER, schema);
                    next(req)
                }
                None => Box::pin(async {
                    ApiResult::failed_with(ErrorCode::Gateway, "non router exist").into_response()
                }),
            }
        })
    }
}

/// 白名单以外的请求必须携带 `Authorization`
pub struct AuthInterceptor {
    white_list: Arc<Vec<String>>,
}

impl AuthInterceptor {
    pub fn new(white_list: Vec<String>) -> Self {
        Self {
            white_list: Arc::new(white_list),
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn name(&self) -> &str {
        "auth"
    }

    fn wrap(&self, next: Handler) -> Handler {
        let white_list = self.white_list.clone();
        Arc::new(move |req: Request| -> BoxFuture<'static, Response> {
            let path = req.uri().path();
            if white_list.iter().any(|p| p == path) {
                return next(req);
            }
            let has_token = req
                .headers()
                .get(http::header::AUTHORIZATION)
                .map(|v| !v.is_empty())
                .unwrap_or(false);
            if has_token {
                next(req)
            } else {
                Box::pin(async {
                    ApiResult::failed_with(ErrorCode::NoToken, "unauthenticate").into_response()
                })
            }
        })
    }
}

/// 闭包拦截器
pub struct FnInterceptor<F> {
    name: String,
    f: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, next: Handler) -> Handler {
        (self.f)(next)
    }
}
