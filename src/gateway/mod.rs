//! 网关路由引擎
//!
//! 请求依次经过拦截器链（恢复、日志、路由匹配、鉴权），最后由分发器
//! 按路由协议转发到后端节点或类型化适配器。后端连接池随注册中心的拓扑
//! 通知动态增减。

pub mod dispatch;
pub mod endpoint;
pub mod envelope;
pub mod interceptor;
pub mod pool;
pub mod server;

pub use dispatch::{
    Dispatcher, SERVICE_NAME_HEADER, SERVICE_PATH_HEADER, SERVICE_SCHEMA_HEADER, Scheme,
};
pub use endpoint::{CallContext, EndpointAdapter, JsonEndpoint, endpoint_key, query_to_json};
pub use envelope::{ApiResult, CONTENT_TYPE_JSON};
pub use interceptor::{
    AuthInterceptor, FnInterceptor, Handler, Interceptor, InterceptorChain, LogInterceptor,
    REQUEST_ID_HEADER, RecoverInterceptor, RouteMatchInterceptor, handler_fn,
};
pub use pool::{BackendClient, BackendPool};
pub use server::GatewayServer;
