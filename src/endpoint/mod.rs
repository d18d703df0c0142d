//! 端点调用管线
//!
//! - `endpoint`: 端点模型、声明与注册属性
//! - `resolver`: 参数解析器
//! - `interceptor`: 拦截器与拦截器链
//! - `invoker`: 调用器与调用

#[allow(clippy::module_inception)]
pub mod endpoint;
pub mod interceptor;
pub mod invoker;
pub mod resolver;

pub use endpoint::{
    attrs, handler, keys, Endpoint, EndpointDeclaration, EndpointMetadata, MethodFuture, MethodRef,
    Parameter, DEFAULT_KIND,
};
pub use interceptor::{
    CallInfo, Interceptor, InterceptorChain, Next, RequiredArgumentInterceptor, TracingInterceptor,
    REQUIRED_ARGUMENT_RANK, TRACING_RANK,
};
pub use invoker::{Invocation, InvocationEnv, Invoker};
pub use resolver::{
    builtin_resolvers, AttributeKeyResolver, ContextKeyResolver, ContextMapResolver,
    DefaultValueResolver, FnResolver, NamedResolver, OptionalResolver, ParameterResolver,
    Resolution, ResolutionContext,
};
