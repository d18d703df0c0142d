//! 调用器与调用
//!
//! [`Invoker`] 是端点与一组参数解析器的不可变组合，创建一次可反复使用。
//! [`Invoker::resolve`] 按上下文解析出全部参数得到 [`Invocation`]；
//! [`Invocation::invoke`] 在开始时从所属模块取当前实例并对拦截器链
//! 取快照，然后经拦截器链调用实现。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{trace, Instrument};

use super::endpoint::Endpoint;
use super::interceptor::{CallInfo, InterceptorChain, Next};
use super::resolver::{builtin_resolvers, ParameterResolver, Resolution, ResolutionContext};
use crate::core::config::EndpointConfig;
use crate::utils::{generate_id, CallStats, CallStatsSnapshot, CoreError, Result};

/// 调用环境
///
/// 由运行时创建，所有端点共享：拦截器链、内置解析器和全局调用统计。
#[derive(Clone)]
pub struct InvocationEnv {
    chain: InterceptorChain,
    builtin_resolvers: Arc<[Arc<dyn ParameterResolver>]>,
    stats: Arc<CallStats>,
}

impl Default for InvocationEnv {
    fn default() -> Self {
        Self::new(InterceptorChain::detached(), &EndpointConfig::default())
    }
}

impl InvocationEnv {
    /// 按端点配置创建调用环境
    pub fn new(chain: InterceptorChain, config: &EndpointConfig) -> Self {
        let builtin_resolvers = if config.builtin_resolvers {
            builtin_resolvers()
        } else {
            Vec::new()
        };
        Self {
            chain,
            builtin_resolvers: builtin_resolvers.into(),
            stats: Arc::new(CallStats::new()),
        }
    }

    /// 共享的拦截器链
    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// 全局调用统计
    pub fn stats(&self) -> CallStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> &CallStats {
        &self.stats
    }
}

/// 调用器
#[derive(Clone)]
pub struct Invoker {
    endpoint: Arc<Endpoint>,
    resolvers: Arc<[Arc<dyn ParameterResolver>]>,
}

impl Invoker {
    pub(crate) fn new(endpoint: Arc<Endpoint>, resolvers: Vec<Arc<dyn ParameterResolver>>) -> Self {
        Self {
            endpoint,
            resolvers: resolvers.into(),
        }
    }

    /// 目标端点
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// 解析全部参数
    ///
    /// 每个参数依次询问调用方解析器和内置解析器，第一个不返回 `Skip` 的结果生效。
    ///
    /// # Errors
    ///
    /// 任一参数无人解析时返回 `UnresolvableArgument`，不产生部分解析的调用。
    pub fn resolve(&self, context: &ResolutionContext) -> Result<Invocation> {
        let builtin = self.endpoint.env().builtin_resolvers.iter();
        let mut args = Vec::with_capacity(self.endpoint.parameters().len());

        for (index, parameter) in self.endpoint.parameters().iter().enumerate() {
            let resolved = self
                .resolvers
                .iter()
                .chain(builtin.clone())
                .find_map(|resolver| match resolver.resolve(parameter, context) {
                    Resolution::Value(value) => Some(value),
                    Resolution::Skip => None,
                });

            match resolved {
                Some(value) => args.push(value),
                None => {
                    return Err(CoreError::UnresolvableArgument {
                        endpoint: self.endpoint.signature().to_string(),
                        parameter: parameter.name.clone(),
                        index,
                    })
                }
            }
        }

        trace!(endpoint = self.endpoint.signature(), args = args.len(), "参数解析完成");
        Ok(Invocation {
            endpoint: self.endpoint.clone(),
            args,
        })
    }

    /// 解析并调用
    pub async fn call(&self, context: &ResolutionContext) -> Result<Value> {
        self.resolve(context)?.invoke().await
    }
}

/// 一次已解析参数的调用
pub struct Invocation {
    endpoint: Arc<Endpoint>,
    args: Vec<Value>,
}

impl Invocation {
    /// 目标端点
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// 已解析的实参
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// 执行调用
    ///
    /// # Errors
    ///
    /// 所属模块已不再提供实现时返回 `EndpointUnavailable`；拦截器或实现
    /// 返回的错误原样传出。
    pub async fn invoke(self) -> Result<Value> {
        let Invocation { endpoint, args } = self;

        let Some((instance, method)) = endpoint.target() else {
            endpoint.record_unavailable();
            return Err(CoreError::EndpointUnavailable(endpoint.signature().to_string()));
        };
        let interceptors = endpoint.env().chain().snapshot();

        let call = Arc::new(CallInfo::new(generate_id(), endpoint.clone()));
        let span = crate::invocation_span!(call.call_id(), endpoint.signature());

        let started = Instant::now();
        let result = Next::new(interceptors, call, instance, method)
            .proceed(args)
            .instrument(span)
            .await;
        endpoint.record(result.is_ok(), started.elapsed());
        result
    }
}
