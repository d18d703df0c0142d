//! 拦截器链
//!
//! 拦截器以 `ServiceType::of::<dyn Interceptor>()` 注册到服务注册中心。
//! [`InterceptorChain`] 通过弱订阅跟踪这些注册，按 (rank 降序, id 升序)
//! 维护有序列表，变更采用写时复制：每次调用在开始时取一次快照，
//! 调用过程中的重新配置不会影响它。

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::endpoint::{attrs, Endpoint, MethodFuture, MethodRef};
use crate::module::runtime::ModuleInstance;
use crate::registry::{
    ListenerSubscription, PropertyFilter, ServiceListener, ServiceReference, ServiceRegistry,
    ServiceType, SubscriptionOptions,
};
use crate::utils::{CoreError, Result};

/// 拦截器
///
/// 可以改写参数后调用 [`Next::proceed`]，也可以不调用直接返回（短路），
/// 或者包装、转换下游返回的错误。
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// 处理一次调用，`next` 指向链上的下一环
    async fn intercept(&self, args: Vec<Value>, next: Next) -> Result<Value>;
}

/// 单次调用的信息
#[derive(Debug)]
pub struct CallInfo {
    call_id: String,
    endpoint: Arc<Endpoint>,
}

impl CallInfo {
    pub(crate) fn new(call_id: String, endpoint: Arc<Endpoint>) -> Self {
        Self { call_id, endpoint }
    }

    /// 调用 ID，同时出现在调用 span 中
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// 被调用的端点
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

/// 拦截器的后续调用
pub struct Next {
    chain: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    call: Arc<CallInfo>,
    instance: ModuleInstance,
    method: MethodRef,
}

impl Next {
    pub(crate) fn new(
        chain: Arc<[Arc<dyn Interceptor>]>,
        call: Arc<CallInfo>,
        instance: ModuleInstance,
        method: MethodRef,
    ) -> Self {
        Self {
            chain,
            index: 0,
            call,
            instance,
            method,
        }
    }

    /// 当前调用的信息
    pub fn call(&self) -> &CallInfo {
        &self.call
    }

    /// 当前调用的端点
    pub fn endpoint(&self) -> &Endpoint {
        &self.call.endpoint
    }

    /// 调用下一个拦截器，链已走完时调用真正的实现
    pub fn proceed(self, args: Vec<Value>) -> MethodFuture {
        match self.chain.get(self.index).cloned() {
            Some(interceptor) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                Box::pin(async move { interceptor.intercept(args, next).await })
            }
            None => (self.method)(self.instance, args),
        }
    }
}

// ============================================================================
// 拦截器链
// ============================================================================

#[derive(Clone)]
struct ChainEntry {
    id: u64,
    rank: i32,
    interceptor: Arc<dyn Interceptor>,
}

struct ChainState {
    entries: Vec<ChainEntry>,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl ChainState {
    fn empty() -> Self {
        Self::from_entries(Vec::new())
    }

    fn from_entries(entries: Vec<ChainEntry>) -> Self {
        let interceptors = entries
            .iter()
            .map(|entry| entry.interceptor.clone())
            .collect::<Vec<_>>()
            .into();
        Self {
            entries,
            interceptors,
        }
    }
}

struct ChainInner {
    state: ArcSwap<ChainState>,
    write: Mutex<()>,
}

impl ChainInner {
    fn insert(&self, id: u64, rank: i32, interceptor: Arc<dyn Interceptor>) {
        let _guard = self.write.lock();
        let current = self.state.load_full();
        if current.entries.iter().any(|e| e.id == id) {
            return;
        }
        let mut entries = current.entries.clone();
        let key = (std::cmp::Reverse(rank), id);
        let pos = entries.partition_point(|e| (std::cmp::Reverse(e.rank), e.id) < key);
        entries.insert(pos, ChainEntry { id, rank, interceptor });
        self.state.store(Arc::new(ChainState::from_entries(entries)));
        debug!(service_id = id, rank, "拦截器加入调用链");
    }

    fn remove(&self, id: u64) {
        let _guard = self.write.lock();
        let current = self.state.load_full();
        if !current.entries.iter().any(|e| e.id == id) {
            return;
        }
        let entries = current
            .entries
            .iter()
            .filter(|e| e.id != id)
            .cloned()
            .collect();
        self.state.store(Arc::new(ChainState::from_entries(entries)));
        debug!(service_id = id, "拦截器移出调用链");
    }
}

impl ServiceListener for ChainInner {
    fn service_added(&self, reference: &ServiceReference) -> anyhow::Result<()> {
        if let Some(interceptor) = reference.get::<dyn Interceptor>() {
            self.insert(reference.id(), reference.rank(), interceptor);
        }
        Ok(())
    }

    fn service_removed(&self, reference: &ServiceReference) -> anyhow::Result<()> {
        self.remove(reference.id());
        Ok(())
    }
}

/// 拦截器链
///
/// 克隆共享同一份列表。
#[derive(Clone)]
pub struct InterceptorChain {
    inner: Arc<ChainInner>,
    subscription: Option<ListenerSubscription>,
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::detached()
    }
}

impl InterceptorChain {
    /// 不跟踪任何注册中心的空链
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(ChainInner {
                state: ArcSwap::from_pointee(ChainState::empty()),
                write: Mutex::new(()),
            }),
            subscription: None,
        }
    }

    /// 跟踪注册中心里的拦截器服务
    ///
    /// 已注册的拦截器立即加入；订阅是弱引用，链被释放后自动移除。
    pub fn track(registry: &ServiceRegistry) -> Self {
        let mut chain = Self::detached();
        let listener: Arc<dyn ServiceListener> = chain.inner.clone();
        let subscription = registry.subscribe(
            ServiceType::of::<dyn Interceptor>(),
            PropertyFilter::any(),
            listener,
            SubscriptionOptions::default().weak().replay(true),
        );
        chain.subscription = Some(subscription);
        chain
    }

    /// 当前链的快照
    pub fn snapshot(&self) -> Arc<[Arc<dyn Interceptor>]> {
        self.inner.state.load().interceptors.clone()
    }

    /// 按链顺序排列的 (注册 ID, rank)
    pub fn entries(&self) -> Vec<(u64, i32)> {
        self.inner
            .state
            .load()
            .entries
            .iter()
            .map(|e| (e.id, e.rank))
            .collect()
    }

    /// 当前拦截器数量
    pub fn len(&self) -> usize {
        self.inner.state.load().entries.len()
    }

    /// 是否没有拦截器
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 停止跟踪注册中心，当前列表保持不变
    pub fn close(&self) -> bool {
        self.subscription
            .as_ref()
            .map(ListenerSubscription::unsubscribe)
            .unwrap_or(false)
    }
}

// ============================================================================
// 内置拦截器
// ============================================================================

/// 必填参数检查的 rank
pub const REQUIRED_ARGUMENT_RANK: i32 = 10_000;

/// 调用跟踪的 rank（最外层）
pub const TRACING_RANK: i32 = 20_000;

/// 拒绝为带 `required` 属性的参数传入 null
#[derive(Debug, Default)]
pub struct RequiredArgumentInterceptor;

#[async_trait]
impl Interceptor for RequiredArgumentInterceptor {
    async fn intercept(&self, args: Vec<Value>, next: Next) -> Result<Value> {
        let endpoint = next.endpoint();
        for (index, parameter) in endpoint.parameters().iter().enumerate() {
            if !parameter.is_flagged(attrs::REQUIRED) {
                continue;
            }
            if args.get(index).map_or(true, Value::is_null) {
                return Err(CoreError::InvalidArgument {
                    endpoint: endpoint.signature().to_string(),
                    parameter: parameter.name.clone(),
                    reason: "不能为空".to_string(),
                });
            }
        }
        next.proceed(args).await
    }
}

/// 记录每次调用的结果与耗时
#[derive(Debug, Default)]
pub struct TracingInterceptor;

#[async_trait]
impl Interceptor for TracingInterceptor {
    async fn intercept(&self, args: Vec<Value>, next: Next) -> Result<Value> {
        let call_id = next.call().call_id().to_string();
        let endpoint = next.endpoint().signature().to_string();
        let started = Instant::now();

        let result = next.proceed(args).await;
        let duration_us = started.elapsed().as_micros() as u64;

        match result {
            Ok(_) => info!(call_id = %call_id, endpoint = %endpoint, duration_us, "端点调用完成"),
            Err(ref e) => warn!(
                call_id = %call_id,
                endpoint = %endpoint,
                duration_us,
                error_code = e.error_code(),
                error = %e,
                "端点调用失败"
            ),
        }
        result
    }
}
