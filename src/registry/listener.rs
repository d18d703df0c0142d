//! 服务监听分发器
//!
//! 管理按服务类型与属性过滤器订阅的监听者，并在注册变化时通知它们。
//!
//! # 投递模型
//!
//! - 事件在注册中心写锁内按变更顺序进入每个订阅自己的队列
//! - 写锁释放后再排空队列并回调监听者，监听者可以重入注册中心
//! - 每个订阅有一把投递锁，同一监听者收到的事件与变更顺序一致且不会交错；
//!   不同监听者之间的顺序不作保证
//! - 不在监听回调内的调用方等待投递锁，返回时自己触发的通知已经送达；
//!   回调内的重入调用不等待，由持锁者继续投递
//! - 监听者返回的错误和 panic 都在此边界被捕获并记录，不影响其他监听者，
//!   也不会回滚触发它的注册/注销

use std::any::TypeId;
use std::cell::Cell;
use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::filter::PropertyFilter;
use super::registry::RegistryInner;
use super::service::{ModuleId, Properties, ServiceReference, ServiceType};
use crate::utils::IdSequence;

thread_local! {
    /// 当前线程正在执行的监听回调层数
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

// ============================================================================
// 监听者接口
// ============================================================================

/// 服务事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceEventKind {
    /// 服务出现（注册，或属性变化后开始匹配）
    Added,
    /// 匹配中的服务属性发生变化
    Modified,
    /// 服务消失（注销，或属性变化后不再匹配）
    Removed,
}

/// 服务监听者
///
/// 回调在注册中心锁之外执行，可以安全地调用注册中心。
pub trait ServiceListener: Send + Sync {
    /// 匹配的服务出现
    fn service_added(&self, reference: &ServiceReference) -> anyhow::Result<()>;

    /// 匹配的服务属性变化
    fn service_modified(&self, _reference: &ServiceReference) -> anyhow::Result<()> {
        Ok(())
    }

    /// 匹配的服务消失
    fn service_removed(&self, reference: &ServiceReference) -> anyhow::Result<()>;
}

type ReferenceCallback = Box<dyn Fn(&ServiceReference) -> anyhow::Result<()> + Send + Sync>;

/// 基于闭包的监听者
///
/// ```
/// use chips_runtime::registry::FnListener;
///
/// let listener = FnListener::new(
///     |r| { println!("added {}", r.id()); Ok(()) },
///     |r| { println!("removed {}", r.id()); Ok(()) },
/// );
/// ```
pub struct FnListener {
    on_added: ReferenceCallback,
    on_removed: ReferenceCallback,
    on_modified: Option<ReferenceCallback>,
}

impl FnListener {
    /// 创建监听者
    pub fn new<A, R>(on_added: A, on_removed: R) -> Self
    where
        A: Fn(&ServiceReference) -> anyhow::Result<()> + Send + Sync + 'static,
        R: Fn(&ServiceReference) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            on_added: Box::new(on_added),
            on_removed: Box::new(on_removed),
            on_modified: None,
        }
    }

    /// 设置属性变化回调
    pub fn on_modified<M>(mut self, on_modified: M) -> Self
    where
        M: Fn(&ServiceReference) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_modified = Some(Box::new(on_modified));
        self
    }
}

impl ServiceListener for FnListener {
    fn service_added(&self, reference: &ServiceReference) -> anyhow::Result<()> {
        (self.on_added)(reference)
    }

    fn service_modified(&self, reference: &ServiceReference) -> anyhow::Result<()> {
        match self.on_modified {
            Some(ref callback) => callback(reference),
            None => Ok(()),
        }
    }

    fn service_removed(&self, reference: &ServiceReference) -> anyhow::Result<()> {
        (self.on_removed)(reference)
    }
}

// ============================================================================
// 订阅
// ============================================================================

/// 订阅选项
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionOptions {
    /// 所属模块；模块停止时订阅被自动移除
    pub owner: Option<ModuleId>,
    /// 弱订阅：只持有监听者的弱引用，监听者被释放后订阅被静默移除
    pub weak: bool,
    /// 订阅时补发已存在的匹配服务；`None` 表示使用注册中心的默认配置
    pub replay: Option<bool>,
}

impl SubscriptionOptions {
    /// 设置所属模块
    pub fn owned_by(mut self, owner: ModuleId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// 使用弱引用
    pub fn weak(mut self) -> Self {
        self.weak = true;
        self
    }

    /// 覆盖补发设置
    pub fn replay(mut self, replay: bool) -> Self {
        self.replay = Some(replay);
        self
    }
}

enum ListenerRef {
    Strong(Arc<dyn ServiceListener>),
    Weak(Weak<dyn ServiceListener>),
}

struct PendingEvent {
    kind: ServiceEventKind,
    reference: ServiceReference,
}

pub(crate) struct Subscription {
    id: u64,
    type_id: TypeId,
    type_name: &'static str,
    filter: PropertyFilter,
    listener: ListenerRef,
    owner: Option<ModuleId>,
    active: AtomicBool,
    queue: Mutex<VecDeque<PendingEvent>>,
    delivery: Mutex<()>,
}

impl Subscription {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn push(&self, kind: ServiceEventKind, reference: &ServiceReference) {
        self.queue.lock().push_back(PendingEvent {
            kind,
            reference: reference.clone(),
        });
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 弱订阅的监听者是否已被释放
    fn is_dead(&self) -> bool {
        match self.listener {
            ListenerRef::Strong(_) => false,
            ListenerRef::Weak(ref weak) => weak.strong_count() == 0,
        }
    }
}

/// 订阅句柄
#[derive(Clone)]
pub struct ListenerSubscription {
    id: u64,
    registry: Weak<RegistryInner>,
}

impl ListenerSubscription {
    pub(crate) fn new(id: u64, registry: Weak<RegistryInner>) -> Self {
        Self { id, registry }
    }

    /// 订阅 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 取消订阅；返回是否真正移除
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.dispatcher.unsubscribe(self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ListenerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ListenerSubscription").field(&self.id).finish()
    }
}

/// 注册变化
#[derive(Clone, Copy)]
pub(crate) enum Change<'a> {
    Registered,
    Unregistered,
    Modified { previous: &'a Properties },
}

// ============================================================================
// 分发统计
// ============================================================================

/// 分发统计
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    pruned: AtomicU64,
}

/// 分发统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    /// 成功投递的通知数
    pub delivered: u64,
    /// 监听者返回错误的通知数
    pub failed: u64,
    /// 监听者 panic 的通知数
    pub panicked: u64,
    /// 因监听者被释放而移除的弱订阅数
    pub pruned: u64,
}

impl DispatchStats {
    fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// 分发器
// ============================================================================

/// 监听分发器
pub(crate) struct ListenerDispatcher {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    ids: IdSequence,
    stats: DispatchStats,
}

impl ListenerDispatcher {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            ids: IdSequence::new(),
            stats: DispatchStats::default(),
        }
    }

    /// 添加订阅
    ///
    /// 调用方应持有注册中心读锁，以便补发事件先于之后的任何变更入队。
    pub fn add(
        &self,
        service_type: ServiceType,
        filter: PropertyFilter,
        listener: Arc<dyn ServiceListener>,
        options: SubscriptionOptions,
    ) -> Arc<Subscription> {
        let listener = if options.weak {
            ListenerRef::Weak(Arc::downgrade(&listener))
        } else {
            ListenerRef::Strong(listener)
        };
        let subscription = Arc::new(Subscription {
            id: self.ids.next_id(),
            type_id: service_type.type_id(),
            type_name: service_type.name(),
            filter,
            listener,
            owner: options.owner,
            active: AtomicBool::new(true),
            queue: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
        });
        {
            let mut subscriptions = self.subscriptions.write();
            self.retain_live(&mut subscriptions);
            subscriptions.push(subscription.clone());
        }

        debug!(
            subscription_id = subscription.id,
            service_type = subscription.type_name,
            weak = options.weak,
            owner = ?options.owner,
            "添加服务监听"
        );
        subscription
    }

    /// 把已存在的服务作为 `Added` 事件补发给订阅
    pub fn replay<'a>(
        &self,
        subscription: &Subscription,
        existing: impl Iterator<Item = &'a ServiceReference>,
    ) {
        for reference in existing {
            subscription.push(ServiceEventKind::Added, reference);
        }
    }

    /// 移除订阅
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = {
            let mut subscriptions = self.subscriptions.write();
            let before = subscriptions.len();
            subscriptions.retain(|s| {
                if s.id == id {
                    s.active.store(false, Ordering::Release);
                    false
                } else {
                    true
                }
            });
            before != subscriptions.len()
        };
        if removed {
            debug!(subscription_id = id, "取消服务监听");
        }
        removed
    }

    /// 移除某模块拥有的全部订阅
    pub fn unsubscribe_owner(&self, owner: ModuleId) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| {
            if s.owner == Some(owner) {
                s.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
        let removed = before - subscriptions.len();
        if removed > 0 {
            debug!(module_id = owner, count = removed, "移除模块的服务监听");
        }
        removed
    }

    /// 按注册变化把事件放入相关订阅的队列
    ///
    /// 必须在注册中心写锁内调用；返回需要排空的订阅。
    pub fn enqueue(&self, reference: &ServiceReference, change: Change<'_>) -> Vec<Arc<Subscription>> {
        let type_id = reference.service_type().type_id();
        let subscriptions = self.subscriptions.read();
        let mut touched = Vec::new();
        let mut dead = false;

        for subscription in subscriptions.iter() {
            if subscription.is_dead() {
                dead = true;
                continue;
            }
            if subscription.type_id != type_id || !subscription.is_active() {
                continue;
            }
            let now = reference.with_properties(|props| subscription.filter.matches(props));
            let kind = match change {
                Change::Registered if now => Some(ServiceEventKind::Added),
                Change::Unregistered if now => Some(ServiceEventKind::Removed),
                Change::Modified { previous } => {
                    match (subscription.filter.matches(previous), now) {
                        (true, true) => Some(ServiceEventKind::Modified),
                        (false, true) => Some(ServiceEventKind::Added),
                        (true, false) => Some(ServiceEventKind::Removed),
                        (false, false) => None,
                    }
                }
                _ => None,
            };
            if let Some(kind) = kind {
                subscription.push(kind, reference);
                touched.push(subscription.clone());
            }
        }
        drop(subscriptions);

        if dead {
            let mut subscriptions = self.subscriptions.write();
            self.retain_live(&mut subscriptions);
        }
        touched
    }

    /// 移除监听者已被释放的弱订阅
    fn retain_live(&self, subscriptions: &mut Vec<Arc<Subscription>>) {
        subscriptions.retain(|s| {
            if !s.is_dead() {
                return true;
            }
            s.active.store(false, Ordering::Release);
            self.stats.pruned.fetch_add(1, Ordering::Relaxed);
            debug!(
                subscription_id = s.id,
                service_type = s.type_name,
                "监听者已释放，移除弱订阅"
            );
            false
        });
    }

    /// 排空若干订阅的队列（在任何注册中心锁之外调用）
    pub fn drain_all(&self, touched: Vec<Arc<Subscription>>) {
        let mut seen = HashSet::new();
        for subscription in touched {
            if seen.insert(subscription.id) {
                self.drain(&subscription);
            }
        }
    }

    /// 排空单个订阅的队列
    ///
    /// 不在监听回调内时等待投递锁，返回时队列中此前入队的事件均已送达。
    /// 在回调内重入时只尝试加锁：锁被占用（包括被本线程外层占用）则由
    /// 持锁者投递，从而不会有两个投递线程互相等待。
    pub fn drain(&self, subscription: &Arc<Subscription>) {
        let reentrant = CALLBACK_DEPTH.with(|depth| depth.get() > 0);
        let mut held = if reentrant {
            subscription.delivery.try_lock()
        } else {
            Some(subscription.delivery.lock())
        };

        while let Some(guard) = held {
            loop {
                let next = subscription.queue.lock().pop_front();
                match next {
                    Some(event) => self.deliver(subscription, event),
                    None => break,
                }
            }
            drop(guard);

            // 释放锁之前入队、且入队者没能拿到锁的事件
            if subscription.queue.lock().is_empty() {
                return;
            }
            held = subscription.delivery.try_lock();
        }
    }

    fn deliver(&self, subscription: &Arc<Subscription>, event: PendingEvent) {
        if !subscription.is_active() {
            return;
        }

        let listener = match subscription.listener {
            ListenerRef::Strong(ref listener) => listener.clone(),
            ListenerRef::Weak(ref weak) => match weak.upgrade() {
                Some(listener) => listener,
                None => {
                    self.prune(subscription);
                    return;
                }
            },
        };

        trace!(
            subscription_id = subscription.id,
            service_id = event.reference.id(),
            kind = ?event.kind,
            "投递服务事件"
        );

        let reference = &event.reference;
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        let outcome = catch_unwind(AssertUnwindSafe(|| match event.kind {
            ServiceEventKind::Added => listener.service_added(reference),
            ServiceEventKind::Modified => listener.service_modified(reference),
            ServiceEventKind::Removed => listener.service_removed(reference),
        }));
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() - 1));

        match outcome {
            Ok(Ok(())) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription_id = subscription.id,
                    service_id = reference.id(),
                    kind = ?event.kind,
                    error = %e,
                    "服务监听者处理失败"
                );
            }
            Err(_) => {
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription_id = subscription.id,
                    service_id = reference.id(),
                    kind = ?event.kind,
                    "服务监听者发生 panic"
                );
            }
        }
    }

    fn prune(&self, subscription: &Arc<Subscription>) {
        subscription.active.store(false, Ordering::Release);
        subscription.queue.lock().clear();
        let removed = {
            let mut subscriptions = self.subscriptions.write();
            let before = subscriptions.len();
            subscriptions.retain(|s| s.id != subscription.id);
            before != subscriptions.len()
        };
        if !removed {
            return;
        }
        self.stats.pruned.fetch_add(1, Ordering::Relaxed);
        debug!(
            subscription_id = subscription.id,
            service_type = subscription.type_name,
            "监听者已释放，移除弱订阅"
        );
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }
}
