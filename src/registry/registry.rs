//! 服务注册中心
//!
//! 运行时唯一的服务注册中心实例，通过构造参数显式传给需要它的组件。
//! 注册、注销、查找都是纯内存操作：读写锁保护存储，多个查找可并发，
//! 变更互斥。监听通知在写锁释放后投递。

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::filter::PropertyFilter;
use super::listener::{
    Change, DispatchStatsSnapshot, ListenerDispatcher, ListenerSubscription, ServiceListener,
    SubscriptionOptions,
};
use super::service::{
    ModuleId, PendingService, Properties, ServiceInstance, ServiceReference, ServiceRegistration,
    ServiceType,
};
use super::store::ServiceStore;
use crate::core::config::RegistryConfig;
use crate::utils::{CoreError, IdSequence, Result};

pub(crate) struct RegistryInner {
    store: RwLock<ServiceStore>,
    pub(crate) dispatcher: ListenerDispatcher,
    ids: IdSequence,
    config: RegistryConfig,
}

impl RegistryInner {
    pub(crate) fn unregister(&self, id: u64) -> bool {
        let touched = {
            let mut store = self.store.write();
            let Some(reference) = store.remove(id) else {
                return false;
            };
            reference.mark_unregistered();
            debug!(
                service_id = id,
                service_type = reference.service_type().name(),
                "注销服务"
            );
            self.dispatcher.enqueue(&reference, Change::Unregistered)
        };
        self.dispatcher.drain_all(touched);
        true
    }

    pub(crate) fn set_properties(&self, id: u64, properties: Properties) -> Result<()> {
        let touched = {
            let store = self.store.write();
            let reference = store
                .get(id)
                .ok_or(CoreError::RegistrationUnavailable(id))?;
            let previous = reference.replace_properties(properties);
            debug!(service_id = id, "更新服务属性");
            self.dispatcher.enqueue(
                &reference,
                Change::Modified {
                    previous: &previous,
                },
            )
        };
        self.dispatcher.drain_all(touched);
        Ok(())
    }
}

/// 服务注册中心
///
/// 克隆共享同一份存储。
///
/// # 示例
///
/// ```
/// use std::sync::Arc;
/// use chips_runtime::registry::{PropertyFilter, ServiceRegistry};
/// use chips_runtime::service_props;
///
/// let registry = ServiceRegistry::new();
/// let reg = registry
///     .register(Arc::new(String::from("hello")), service_props! { "lang" => "en" }, 0, None)
///     .unwrap();
///
/// let found = registry.lookup_service::<String>(&PropertyFilter::any().with("lang", "en"));
/// assert_eq!(found.as_deref().map(String::as_str), Some("hello"));
///
/// assert!(reg.unregister());
/// assert!(!reg.unregister());
/// ```
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// 使用默认配置创建注册中心
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// 使用指定配置创建注册中心
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store: RwLock::new(ServiceStore::new()),
                dispatcher: ListenerDispatcher::new(),
                ids: IdSequence::new(),
                config,
            }),
        }
    }

    // ==================== 注册 ====================

    /// 注册服务
    ///
    /// # Arguments
    ///
    /// * `instance` - 服务实例，能力类型为 `T`
    /// * `properties` - 服务属性
    /// * `rank` - 排序等级（越大越优先）
    /// * `owner` - 所属模块
    pub fn register<T: ?Sized + Send + Sync + 'static>(
        &self,
        instance: Arc<T>,
        properties: Properties,
        rank: i32,
        owner: Option<ModuleId>,
    ) -> Result<ServiceRegistration> {
        let mut pending = PendingService::new(instance).properties(properties).rank(rank);
        pending.owner = owner;
        self.register_pending(pending)
    }

    /// 以显式类型注册类型擦除的实例
    ///
    /// 实例必须是 `service_type` 对应的 `Arc<T>`，否则返回 `InvalidRegistration`。
    pub fn register_dyn(
        &self,
        service_type: ServiceType,
        instance: ServiceInstance,
        properties: Properties,
        rank: i32,
        owner: Option<ModuleId>,
    ) -> Result<ServiceRegistration> {
        let mut pending = PendingService::dynamic(service_type, instance)
            .properties(properties)
            .rank(rank);
        pending.owner = owner;
        self.register_pending(pending)
    }

    /// 提交单个待注册服务
    ///
    /// # Errors
    ///
    /// 实例不满足声明的类型时返回 `InvalidRegistration`
    pub fn register_pending(&self, pending: PendingService) -> Result<ServiceRegistration> {
        let mut registrations = self.register_batch(vec![pending])?;
        registrations
            .pop()
            .ok_or_else(|| CoreError::Internal("批量注册未返回结果".to_string()))
    }

    /// 批量注册服务
    ///
    /// 先校验全部实例，再在同一次写锁内插入：外部观察者要么看到全部服务，
    /// 要么一个也看不到。任何一个实例不满足类型时整批失败。
    pub fn register_batch(&self, batch: Vec<PendingService>) -> Result<Vec<ServiceRegistration>> {
        for pending in &batch {
            if !pending.service_type.accepts(pending.instance.as_ref()) {
                return Err(CoreError::InvalidRegistration {
                    service_type: pending.service_type.name().to_string(),
                    reason: format!(
                        "实例不是 Arc<{}>",
                        pending.service_type.name()
                    ),
                });
            }
        }

        let mut registrations = Vec::with_capacity(batch.len());
        let mut touched = Vec::new();
        {
            let mut store = self.inner.store.write();
            for pending in batch {
                let reference = ServiceReference::new(
                    self.inner.ids.next_id(),
                    pending.service_type,
                    pending.instance,
                    pending.properties,
                    pending.rank,
                    pending.owner,
                );
                store.insert(reference.clone());
                debug!(
                    service_id = reference.id(),
                    service_type = reference.service_type().name(),
                    rank = reference.rank(),
                    owner = ?reference.owner(),
                    "注册服务"
                );
                touched.extend(self.inner.dispatcher.enqueue(&reference, Change::Registered));
                registrations.push(ServiceRegistration::new(
                    reference,
                    Arc::downgrade(&self.inner),
                ));
            }
        }
        self.inner.dispatcher.drain_all(touched);
        Ok(registrations)
    }

    // ==================== 注销 ====================

    /// 按注册 ID 注销服务（幂等）
    pub fn unregister(&self, id: u64) -> bool {
        self.inner.unregister(id)
    }

    /// 注销某模块的全部服务，返回注销数量
    ///
    /// 所有服务在同一次写锁内移除。
    pub fn unregister_owner(&self, owner: ModuleId) -> usize {
        let mut touched = Vec::new();
        let count = {
            let mut store = self.inner.store.write();
            let ids = store.ids_owned_by(owner);
            for id in ids.iter().rev() {
                if let Some(reference) = store.remove(*id) {
                    reference.mark_unregistered();
                    touched.extend(self.inner.dispatcher.enqueue(&reference, Change::Unregistered));
                }
            }
            ids.len()
        };
        if count > 0 {
            debug!(module_id = owner, count, "注销模块的全部服务");
        }
        self.inner.dispatcher.drain_all(touched);
        count
    }

    /// 替换服务属性
    pub fn set_properties(&self, id: u64, properties: Properties) -> Result<()> {
        self.inner.set_properties(id, properties)
    }

    // ==================== 查找 ====================

    /// 查找最佳匹配（rank 最高、同 rank 时 ID 最小）
    pub fn lookup(&self, service_type: &ServiceType, filter: &PropertyFilter) -> Option<ServiceReference> {
        self.inner
            .store
            .read()
            .find(service_type.type_id(), filter)
            .next()
            .cloned()
    }

    /// 查找全部匹配，顺序与 [`lookup`](Self::lookup) 一致
    pub fn lookup_all(&self, service_type: &ServiceType, filter: &PropertyFilter) -> Vec<ServiceReference> {
        self.inner
            .store
            .read()
            .find(service_type.type_id(), filter)
            .cloned()
            .collect()
    }

    /// 查找最佳匹配的服务实例
    pub fn lookup_service<T: ?Sized + 'static>(&self, filter: &PropertyFilter) -> Option<Arc<T>> {
        self.lookup(&ServiceType::of::<T>(), filter)
            .and_then(|reference| reference.get::<T>())
    }

    /// 查找全部匹配的服务实例
    pub fn lookup_services<T: ?Sized + 'static>(&self, filter: &PropertyFilter) -> Vec<Arc<T>> {
        self.lookup_all(&ServiceType::of::<T>(), filter)
            .iter()
            .filter_map(|reference| reference.get::<T>())
            .collect()
    }

    /// 按注册 ID 获取引用
    pub fn get_reference(&self, id: u64) -> Option<ServiceReference> {
        self.inner.store.read().get(id)
    }

    /// 某模块拥有的服务
    pub fn services_owned_by(&self, owner: ModuleId) -> Vec<ServiceReference> {
        let store = self.inner.store.read();
        store
            .ids_owned_by(owner)
            .into_iter()
            .filter_map(|id| store.get(id))
            .collect()
    }

    /// 当前注册的服务总数
    pub fn service_count(&self) -> usize {
        self.inner.store.read().len()
    }

    /// 某类型当前注册的服务数
    pub fn service_count_for(&self, service_type: &ServiceType) -> usize {
        self.inner.store.read().count_for(service_type.type_id())
    }

    // ==================== 监听 ====================

    /// 订阅服务变化
    ///
    /// 启用补发时，已存在的匹配服务先以 `added` 事件投递，之后才是新的变化。
    pub fn subscribe(
        &self,
        service_type: ServiceType,
        filter: PropertyFilter,
        listener: Arc<dyn ServiceListener>,
        options: SubscriptionOptions,
    ) -> ListenerSubscription {
        let replay = options.replay.unwrap_or(self.inner.config.replay_on_subscribe);
        let subscription = {
            let store = self.inner.store.read();
            let subscription =
                self.inner
                    .dispatcher
                    .add(service_type, filter.clone(), listener, options);
            if replay {
                self.inner
                    .dispatcher
                    .replay(&subscription, store.find(service_type.type_id(), &filter));
            }
            subscription
        };
        self.inner.dispatcher.drain(&subscription);
        ListenerSubscription::new(subscription.id(), Arc::downgrade(&self.inner))
    }

    /// 取消订阅
    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        self.inner.dispatcher.unsubscribe(subscription_id)
    }

    /// 取消某模块的全部订阅
    pub fn unsubscribe_owner(&self, owner: ModuleId) -> usize {
        self.inner.dispatcher.unsubscribe_owner(owner)
    }

    /// 当前订阅数
    pub fn subscription_count(&self) -> usize {
        self.inner.dispatcher.len()
    }

    /// 分发统计
    pub fn dispatch_stats(&self) -> DispatchStatsSnapshot {
        self.inner.dispatcher.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FnListener;
    use crate::service_props;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Codec: Send + Sync {
        fn name(&self) -> &'static str;
    }

    struct Json;
    impl Codec for Json {
        fn name(&self) -> &'static str {
            "json"
        }
    }

    struct Yaml;
    impl Codec for Yaml {
        fn name(&self) -> &'static str {
            "yaml"
        }
    }

    fn counting_listener(added: Arc<AtomicUsize>, removed: Arc<AtomicUsize>) -> Arc<dyn ServiceListener> {
        Arc::new(FnListener::new(
            move |_| {
                added.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move |_| {
                removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ))
    }

    #[test]
    fn test_register_and_lookup_trait_object() {
        let registry = ServiceRegistry::new();
        registry
            .register::<dyn Codec>(Arc::new(Json), service_props! { "format" => "json" }, 0, None)
            .unwrap();
        registry
            .register::<dyn Codec>(Arc::new(Yaml), service_props! { "format" => "yaml" }, 0, None)
            .unwrap();

        let codec = registry
            .lookup_service::<dyn Codec>(&PropertyFilter::any().with("format", "yaml"))
            .unwrap();
        assert_eq!(codec.name(), "yaml");
        assert_eq!(registry.lookup_services::<dyn Codec>(&PropertyFilter::any()).len(), 2);
    }

    #[test]
    fn test_register_dynamic_type_mismatch() {
        let registry = ServiceRegistry::new();
        let err = registry
            .register_dyn(ServiceType::of::<dyn Codec>(), Arc::new(42u32), Properties::new(), 0, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRegistration { .. }));
        assert_eq!(registry.service_count(), 0);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let registry = ServiceRegistry::new();
        let batch = vec![
            PendingService::new(Arc::new(String::from("ok"))),
            PendingService::dynamic(ServiceType::of::<String>(), Arc::new(1u8)),
        ];
        assert!(registry.register_batch(batch).is_err());
        assert_eq!(registry.service_count(), 0);
    }

    #[test]
    fn test_rank_ordering() {
        let registry = ServiceRegistry::new();
        let a = registry.register(Arc::new(String::from("a")), Properties::new(), 5, None).unwrap();
        let b = registry.register(Arc::new(String::from("b")), Properties::new(), 1, None).unwrap();
        let c = registry.register(Arc::new(String::from("c")), Properties::new(), 5, None).unwrap();

        let ids: Vec<u64> = registry
            .lookup_all(&ServiceType::of::<String>(), &PropertyFilter::any())
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(ids, vec![a.id(), c.id(), b.id()]);
        assert_eq!(
            registry.lookup(&ServiceType::of::<String>(), &PropertyFilter::any()).unwrap().id(),
            a.id()
        );
    }

    #[test]
    fn test_unregister_is_idempotent_and_notifies_once() {
        let registry = ServiceRegistry::new();
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let listener = counting_listener(added.clone(), removed.clone());
        registry.subscribe(
            ServiceType::of::<String>(),
            PropertyFilter::any(),
            listener,
            SubscriptionOptions::default(),
        );

        let reg = registry.register(Arc::new(String::from("x")), Properties::new(), 0, None).unwrap();
        let reference = reg.reference().clone();
        assert!(reg.unregister());
        assert!(!reg.unregister());
        assert!(!registry.unregister(reg.id()));

        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(reference.get::<String>().is_none());
        assert!(registry.get_reference(reg.id()).is_none());
    }

    #[test]
    fn test_ids_are_never_reissued() {
        let registry = ServiceRegistry::new();
        let first = registry.register(Arc::new(1u32), Properties::new(), 0, None).unwrap();
        first.unregister();
        let second = registry.register(Arc::new(1u32), Properties::new(), 0, None).unwrap();
        assert!(second.id() > first.id());
    }

    #[test]
    fn test_set_properties_after_unregister_fails() {
        let registry = ServiceRegistry::new();
        let reg = registry.register(Arc::new(1u32), Properties::new(), 0, None).unwrap();
        reg.set_properties(service_props! { "a" => 1 }).unwrap();
        assert_eq!(reg.reference().property("a"), Some(json!(1)));

        reg.unregister();
        let err = reg.set_properties(Properties::new()).unwrap_err();
        assert!(matches!(err, CoreError::RegistrationUnavailable(id) if id == reg.id()));
    }

    #[test]
    fn test_subscribe_replays_existing() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(String::from("a")), Properties::new(), 0, None).unwrap();
        registry.register(Arc::new(String::from("b")), Properties::new(), 0, None).unwrap();

        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        registry.subscribe(
            ServiceType::of::<String>(),
            PropertyFilter::any(),
            counting_listener(added.clone(), removed.clone()),
            SubscriptionOptions::default(),
        );
        assert_eq!(added.load(Ordering::SeqCst), 2);

        let quiet = Arc::new(AtomicUsize::new(0));
        registry.subscribe(
            ServiceType::of::<String>(),
            PropertyFilter::any(),
            counting_listener(quiet.clone(), Arc::new(AtomicUsize::new(0))),
            SubscriptionOptions::default().replay(false),
        );
        assert_eq!(quiet.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_can_reenter_registry() {
        let registry = ServiceRegistry::new();
        let inner = registry.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        registry.subscribe(
            ServiceType::of::<String>(),
            PropertyFilter::any(),
            Arc::new(FnListener::new(
                move |r| {
                    let value = r.get::<String>().map(|s| s.to_string()).unwrap_or_default();
                    log.lock().push(format!("+{}", value));
                    // 在回调中注册新服务，不应死锁
                    if value == "first" {
                        inner.register(Arc::new(String::from("second")), Properties::new(), 0, None)?;
                    }
                    Ok(())
                },
                |_| Ok(()),
            )),
            SubscriptionOptions::default(),
        );

        registry.register(Arc::new(String::from("first")), Properties::new(), 0, None).unwrap();
        assert_eq!(*seen.lock(), vec!["+first", "+second"]);
        assert_eq!(registry.service_count(), 2);
    }

    #[test]
    fn test_unregister_owner() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(1u32), Properties::new(), 0, Some(7)).unwrap();
        registry.register(Arc::new(2u32), Properties::new(), 0, Some(7)).unwrap();
        registry.register(Arc::new(3u32), Properties::new(), 0, Some(8)).unwrap();

        assert_eq!(registry.services_owned_by(7).len(), 2);
        assert_eq!(registry.unregister_owner(7), 2);
        assert_eq!(registry.unregister_owner(7), 0);
        assert_eq!(registry.service_count(), 1);
        assert_eq!(registry.service_count_for(&ServiceType::of::<u32>()), 1);
    }

    #[test]
    fn test_subscription_handle_unsubscribe() {
        let registry = ServiceRegistry::new();
        let added = Arc::new(AtomicUsize::new(0));
        let handle = registry.subscribe(
            ServiceType::of::<u32>(),
            PropertyFilter::any(),
            counting_listener(added.clone(), Arc::new(AtomicUsize::new(0))),
            SubscriptionOptions::default(),
        );
        assert_eq!(registry.subscription_count(), 1);
        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());

        registry.register(Arc::new(1u32), Properties::new(), 0, None).unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 0);
    }
}
