//! 服务类型、服务引用与服务注册
//!
//! - [`ServiceType`]：按 Rust 类型标识的能力类型，`ServiceType::of::<T>()`
//!   接受 `Arc<T>` 形式的实例，`T` 可以是 trait 对象
//! - [`ServiceReference`]：消费方看到的只读视图，注销后 `get` 返回 `None`
//! - [`ServiceRegistration`]：注册方持有的句柄，可修改属性或注销
//! - [`PendingService`]：尚未提交的注册请求，用于批量原子发布

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;

use super::registry::RegistryInner;
use crate::utils::{CoreError, Result};

/// 模块 ID（服务的所属模块）
pub type ModuleId = u64;

/// 服务属性（扁平的键值表）
pub type Properties = BTreeMap<String, Value>;

/// 类型擦除后的服务实例，内部保存的是 `Arc<T>`
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// 构造 [`Properties`]
///
/// ```
/// use chips_runtime::service_props;
///
/// let props = service_props! { "lang" => "zh", "weight" => 3 };
/// assert_eq!(props.len(), 2);
/// ```
#[macro_export]
macro_rules! service_props {
    () => { $crate::registry::Properties::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut props = $crate::registry::Properties::new();
        $( props.insert($key.to_string(), $crate::serde_json::json!($value)); )+
        props
    }};
}

// ============================================================================
// 服务类型
// ============================================================================

/// 服务能力类型
#[derive(Clone, Copy)]
pub struct ServiceType {
    name: &'static str,
    type_id: TypeId,
    accepts: fn(&(dyn Any + Send + Sync)) -> bool,
}

fn accepts_arc<T: ?Sized + 'static>(instance: &(dyn Any + Send + Sync)) -> bool {
    instance.is::<Arc<T>>()
}

impl ServiceType {
    /// 以 `T` 为能力类型，注册时实例必须是 `Arc<T>`
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<Arc<T>>(),
            accepts: accepts_arc::<T>,
        }
    }

    /// 类型名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 类型标识
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// 判断实例是否满足此类型
    pub fn accepts(&self, instance: &(dyn Any + Send + Sync)) -> bool {
        (self.accepts)(instance)
    }
}

impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceType").field(&self.name).finish()
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ============================================================================
// 服务引用
// ============================================================================

struct ServiceRecord {
    id: u64,
    service_type: ServiceType,
    rank: i32,
    owner: Option<ModuleId>,
    properties: RwLock<Properties>,
    instance: RwLock<Option<ServiceInstance>>,
    registered: AtomicBool,
}

/// 服务引用
///
/// 对注册记录的只读共享视图。引用对服务实例只是查找关系：
/// 注册被注销后实例即被释放，[`ServiceReference::get`] 返回 `None`。
#[derive(Clone)]
pub struct ServiceReference {
    record: Arc<ServiceRecord>,
}

impl ServiceReference {
    pub(crate) fn new(
        id: u64,
        service_type: ServiceType,
        instance: ServiceInstance,
        properties: Properties,
        rank: i32,
        owner: Option<ModuleId>,
    ) -> Self {
        Self {
            record: Arc::new(ServiceRecord {
                id,
                service_type,
                rank,
                owner,
                properties: RwLock::new(properties),
                instance: RwLock::new(Some(instance)),
                registered: AtomicBool::new(true),
            }),
        }
    }

    /// 注册 ID（进程内单调递增，永不复用）
    pub fn id(&self) -> u64 {
        self.record.id
    }

    /// 服务类型
    pub fn service_type(&self) -> ServiceType {
        self.record.service_type
    }

    /// 排序等级（越大越优先）
    pub fn rank(&self) -> i32 {
        self.record.rank
    }

    /// 所属模块
    pub fn owner(&self) -> Option<ModuleId> {
        self.record.owner
    }

    /// 属性快照
    pub fn properties(&self) -> Properties {
        self.record.properties.read().clone()
    }

    /// 读取单个属性
    pub fn property(&self, key: &str) -> Option<Value> {
        self.record.properties.read().get(key).cloned()
    }

    /// 是否仍处于注册状态
    pub fn is_registered(&self) -> bool {
        self.record.registered.load(Ordering::Acquire)
    }

    /// 获取服务实例
    ///
    /// 类型不符或注册已注销时返回 `None`。
    pub fn get<T: ?Sized + 'static>(&self) -> Option<Arc<T>> {
        self.record
            .instance
            .read()
            .as_ref()
            .and_then(|instance| instance.downcast_ref::<Arc<T>>())
            .cloned()
    }

    pub(crate) fn with_properties<R>(&self, f: impl FnOnce(&Properties) -> R) -> R {
        f(&self.record.properties.read())
    }

    pub(crate) fn replace_properties(&self, properties: Properties) -> Properties {
        std::mem::replace(&mut *self.record.properties.write(), properties)
    }

    /// 标记为已注销并释放实例；返回是否是首次标记
    pub(crate) fn mark_unregistered(&self) -> bool {
        let first = self.record.registered.swap(false, Ordering::AcqRel);
        if first {
            self.record.instance.write().take();
        }
        first
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ServiceReference {}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.id())
            .field("service_type", &self.service_type())
            .field("rank", &self.rank())
            .field("owner", &self.owner())
            .field("registered", &self.is_registered())
            .finish()
    }
}

// ============================================================================
// 服务注册句柄
// ============================================================================

/// 服务注册句柄
///
/// 由注册方持有。注销是幂等且终结的：第二次调用不产生任何效果，
/// 也不会再次通知监听者。
#[derive(Clone)]
pub struct ServiceRegistration {
    reference: ServiceReference,
    registry: Weak<RegistryInner>,
}

impl ServiceRegistration {
    pub(crate) fn new(reference: ServiceReference, registry: Weak<RegistryInner>) -> Self {
        Self {
            reference,
            registry,
        }
    }

    /// 注册 ID
    pub fn id(&self) -> u64 {
        self.reference.id()
    }

    /// 对应的服务引用
    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    /// 是否仍处于注册状态
    pub fn is_registered(&self) -> bool {
        self.reference.is_registered()
    }

    /// 注销服务
    ///
    /// 返回本次调用是否真正移除了服务。
    pub fn unregister(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.unregister(self.id()),
            None => self.reference.mark_unregistered(),
        }
    }

    /// 替换服务属性
    ///
    /// # Errors
    ///
    /// 注册已注销时返回 `RegistrationUnavailable`
    pub fn set_properties(&self, properties: Properties) -> Result<()> {
        match self.registry.upgrade() {
            Some(registry) => registry.set_properties(self.id(), properties),
            None => Err(CoreError::RegistrationUnavailable(self.id())),
        }
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceRegistration")
            .field(&self.reference)
            .finish()
    }
}

// ============================================================================
// 待提交的注册
// ============================================================================

/// 待提交的服务注册
///
/// ```
/// use std::sync::Arc;
/// use chips_runtime::registry::PendingService;
/// use chips_runtime::service_props;
///
/// let pending = PendingService::new(Arc::new(String::from("hello")))
///     .properties(service_props! { "lang" => "en" })
///     .rank(10);
/// assert_eq!(pending.service_type().name(), "alloc::string::String");
/// ```
pub struct PendingService {
    pub(crate) service_type: ServiceType,
    pub(crate) instance: ServiceInstance,
    pub(crate) properties: Properties,
    pub(crate) rank: i32,
    pub(crate) owner: Option<ModuleId>,
}

impl PendingService {
    /// 以 `T` 为类型创建注册请求
    pub fn new<T: ?Sized + Send + Sync + 'static>(instance: Arc<T>) -> Self {
        Self::dynamic(ServiceType::of::<T>(), Arc::new(instance))
    }

    /// 以显式类型和类型擦除的实例创建注册请求
    ///
    /// 实例是否满足类型在提交时检查。
    pub fn dynamic(service_type: ServiceType, instance: ServiceInstance) -> Self {
        Self {
            service_type,
            instance,
            properties: Properties::new(),
            rank: 0,
            owner: None,
        }
    }

    /// 设置属性
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// 设置单个属性
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 设置排序等级
    pub fn rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    /// 设置所属模块
    pub fn owner(mut self, owner: ModuleId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// 声明的服务类型
    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }
}
