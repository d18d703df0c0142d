//! 代码单元
//!
//! 每个修订版持有一个独立的代码单元（[`ModuleCode`]），由 [`CodeLoader`]
//! 根据模块描述中的 `entry` 创建。代码单元负责：
//!
//! - 提供声明式的端点表
//! - 激活时创建模块实例，停止时拆除实例
//! - 修订版被丢弃时释放自身
//!
//! 模块实例保存在 [`InstanceSlot`] 中，端点调用时从槽位取当前实例，
//! 因此模块重启后旧的调用器仍然可用。

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::metadata::ModuleManifest;
use crate::endpoint::{EndpointDeclaration, MethodRef};
use crate::registry::{
    ListenerSubscription, ModuleId, PropertyFilter, Properties, ServiceListener, ServiceRegistration,
    ServiceRegistry, ServiceType, SubscriptionOptions,
};
use crate::utils::{CoreError, Result};

/// 类型擦除的模块实例
pub type ModuleInstance = Arc<dyn Any + Send + Sync>;

/// 模块当前的实例与方法表
pub struct ActiveInstance {
    pub(crate) instance: ModuleInstance,
    pub(crate) methods: HashMap<String, MethodRef>,
}

impl ActiveInstance {
    pub(crate) fn new(instance: ModuleInstance, methods: HashMap<String, MethodRef>) -> Self {
        Self { instance, methods }
    }

    /// 按签名取方法及实例
    pub(crate) fn target(&self, signature: &str) -> Option<(ModuleInstance, MethodRef)> {
        self.methods
            .get(signature)
            .map(|method| (self.instance.clone(), method.clone()))
    }
}

/// 实例槽位，模块的所有端点共享
pub type InstanceSlot = Arc<ArcSwapOption<ActiveInstance>>;

// ============================================================================
// 代码单元
// ============================================================================

/// 模块代码单元
#[async_trait]
pub trait ModuleCode: Send + Sync {
    /// 声明的端点表
    fn endpoints(&self) -> Vec<EndpointDeclaration>;

    /// 创建模块实例
    ///
    /// 可以通过 `context` 注册额外的服务或订阅，这些注册在模块停止时自动撤销。
    async fn activate(&self, context: &ModuleContext) -> anyhow::Result<ModuleInstance>;

    /// 拆除模块实例
    ///
    /// 调用时模块的服务已全部注销。
    async fn deactivate(&self, _instance: ModuleInstance) -> anyhow::Result<()> {
        Ok(())
    }

    /// 释放代码单元
    fn release(&self) {}
}

/// 代码加载器
#[async_trait]
pub trait CodeLoader: Send + Sync {
    /// 为修订版创建新的代码单元
    async fn load(
        &self,
        manifest: &ModuleManifest,
        location: Option<&Path>,
    ) -> Result<Arc<dyn ModuleCode>>;
}

type CodeFactory =
    Arc<dyn Fn(&ModuleManifest) -> anyhow::Result<Arc<dyn ModuleCode>> + Send + Sync>;

/// 进程内的代码单元表：entry -> 工厂
///
/// ```
/// use std::sync::Arc;
/// use chips_runtime::module::runtime::{ModuleCode, ModuleContext, ModuleInstance, StaticCodeLoader};
/// use chips_runtime::endpoint::EndpointDeclaration;
///
/// struct Empty;
///
/// #[async_trait::async_trait]
/// impl ModuleCode for Empty {
///     fn endpoints(&self) -> Vec<EndpointDeclaration> {
///         Vec::new()
///     }
///     async fn activate(&self, _ctx: &ModuleContext) -> anyhow::Result<ModuleInstance> {
///         Ok(Arc::new(()))
///     }
/// }
///
/// let loader = StaticCodeLoader::new().with_entry("empty", |_| Ok(Arc::new(Empty)));
/// assert!(loader.contains("empty"));
/// ```
#[derive(Default)]
pub struct StaticCodeLoader {
    factories: RwLock<HashMap<String, CodeFactory>>,
}

impl StaticCodeLoader {
    /// 创建空的代码单元表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册入口
    pub fn register<F>(&self, entry: impl Into<String>, factory: F)
    where
        F: Fn(&ModuleManifest) -> anyhow::Result<Arc<dyn ModuleCode>> + Send + Sync + 'static,
    {
        let entry = entry.into();
        debug!(entry = %entry, "注册代码单元入口");
        self.factories.write().insert(entry, Arc::new(factory));
    }

    /// 注册入口（构建器形式）
    pub fn with_entry<F>(self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ModuleManifest) -> anyhow::Result<Arc<dyn ModuleCode>> + Send + Sync + 'static,
    {
        self.register(entry, factory);
        self
    }

    /// 移除入口
    pub fn unregister(&self, entry: &str) -> bool {
        self.factories.write().remove(entry).is_some()
    }

    /// 是否注册了入口
    pub fn contains(&self, entry: &str) -> bool {
        self.factories.read().contains_key(entry)
    }
}

#[async_trait]
impl CodeLoader for StaticCodeLoader {
    async fn load(
        &self,
        manifest: &ModuleManifest,
        _location: Option<&Path>,
    ) -> Result<Arc<dyn ModuleCode>> {
        let factory = self
            .factories
            .read()
            .get(&manifest.entry)
            .cloned()
            .ok_or_else(|| CoreError::CodeLoadFailed {
                entry: manifest.entry.clone(),
                reason: "未注册的入口".to_string(),
            })?;

        factory(manifest).map_err(|e| CoreError::CodeLoadFailed {
            entry: manifest.entry.clone(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// 模块上下文
// ============================================================================

/// 模块激活时可用的上下文
///
/// 通过上下文注册的服务和订阅都归属于该模块。
#[derive(Clone)]
pub struct ModuleContext {
    module_id: ModuleId,
    manifest: Arc<ModuleManifest>,
    registry: ServiceRegistry,
}

impl ModuleContext {
    pub(crate) fn new(module_id: ModuleId, manifest: ModuleManifest, registry: ServiceRegistry) -> Self {
        Self {
            module_id,
            manifest: Arc::new(manifest),
            registry,
        }
    }

    /// 所属模块 ID
    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    /// 模块描述
    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    /// 读取头信息
    pub fn header(&self, key: &str) -> Option<&str> {
        self.manifest.headers.get(key).map(String::as_str)
    }

    /// 共享的服务注册中心
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// 注册归属于本模块的服务
    pub fn register_service<T: ?Sized + Send + Sync + 'static>(
        &self,
        instance: Arc<T>,
        properties: Properties,
        rank: i32,
    ) -> Result<ServiceRegistration> {
        self.registry
            .register(instance, properties, rank, Some(self.module_id))
    }

    /// 订阅服务变化，模块停止时自动取消
    pub fn subscribe(
        &self,
        service_type: ServiceType,
        filter: PropertyFilter,
        listener: Arc<dyn ServiceListener>,
    ) -> ListenerSubscription {
        self.registry.subscribe(
            service_type,
            filter,
            listener,
            SubscriptionOptions::default().owned_by(self.module_id),
        )
    }

    /// 查找服务
    pub fn lookup_service<T: ?Sized + 'static>(&self, filter: &PropertyFilter) -> Option<Arc<T>> {
        self.registry.lookup_service::<T>(filter)
    }
}
