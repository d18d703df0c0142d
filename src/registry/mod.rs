//! 服务注册中心
//!
//! 模块把带类型和属性的能力发布到共享注册中心，其他模块按类型和属性过滤器
//! 动态发现，无需编译期关联。
//!
//! - `service`: 服务类型、引用与注册句柄
//! - `filter`: 扁平属性上的相等/子集过滤
//! - `store`: 按 (rank 降序, id 升序) 有序的存储
//! - `listener`: 监听分发器
//! - `registry`: 对外的 [`ServiceRegistry`]

pub mod filter;
pub mod listener;
#[allow(clippy::module_inception)]
pub mod registry;
pub mod service;
mod store;

pub use filter::PropertyFilter;
pub use listener::{
    DispatchStatsSnapshot, FnListener, ListenerSubscription, ServiceEventKind, ServiceListener,
    SubscriptionOptions,
};
pub use registry::ServiceRegistry;
pub use service::{
    ModuleId, PendingService, Properties, ServiceInstance, ServiceReference, ServiceRegistration,
    ServiceType,
};
