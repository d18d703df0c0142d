//! # Chips Runtime - 薯片模块运行时
//!
//! 进程内的模块与服务运行时，提供以下核心功能：
//!
//! - **服务注册中心**: 按类型和属性发布、查找服务，变更时通知订阅者
//! - **模块生命周期**: 模块的安装、解析、启动、停止、刷新与卸载
//! - **端点调用管线**: 把模块方法发布为端点，解析参数后经拦截器链调用
//! - **配置管理**: 统一的配置加载和合并
//! - **日志系统**: 结构化日志记录
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_runtime::{ChipsRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = ChipsRuntime::new(RuntimeConfig::default())?;
//!     runtime.start().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `registry` - 服务注册中心与监听器
//! - `module` - 模块管理相关类型
//! - `endpoint` - 端点、参数解析器、拦截器与调用器
//! - `utils` - 工具函数和错误类型
//! - `core` - 运行时配置
//! - `api` - 公共 API 接口

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod endpoint;
pub mod module;
pub mod registry;
pub mod utils;

#[doc(hidden)]
pub use serde_json;

// 重导出常用类型，方便使用
pub use registry::{
    FnListener, ListenerSubscription, PendingService, Properties, PropertyFilter,
    ServiceListener, ServiceReference, ServiceRegistration, ServiceRegistry, ServiceType,
    SubscriptionOptions,
};

pub use module::{
    CodeLoader, Dependency, Module, ModuleCode, ModuleContext, ModuleEvent, ModuleInfo,
    ModuleInstance, ModuleManager, ModuleManifest, ModuleState, StaticCodeLoader,
};

pub use endpoint::{
    handler, Endpoint, EndpointDeclaration, Interceptor, Invocation, Invoker, Next, Parameter,
    ParameterResolver, Resolution, ResolutionContext,
};

pub use utils::{error_code, generate_id, generate_uuid, CoreError, ModuleRef, Result};
pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{
    EndpointConfig, LogConfig, ModuleConfig, RegistryConfig, RuntimeConfig, RuntimeConfigBuilder,
};
pub use api::sdk::{ChipsRuntime, CoreState, HealthInfo};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
