//! ChipsRuntime SDK
//!
//! 薯片模块运行时的主要对外接口，把服务注册中心、拦截器链、调用环境与
//! 模块管理器装配在一起：
//!
//! - 服务注册：发布、查找、订阅服务
//! - 模块管理：安装、启动、停止、刷新、卸载模块
//! - 端点调用：按属性发现端点并通过拦截器链调用
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_runtime::{ChipsRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::builder()
//!         .module_dir("./modules")
//!         .auto_start(true)
//!         .build();
//!
//!     let runtime = ChipsRuntime::new(config)?;
//!     runtime.start().await?;
//!
//!     // ... 使用运行时 ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::config::RuntimeConfig;
use crate::endpoint::{
    Endpoint, Interceptor, InterceptorChain, InvocationEnv, RequiredArgumentInterceptor,
    ResolutionContext, TracingInterceptor, REQUIRED_ARGUMENT_RANK, TRACING_RANK,
};
use crate::module::manager::ModuleManager;
use crate::module::runtime::{CodeLoader, StaticCodeLoader};
use crate::registry::{
    DispatchStatsSnapshot, Properties, PropertyFilter, ServiceRegistration, ServiceRegistry,
    ServiceType,
};
use crate::utils::{CallStatsSnapshot, CoreError, Result};

// ============================================================================
// 运行时状态
// ============================================================================

/// 运行时状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    /// 已初始化
    Initialized,
    /// 运行中
    Running,
    /// 正在关闭
    ShuttingDown,
    /// 已关闭
    Shutdown,
}

impl CoreState {
    /// 检查是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, CoreState::Initialized)
    }

    /// 检查是否可以关闭
    pub fn can_shutdown(&self) -> bool {
        matches!(self, CoreState::Running)
    }

    /// 检查是否正在运行
    pub fn is_running(&self) -> bool {
        matches!(self, CoreState::Running)
    }
}

// ============================================================================
// ChipsRuntime 主结构体
// ============================================================================

/// 薯片模块运行时
///
/// # 组件
///
/// - `registry`: 服务注册中心，每个运行时一个
/// - `interceptors`: 跟踪注册中心里拦截器服务的调用链
/// - `env`: 所有端点共享的调用环境
/// - `modules`: 模块管理器
///
/// # 生命周期
///
/// 1. `new()` - 装配各组件并注册内置拦截器
/// 2. `start()` - 按配置安装并启动模块目录中的模块
/// 3. `shutdown()` - 按依赖反序停止全部模块
pub struct ChipsRuntime {
    config: RuntimeConfig,
    state: RwLock<CoreState>,
    registry: ServiceRegistry,
    interceptors: InterceptorChain,
    env: InvocationEnv,
    modules: Arc<ModuleManager>,
    builtin_interceptors: Mutex<Vec<ServiceRegistration>>,
    started_at: RwLock<Option<Instant>>,
}

impl ChipsRuntime {
    /// 使用空的进程内代码加载器创建运行时
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_loader(config, Arc::new(StaticCodeLoader::new()))
    }

    /// 使用指定的代码加载器创建运行时
    ///
    /// # Errors
    ///
    /// 配置验证失败时返回 `InvalidConfigValue`
    pub fn with_loader(config: RuntimeConfig, loader: Arc<dyn CodeLoader>) -> Result<Self> {
        config.validate()?;
        info!("初始化薯片模块运行时 v{}", crate::VERSION);

        let registry = ServiceRegistry::with_config(config.registry.clone());
        let interceptors = InterceptorChain::track(&registry);
        debug!("拦截器链初始化完成");

        let mut builtin = Vec::new();
        if config.endpoints.enforce_required {
            let interceptor: Arc<dyn Interceptor> = Arc::new(RequiredArgumentInterceptor);
            builtin.push(registry.register(
                interceptor,
                Self::builtin_props("required-argument"),
                REQUIRED_ARGUMENT_RANK,
                None,
            )?);
        }
        if config.endpoints.trace_calls {
            let interceptor: Arc<dyn Interceptor> = Arc::new(TracingInterceptor);
            builtin.push(registry.register(
                interceptor,
                Self::builtin_props("tracing"),
                TRACING_RANK,
                None,
            )?);
        }
        debug!(count = builtin.len(), "内置拦截器已注册");

        let env = InvocationEnv::new(interceptors.clone(), &config.endpoints);
        let modules = Arc::new(ModuleManager::new(
            registry.clone(),
            env.clone(),
            loader,
            config.modules.clone(),
        ));
        debug!("模块管理器初始化完成");

        info!("薯片模块运行时初始化完成");
        Ok(Self {
            config,
            state: RwLock::new(CoreState::Initialized),
            registry,
            interceptors,
            env,
            modules,
            builtin_interceptors: Mutex::new(builtin),
            started_at: RwLock::new(None),
        })
    }

    fn builtin_props(name: &str) -> Properties {
        let mut props = Properties::new();
        props.insert("interceptor.name".to_string(), Value::from(name));
        props.insert("interceptor.builtin".to_string(), Value::from(true));
        props
    }

    /// 启动运行时
    ///
    /// 开启 `auto_install` 时安装模块目录中的全部模块，开启 `auto_start` 时
    /// 按依赖顺序启动它们。单个模块失败只记录警告。
    pub async fn start(&self) -> Result<()> {
        {
            let state = self.state.read();
            if !state.can_start() {
                return Err(CoreError::InitFailed(format!(
                    "运行时当前状态 {:?} 不允许启动",
                    *state
                )));
            }
        }
        info!("启动薯片模块运行时...");

        if self.config.modules.auto_install {
            let installed = self.modules.install_from_dirs().await?;
            debug!(count = installed.len(), "模块目录安装完成");
        }
        if self.config.modules.auto_start {
            let started = self.modules.start_all().await?;
            debug!(count = started, "模块自动启动完成");
        }

        *self.state.write() = CoreState::Running;
        *self.started_at.write() = Some(Instant::now());
        info!("薯片模块运行时已启动");
        Ok(())
    }

    /// 关闭运行时
    ///
    /// 按依赖反序停止全部运行中的模块，停止失败记录警告后继续。
    /// 未启动或已关闭时静默返回。
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.can_shutdown() {
                return Ok(());
            }
            *state = CoreState::ShuttingDown;
        }
        info!("正在关闭薯片模块运行时...");

        match self.modules.stop_all().await {
            Ok(count) => debug!(count, "所有模块已停止"),
            Err(e) => warn!(error = %e, "停止模块失败"),
        }

        let builtin = std::mem::take(&mut *self.builtin_interceptors.lock());
        for registration in builtin {
            registration.unregister();
        }
        self.interceptors.close();

        *self.state.write() = CoreState::Shutdown;
        info!("薯片模块运行时已关闭");
        Ok(())
    }

    // ========================================================================
    // 端点 API
    // ========================================================================

    /// 按属性查找最优先的端点
    pub fn find_endpoint(&self, filter: &PropertyFilter) -> Option<Arc<Endpoint>> {
        self.registry.lookup_service::<Endpoint>(filter)
    }

    /// 按属性查找全部端点
    pub fn find_endpoints(&self, filter: &PropertyFilter) -> Vec<Arc<Endpoint>> {
        self.registry.lookup_services::<Endpoint>(filter)
    }

    /// 查找端点并以内置解析器调用
    ///
    /// # Errors
    ///
    /// 找不到端点时返回 `EndpointUnavailable`，其余错误来自解析与调用。
    pub async fn call(&self, filter: &PropertyFilter, context: &ResolutionContext) -> Result<Value> {
        let endpoint = self
            .find_endpoint(filter)
            .ok_or_else(|| CoreError::EndpointUnavailable(format!("{:?}", filter)))?;
        endpoint.create_invoker(Vec::new()).call(context).await
    }

    // ========================================================================
    // 访问器
    // ========================================================================

    /// 获取运行时状态
    pub fn state(&self) -> CoreState {
        *self.state.read()
    }

    /// 检查运行时是否正在运行
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// 获取配置
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 获取服务注册中心
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// 获取模块管理器
    pub fn modules(&self) -> &Arc<ModuleManager> {
        &self.modules
    }

    /// 获取拦截器链
    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// 获取调用环境
    pub fn env(&self) -> &InvocationEnv {
        &self.env
    }

    /// 获取运行时间
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.started_at.read().map(|t| t.elapsed())
    }

    /// 获取健康状态
    pub fn health(&self) -> HealthInfo {
        let mut modules_by_state = BTreeMap::new();
        for (state, count) in self.modules.count_by_state() {
            modules_by_state.insert(state.as_str().to_string(), count);
        }

        HealthInfo {
            state: self.state(),
            uptime_secs: self.uptime().map(|d| d.as_secs()),
            modules: self.modules.module_count(),
            modules_by_state,
            services: self.registry.service_count(),
            endpoints: self.registry.service_count_for(&ServiceType::of::<Endpoint>()),
            interceptors: self.interceptors.len(),
            subscriptions: self.registry.subscription_count(),
            calls: self.env.stats(),
            dispatch: self.registry.dispatch_stats(),
        }
    }
}

impl Drop for ChipsRuntime {
    fn drop(&mut self) {
        info!("薯片模块运行时实例被释放");
    }
}

// ============================================================================
// 健康信息
// ============================================================================

/// 健康状态信息
#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    /// 运行时状态
    pub state: CoreState,
    /// 运行时间（秒）
    pub uptime_secs: Option<u64>,
    /// 已安装模块数
    pub modules: usize,
    /// 各状态的模块数
    pub modules_by_state: BTreeMap<String, usize>,
    /// 已注册服务数
    pub services: usize,
    /// 已发布端点数
    pub endpoints: usize,
    /// 拦截器数
    pub interceptors: usize,
    /// 订阅数
    pub subscriptions: usize,
    /// 端点调用统计
    pub calls: CallStatsSnapshot,
    /// 监听器通知统计
    pub dispatch: DispatchStatsSnapshot,
}

// ============================================================================
// 单元测试
// ============================================================================
