//! 模块管理器
//!
//! 驱动模块的安装、解析、启动、停止、刷新与卸载，并在模块激活和停用时
//! 填充、清空服务注册中心。
//!
//! 启动时端点整批注册（全部可见或全部不可见）；停止时先清空实例槽位并
//! 注销模块的全部服务，再拆除实例，任何新的调用都不会到达正在拆除的实例。

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::dependency::DependencyGraph;
use super::lifecycle::{Module, Revision};
use super::metadata::{ModuleEvent, ModuleManifest, ModuleState};
use super::parser::ModuleParser;
use super::runtime::{ActiveInstance, CodeLoader, ModuleCode, ModuleContext, ModuleInstance};
use crate::core::config::ModuleConfig;
use crate::endpoint::{Endpoint, InvocationEnv};
use crate::registry::{ModuleId, PendingService, PropertyFilter, ServiceRegistry, ServiceType};
use crate::utils::{CoreError, IdSequence, Result};

/// 模块事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 已安装模块表
#[derive(Default)]
struct ModuleTable {
    by_id: BTreeMap<ModuleId, Arc<Module>>,
    by_name: HashMap<String, ModuleId>,
    graph: DependencyGraph,
}

impl ModuleTable {
    fn by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.by_name
            .get(name)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }
}

/// 模块管理器
pub struct ModuleManager {
    config: ModuleConfig,
    registry: ServiceRegistry,
    env: InvocationEnv,
    loader: Arc<dyn CodeLoader>,
    table: RwLock<ModuleTable>,
    module_ids: IdSequence,
    revision_ids: IdSequence,
    events: broadcast::Sender<ModuleEvent>,
}

impl ModuleManager {
    /// 创建模块管理器
    ///
    /// # Arguments
    ///
    /// * `registry` - 共享的服务注册中心
    /// * `env` - 端点调用环境
    /// * `loader` - 代码加载器
    /// * `config` - 模块配置
    pub fn new(
        registry: ServiceRegistry,
        env: InvocationEnv,
        loader: Arc<dyn CodeLoader>,
        config: ModuleConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            registry,
            env,
            loader,
            table: RwLock::new(ModuleTable::default()),
            module_ids: IdSequence::new(),
            revision_ids: IdSequence::new(),
            events,
        }
    }

    /// 共享的服务注册中心
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// 模块配置
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// 订阅模块状态变更事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<ModuleEvent> {
        self.events.subscribe()
    }

    // ==================== 查询 ====================

    /// 按 ID 获取模块
    pub fn get_module(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.table.read().by_id.get(&id).cloned()
    }

    /// 按名称获取模块
    pub fn get_module_by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.table.read().by_name(name)
    }

    /// 全部已安装模块，按 ID 排序
    pub fn get_modules(&self) -> Vec<Arc<Module>> {
        self.table.read().by_id.values().cloned().collect()
    }

    /// 已安装的模块数量
    pub fn module_count(&self) -> usize {
        self.table.read().by_id.len()
    }

    /// 各状态的模块数量
    pub fn count_by_state(&self) -> HashMap<ModuleState, usize> {
        let mut counts = HashMap::new();
        for module in self.table.read().by_id.values() {
            *counts.entry(module.state()).or_insert(0) += 1;
        }
        counts
    }

    /// 模块当前发布的端点
    pub fn endpoints(&self, id: ModuleId) -> Vec<Arc<Endpoint>> {
        let endpoint_type = ServiceType::of::<Endpoint>();
        self.registry
            .services_owned_by(id)
            .into_iter()
            .filter(|reference| reference.service_type() == endpoint_type)
            .filter_map(|reference| reference.get::<Endpoint>())
            .collect()
    }

    /// 依赖关系图的快照
    pub fn dependency_graph(&self) -> DependencyGraph {
        self.table.read().graph.clone()
    }

    fn require(&self, id: ModuleId) -> Result<Arc<Module>> {
        self.get_module(id)
            .ok_or_else(|| CoreError::ModuleNotFound(id.to_string()))
    }

    // ==================== 安装 ====================

    /// 从路径安装模块
    ///
    /// `path` 是包含模块描述文件的目录，或描述文件本身。
    #[instrument(skip_all)]
    pub async fn install(&self, path: impl AsRef<Path>) -> Result<Arc<Module>> {
        let path = path.as_ref();
        let manifest_path = if path.is_dir() {
            path.join(&self.config.manifest_file)
        } else {
            path.to_path_buf()
        };

        if !manifest_path.exists() {
            return Err(CoreError::ModuleInstall {
                location: path.display().to_string(),
                reason: format!("找不到模块描述文件 {}", manifest_path.display()),
            });
        }

        let manifest = ModuleParser::parse_file(&manifest_path).await?;
        let location = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.to_path_buf());
        self.install_inner(manifest, Some(location)).await
    }

    /// 从内存中的描述安装模块
    #[instrument(skip(self, manifest), fields(module = %manifest.name))]
    pub async fn install_manifest(&self, manifest: ModuleManifest) -> Result<Arc<Module>> {
        ModuleParser::validate(&manifest)?;
        self.install_inner(manifest, None).await
    }

    async fn install_inner(
        &self,
        manifest: ModuleManifest,
        location: Option<PathBuf>,
    ) -> Result<Arc<Module>> {
        let module = {
            let mut table = self.table.write();
            if table.by_name.contains_key(&manifest.name) {
                return Err(CoreError::ModuleAlreadyInstalled(manifest.name.clone()));
            }
            let deps: Vec<&str> = manifest.dependencies.iter().map(|d| d.name.as_str()).collect();
            table.graph.add_module(&manifest.name, deps)?;

            let id = self.module_ids.next_id();
            let name = manifest.name.clone();
            let revision = Revision::new(self.revision_ids.next_id(), manifest, None);
            let module = Arc::new(Module::new(id, location, revision, self.events.clone()));
            table.by_id.insert(id, module.clone());
            table.by_name.insert(name, id);
            module
        };

        info!(module_id = module.id(), module = %module.name(), "模块已安装");
        self.load_code(&module).await;
        Ok(module)
    }

    /// 为 INSTALLED 模块加载代码单元，成功后进入 RESOLVED
    async fn load_code(&self, module: &Arc<Module>) -> Option<CoreError> {
        let _guard = module.transition.lock().await;
        if module.state() != ModuleState::Installed {
            return None;
        }

        let manifest = module.manifest();
        match self.loader.load(&manifest, module.location()).await {
            Ok(code) => {
                module.attach_code(code);
                module.set_last_error(None);
                module.set_state(ModuleState::Resolved);
                None
            }
            Err(e) => {
                warn!(module_id = module.id(), module = %manifest.name, error = %e, "代码单元加载失败，模块保持 INSTALLED");
                module.set_last_error(Some(e.to_string()));
                Some(e)
            }
        }
    }

    /// 扫描配置的模块目录，安装其中的每个模块
    ///
    /// 只处理包含模块描述文件的子目录；已安装或安装失败的模块记录日志后跳过。
    pub async fn install_from_dirs(&self) -> Result<Vec<Arc<Module>>> {
        let mut installed = Vec::new();

        for dir in &self.config.module_dirs {
            if !dir.exists() {
                debug!(dir = %dir.display(), "模块目录不存在，跳过");
                continue;
            }

            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "无法读取模块目录");
                    continue;
                }
            };

            let mut paths = Vec::new();
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() && path.join(&self.config.manifest_file).exists() {
                    paths.push(path);
                }
            }
            paths.sort();

            for path in paths {
                match self.install(&path).await {
                    Ok(module) => installed.push(module),
                    Err(e) => warn!(path = %path.display(), error = %e, "安装模块失败"),
                }
            }
        }

        info!(count = installed.len(), "模块目录扫描完成");
        Ok(installed)
    }

    /// 重试加载 INSTALLED 模块的代码单元
    ///
    /// 返回解析后的状态；模块不在 INSTALLED 时不做任何事。
    #[instrument(skip(self))]
    pub async fn resolve(&self, id: ModuleId) -> Result<ModuleState> {
        let module = self.require(id)?;
        match self.load_code(&module).await {
            Some(e) => Err(e),
            None => Ok(module.state()),
        }
    }

    // ==================== 启动 ====================

    /// 启动模块
    ///
    /// 只能从 RESOLVED 启动；已经 ACTIVE 时记录警告后直接返回。
    ///
    /// # Errors
    ///
    /// 依赖不满足、实例创建失败或端点注册失败时返回 `ModuleStart`，
    /// 模块回到 RESOLVED，不残留任何已注册的服务。
    #[instrument(skip(self))]
    pub async fn start(&self, id: ModuleId) -> Result<()> {
        let module = self.require(id)?;
        let _guard = module.transition.lock().await;

        match module.state() {
            ModuleState::Resolved => self.start_locked(&module).await,
            ModuleState::Active => {
                warn!(module_id = id, module = %module.name(), "模块已在运行中");
                Ok(())
            }
            state => Err(CoreError::ModuleStart {
                module: module.module_ref(),
                reason: format!("状态 {} 不允许启动", state),
            }),
        }
    }

    fn check_dependencies(&self, manifest: &ModuleManifest) -> std::result::Result<(), String> {
        let table = self.table.read();
        for dependency in manifest.dependencies.iter().filter(|d| d.required) {
            let Some(target) = table.by_name(&dependency.name) else {
                return Err(CoreError::DependencyNotFound(dependency.name.clone()).to_string());
            };
            if !target.is_active() {
                return Err(format!(
                    "依赖模块 '{}' 未激活 ({})",
                    dependency.name,
                    target.state()
                ));
            }
            let version = target.version();
            let matched = semver::Version::parse(&version)
                .map(|v| dependency.version_matches(&v))
                .unwrap_or(false);
            if !matched {
                return Err(CoreError::VersionMismatch {
                    module: dependency.name.clone(),
                    required: dependency.version.clone(),
                    found: version,
                }
                .to_string());
            }
        }
        Ok(())
    }

    async fn start_locked(&self, module: &Arc<Module>) -> Result<()> {
        let revision = module.current_revision();
        let manifest = revision.manifest().clone();

        if let Err(reason) = self.check_dependencies(&manifest) {
            return Err(self.fail_start(module, reason));
        }
        let Some(code) = revision.code().cloned() else {
            return Err(self.fail_start(module, "代码单元未加载".to_string()));
        };

        module.set_state(ModuleState::Starting);
        let context = ModuleContext::new(module.id(), manifest, self.registry.clone());

        let activated = AssertUnwindSafe(code.activate(&context)).catch_unwind().await;
        let instance = match activated {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => return Err(self.rollback_start(module, format!("激活失败: {:#}", e))),
            Err(_) => return Err(self.rollback_start(module, "激活时发生 panic".to_string())),
        };
        module.set_state(ModuleState::Started);

        let mut methods = HashMap::new();
        let mut batch = Vec::new();
        for declaration in code.endpoints() {
            let (metadata, method) = declaration.into_parts();
            let rank = metadata.rank;
            let endpoint = Arc::new(Endpoint::new(
                metadata,
                module.id(),
                module.name(),
                module.slot().clone(),
                self.env.clone(),
            ));
            if methods.insert(endpoint.signature().to_string(), method).is_some() {
                let reason = format!("重复的端点签名 {}", endpoint.signature());
                return Err(self.abort_start(module, &code, instance, reason).await);
            }
            batch.push(
                PendingService::new(endpoint.clone())
                    .properties(endpoint.properties())
                    .rank(rank)
                    .owner(module.id()),
            );
        }

        let endpoint_count = batch.len();
        module
            .slot()
            .store(Some(Arc::new(ActiveInstance::new(instance.clone(), methods))));
        if let Err(e) = self.registry.register_batch(batch) {
            let reason = format!("端点注册失败: {}", e);
            return Err(self.abort_start(module, &code, instance, reason).await);
        }

        module.set_last_error(None);
        module.set_state(ModuleState::Active);
        info!(module_id = module.id(), module = %module.name(), endpoints = endpoint_count, "模块已启动");
        Ok(())
    }

    fn fail_start(&self, module: &Module, reason: String) -> CoreError {
        warn!(module_id = module.id(), module = %module.name(), reason = %reason, "模块启动失败");
        module.set_last_error(Some(reason.clone()));
        CoreError::ModuleStart {
            module: module.module_ref(),
            reason,
        }
    }

    /// 撤销启动过程中的全部注册并回到 RESOLVED
    fn rollback_start(&self, module: &Module, reason: String) -> CoreError {
        self.withdraw(module);
        module.set_state(ModuleState::Resolved);
        self.fail_start(module, reason)
    }

    /// 实例已创建后的启动失败：先清空槽位并撤销注册，再拆除实例
    async fn abort_start(
        &self,
        module: &Module,
        code: &Arc<dyn ModuleCode>,
        instance: ModuleInstance,
        reason: String,
    ) -> CoreError {
        module.slot().store(None);
        self.withdraw(module);
        self.teardown(module, code, instance).await;
        module.set_state(ModuleState::Resolved);
        self.fail_start(module, reason)
    }

    /// 撤销模块名下的全部服务与订阅
    fn withdraw(&self, module: &Module) {
        let services = self.registry.unregister_owner(module.id());
        let subscriptions = self.registry.unsubscribe_owner(module.id());
        debug!(module_id = module.id(), services, subscriptions, "模块注册已撤销");
    }

    /// 拆除实例，错误只记录日志
    async fn teardown(
        &self,
        module: &Module,
        code: &Arc<dyn ModuleCode>,
        instance: ModuleInstance,
    ) -> Option<String> {
        let reason = match AssertUnwindSafe(code.deactivate(instance)).catch_unwind().await {
            Ok(Ok(())) => return None,
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => "停用时发生 panic".to_string(),
        };
        warn!(module_id = module.id(), module = %module.name(), error = %reason, "模块实例拆除失败");
        Some(reason)
    }

    /// 按依赖顺序启动全部 RESOLVED 模块，返回启动成功的数量
    pub async fn start_all(&self) -> Result<usize> {
        let order = self.table.read().graph.load_order()?;
        let mut started = 0;
        for name in order {
            let Some(module) = self.get_module_by_name(&name) else {
                continue;
            };
            if module.state() != ModuleState::Resolved {
                continue;
            }
            match self.start(module.id()).await {
                Ok(()) => started += 1,
                Err(e) => warn!(module = %name, error = %e, "启动模块失败"),
            }
        }
        Ok(started)
    }

    // ==================== 停止 ====================

    /// 停止模块
    ///
    /// 开启 `cascade_stop` 时先停止所有处于运行中的传递依赖方。模块没有在
    /// 运行时不做任何事。
    ///
    /// # Errors
    ///
    /// 实例拆除失败时返回 `ModuleStop`；模块仍然回到 RESOLVED。
    #[instrument(skip(self))]
    pub async fn stop(&self, id: ModuleId) -> Result<()> {
        let module = self.require(id)?;
        self.stop_dependents(&module).await;
        self.stop_one(&module).await
    }

    /// 开启 `cascade_stop` 时停止所有运行中的传递依赖方，由远及近
    async fn stop_dependents(&self, module: &Module) {
        if !self.config.cascade_stop {
            return;
        }
        let dependents = self.table.read().graph.transitive_dependents(&module.name());
        for name in dependents {
            let Some(dependent) = self.get_module_by_name(&name) else {
                continue;
            };
            if !dependent.state().can_stop() {
                continue;
            }
            info!(module = %name, dependency = %module.name(), "依赖模块不再可用，级联停止依赖方");
            if let Err(e) = self.stop_one(&dependent).await {
                warn!(module = %name, error = %e, "级联停止失败");
            }
        }
    }

    async fn stop_one(&self, module: &Arc<Module>) -> Result<()> {
        let _guard = module.transition.lock().await;
        if !module.state().can_stop() {
            debug!(module_id = module.id(), state = %module.state(), "模块未运行，无需停止");
            return Ok(());
        }
        self.stop_locked(module).await
    }

    async fn stop_locked(&self, module: &Arc<Module>) -> Result<()> {
        module.set_state(ModuleState::Stopping);

        let active = module.slot().swap(None);
        self.withdraw(module);

        let mut failure = None;
        if let Some(active) = active {
            match module.current_revision().code().cloned() {
                Some(code) => failure = self.teardown(module, &code, active.instance.clone()).await,
                None => failure = Some("代码单元未加载".to_string()),
            }
        }

        module.set_state(ModuleState::Resolved);
        match failure {
            None => {
                info!(module_id = module.id(), module = %module.name(), "模块已停止");
                Ok(())
            }
            Some(reason) => {
                module.set_last_error(Some(reason.clone()));
                Err(CoreError::ModuleStop {
                    module: module.module_ref(),
                    reason,
                })
            }
        }
    }

    /// 按依赖反序停止全部运行中的模块，返回停止的数量
    pub async fn stop_all(&self) -> Result<usize> {
        let order = self.table.read().graph.unload_order()?;
        let mut stopped = 0;
        for name in order {
            let Some(module) = self.get_module_by_name(&name) else {
                continue;
            };
            if !module.state().can_stop() {
                continue;
            }
            if let Err(e) = self.stop_one(&module).await {
                warn!(module = %name, error = %e, "停止模块失败");
            }
            stopped += 1;
        }
        Ok(stopped)
    }

    // ==================== 刷新 ====================

    /// 以当前描述重新加载代码单元，生成新的修订版
    pub async fn refresh(&self, id: ModuleId) -> Result<()> {
        let module = self.require(id)?;
        let manifest = module.manifest();
        self.replace_revision(&module, manifest).await
    }

    /// 以新的描述更新模块，生成新的修订版
    ///
    /// 模块名称不能改变。
    pub async fn update(&self, id: ModuleId, manifest: ModuleManifest) -> Result<()> {
        let module = self.require(id)?;
        self.replace_revision(&module, manifest).await
    }

    /// 安装新修订版；模块原本 ACTIVE 时在同一次转换内停止并重新启动
    ///
    /// # Errors
    ///
    /// 描述无效、代码加载失败或依赖形成环路时返回 `ModuleRefresh`，模块保持不变；
    /// 重新启动失败时同样返回 `ModuleRefresh`，模块停在 RESOLVED，开启
    /// `cascade_stop` 时运行中的依赖方也随之停止。
    #[instrument(skip(self, module, manifest), fields(module_id = module.id()))]
    async fn replace_revision(&self, module: &Arc<Module>, manifest: ModuleManifest) -> Result<()> {
        let _guard = module.transition.lock().await;
        let refresh_error = |reason: String| CoreError::ModuleRefresh {
            module: module.module_ref(),
            reason,
        };

        if manifest.name != module.name() {
            return Err(refresh_error(format!(
                "模块名称不能从 '{}' 改为 '{}'",
                module.name(),
                manifest.name
            )));
        }
        ModuleParser::validate(&manifest).map_err(|e| refresh_error(e.to_string()))?;

        let code = self
            .loader
            .load(&manifest, module.location())
            .await
            .map_err(|e| refresh_error(e.to_string()))?;

        {
            let deps: Vec<&str> = manifest.dependencies.iter().map(|d| d.name.as_str()).collect();
            if let Err(e) = self.table.write().graph.add_module(&manifest.name, deps) {
                code.release();
                return Err(refresh_error(e.to_string()));
            }
        }

        let was_active = module.state().can_stop();
        if was_active {
            if let Err(e) = self.stop_locked(module).await {
                warn!(module_id = module.id(), error = %e, "刷新时停止模块失败，继续刷新");
            }
        }

        let revision = Revision::new(self.revision_ids.next_id(), manifest, Some(code));
        let revision_id = revision.id();
        module.push_revision(revision);
        module.set_state(ModuleState::Resolved);
        info!(module_id = module.id(), revision = revision_id, version = %module.version(), "模块已刷新");

        if was_active {
            if let Err(e) = self.start_locked(module).await {
                self.stop_dependents(module).await;
                return Err(refresh_error(e.to_string()));
            }
        }
        Ok(())
    }

    // ==================== 卸载 ====================

    /// 卸载模块
    ///
    /// # Errors
    ///
    /// 模块仍在运行时返回 `ModuleUninstall`，需先停止。
    #[instrument(skip(self))]
    pub async fn uninstall(&self, id: ModuleId) -> Result<()> {
        let module = self.require(id)?;
        let _guard = module.transition.lock().await;

        if !module.state().can_uninstall() {
            return Err(CoreError::ModuleUninstall {
                module: module.module_ref(),
                reason: "模块必须先停止".to_string(),
            });
        }
        self.uninstall_locked(&module);
        Ok(())
    }

    fn uninstall_locked(&self, module: &Arc<Module>) {
        let name = module.name();
        {
            let mut table = self.table.write();
            table.by_id.remove(&module.id());
            table.by_name.remove(&name);
            table.graph.remove_module(&name);
        }
        module.release_revisions();
        module.set_state(ModuleState::Uninstalled);
        info!(module_id = module.id(), module = %name, "模块已卸载");
    }

    /// 直接移除模块：需要时先停止，再卸载
    #[instrument(skip(self))]
    pub async fn remove(&self, id: ModuleId) -> Result<()> {
        let module = self.require(id)?;
        if module.state().can_stop() {
            if let Err(e) = self.stop(id).await {
                warn!(module_id = id, error = %e, "移除时停止模块失败，继续卸载");
            }
        }

        let _guard = module.transition.lock().await;
        if module.state() == ModuleState::Uninstalled {
            return Ok(());
        }
        if module.state().can_stop() {
            self.stop_locked(&module).await.ok();
        }
        self.uninstall_locked(&module);
        Ok(())
    }

    /// 按属性查找模块发布的端点
    pub fn find_endpoints(&self, filter: &PropertyFilter) -> Vec<Arc<Endpoint>> {
        self.registry.lookup_services::<Endpoint>(filter)
    }
}
