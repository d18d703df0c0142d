//! 模块与修订版
//!
//! [`Module`] 持有模块的状态、修订版列表和实例槽位。状态转换由
//! [`ModuleManager`](super::manager::ModuleManager) 驱动，同一模块的转换
//! 通过模块自身的 `transition` 锁串行执行，不同模块之间互不阻塞。
//!
//! 修订版列表的最后一项是当前修订版；其余修订版只在模块停用前保留，
//! 随后释放其代码单元。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use super::metadata::{ModuleEvent, ModuleInfo, ModuleManifest, ModuleState};
use super::runtime::{InstanceSlot, ModuleCode};
use crate::registry::ModuleId;
use crate::utils::ModuleRef;

/// 修订版
///
/// 模块代码的一个版本，独占一个代码单元。代码单元至多装入一次。
pub struct Revision {
    id: u64,
    manifest: ModuleManifest,
    code: OnceLock<Arc<dyn ModuleCode>>,
    current: AtomicBool,
    loaded_at: OnceLock<DateTime<Utc>>,
}

impl Revision {
    pub(crate) fn new(id: u64, manifest: ModuleManifest, code: Option<Arc<dyn ModuleCode>>) -> Self {
        let revision = Self {
            id,
            manifest,
            code: OnceLock::new(),
            current: AtomicBool::new(true),
            loaded_at: OnceLock::new(),
        };
        if let Some(code) = code {
            revision.attach(code);
        }
        revision
    }

    /// 修订版 ID，随每次刷新递增
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 该修订版的模块描述
    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    /// 是否为当前修订版
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire)
    }

    /// 代码单元是否已加载
    pub fn is_loaded(&self) -> bool {
        self.code.get().is_some()
    }

    /// 代码单元装入时间
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at.get().copied()
    }

    pub(crate) fn code(&self) -> Option<&Arc<dyn ModuleCode>> {
        self.code.get()
    }

    /// 装入代码单元；已装入时释放多余的一份
    fn attach(&self, code: Arc<dyn ModuleCode>) {
        match self.code.set(code) {
            Ok(()) => {
                let _ = self.loaded_at.set(Utc::now());
            }
            Err(extra) => extra.release(),
        }
    }

    /// 释放代码单元
    fn discard(&self) {
        self.current.store(false, Ordering::Release);
        if let Some(code) = self.code.get() {
            code.release();
        }
    }
}

impl std::fmt::Debug for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Revision")
            .field("id", &self.id)
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("current", &self.is_current())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// 已安装的模块
pub struct Module {
    id: ModuleId,
    location: Option<PathBuf>,
    installed_at: DateTime<Utc>,
    state: RwLock<ModuleState>,
    revisions: RwLock<Vec<Arc<Revision>>>,
    slot: InstanceSlot,
    started_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    events: broadcast::Sender<ModuleEvent>,
    pub(crate) transition: Mutex<()>,
}

impl Module {
    pub(crate) fn new(
        id: ModuleId,
        location: Option<PathBuf>,
        revision: Revision,
        events: broadcast::Sender<ModuleEvent>,
    ) -> Self {
        Self {
            id,
            location,
            installed_at: Utc::now(),
            state: RwLock::new(ModuleState::Installed),
            revisions: RwLock::new(vec![Arc::new(revision)]),
            slot: Arc::new(ArcSwapOption::empty()),
            started_at: RwLock::new(None),
            last_error: RwLock::new(None),
            events,
            transition: Mutex::new(()),
        }
    }

    /// 模块 ID，安装时分配，刷新后不变
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// 当前修订版的名称
    pub fn name(&self) -> String {
        self.manifest().name
    }

    /// 当前修订版的版本号
    pub fn version(&self) -> String {
        self.manifest().version
    }

    /// 当前修订版的描述
    pub fn manifest(&self) -> ModuleManifest {
        self.current_revision().manifest().clone()
    }

    /// 当前状态
    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }

    /// 是否处于 ACTIVE
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// 安装来源目录
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// 安装时间
    pub fn installed_at(&self) -> DateTime<Utc> {
        self.installed_at
    }

    /// 最近一次进入 ACTIVE 的时间
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read()
    }

    /// 最近一次失败的原因
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// 当前修订版
    pub fn current_revision(&self) -> Arc<Revision> {
        let revisions = self.revisions.read();
        // 列表在卸载前始终非空
        revisions[revisions.len() - 1].clone()
    }

    /// 仍保留的全部修订版，当前修订版在最后
    pub fn revisions(&self) -> Vec<Arc<Revision>> {
        self.revisions.read().clone()
    }

    /// 出错时附加的模块引用
    pub fn module_ref(&self) -> ModuleRef {
        ModuleRef::new(self.id, self.name(), self.state())
    }

    /// 运行时信息快照
    pub fn info(&self) -> ModuleInfo {
        let revisions = self.revisions.read();
        let current = &revisions[revisions.len() - 1];
        ModuleInfo {
            id: self.id,
            manifest: current.manifest().clone(),
            state: self.state(),
            location: self.location.clone(),
            revision: current.id(),
            revision_count: revisions.len(),
            installed_at: self.installed_at,
            started_at: self.started_at(),
            last_error: self.last_error(),
        }
    }

    pub(crate) fn slot(&self) -> &InstanceSlot {
        &self.slot
    }

    /// 切换状态并广播事件
    pub(crate) fn set_state(&self, to: ModuleState) {
        let from = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, to)
        };
        if from == to {
            return;
        }

        match to {
            ModuleState::Active => *self.started_at.write() = Some(Utc::now()),
            ModuleState::Resolved | ModuleState::Uninstalled => *self.started_at.write() = None,
            _ => {}
        }

        let name = self.name();
        info!(module_id = self.id, module = %name, from = %from, to = %to, "模块状态变更");
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(ModuleEvent {
            module_id: self.id,
            name,
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        *self.last_error.write() = error;
    }

    /// 追加新的当前修订版
    ///
    /// 调用前模块必须已停用；旧修订版随即被释放。
    pub(crate) fn push_revision(&self, revision: Revision) {
        let discarded = {
            let mut revisions = self.revisions.write();
            let discarded = std::mem::take(&mut *revisions);
            revisions.push(Arc::new(revision));
            discarded
        };
        for old in discarded {
            debug!(module_id = self.id, revision = old.id(), "释放旧修订版");
            old.discard();
        }
    }

    /// 为当前修订版装入代码单元
    pub(crate) fn attach_code(&self, code: Arc<dyn ModuleCode>) {
        self.current_revision().attach(code);
    }

    /// 释放全部修订版
    pub(crate) fn release_revisions(&self) {
        for revision in self.revisions.read().iter() {
            revision.discard();
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .field("location", &self.location)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointDeclaration;
    use crate::module::runtime::{ModuleContext, ModuleInstance};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Released(Arc<AtomicUsize>);

    #[async_trait]
    impl ModuleCode for Released {
        fn endpoints(&self) -> Vec<EndpointDeclaration> {
            Vec::new()
        }

        async fn activate(&self, _context: &ModuleContext) -> anyhow::Result<ModuleInstance> {
            Ok(Arc::new(()))
        }

        fn release(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn module(events: broadcast::Sender<ModuleEvent>) -> Module {
        let revision = Revision::new(1, ModuleManifest::new("greeter", "1.0.0"), None);
        Module::new(7, None, revision, events)
    }

    #[test]
    fn test_set_state_emits_events() {
        let (tx, mut rx) = broadcast::channel(8);
        let module = module(tx);

        module.set_state(ModuleState::Resolved);
        module.set_state(ModuleState::Resolved);
        module.set_state(ModuleState::Active);

        let first = rx.try_recv().unwrap();
        assert_eq!((first.from, first.to), (ModuleState::Installed, ModuleState::Resolved));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.to, ModuleState::Active);
        assert!(rx.try_recv().is_err());
        assert!(module.started_at().is_some());
    }

    #[test]
    fn test_push_revision_releases_old_code() {
        let (tx, _rx) = broadcast::channel(8);
        let module = module(tx);
        let released = Arc::new(AtomicUsize::new(0));

        let old = module.current_revision();
        assert!(!old.is_loaded());
        module.attach_code(Arc::new(Released(released.clone())));
        assert!(old.is_loaded());
        assert!(old.loaded_at().is_some());

        module.push_revision(Revision::new(
            2,
            ModuleManifest::new("greeter", "1.1.0"),
            Some(Arc::new(Released(released.clone()))),
        ));

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!old.is_current());
        assert_eq!(module.version(), "1.1.0");

        let info = module.info();
        assert_eq!(info.revision, 2);
        assert_eq!(info.revision_count, 1);

        module.release_revisions();
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_attach_code_once_per_revision() {
        let (tx, _rx) = broadcast::channel(8);
        let module = module(tx);
        let released = Arc::new(AtomicUsize::new(0));
        let handed_out = module.revisions();

        module.attach_code(Arc::new(Released(released.clone())));
        module.attach_code(Arc::new(Released(released.clone())));

        // 第二份代码单元被立即释放，先前取得的修订版也能看到装入结果
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(handed_out[0].is_loaded());
        assert_eq!(handed_out[0].id(), module.current_revision().id());
    }

    #[test]
    fn test_module_ref() {
        let (tx, _rx) = broadcast::channel(8);
        let module = module(tx);
        let r = module.module_ref();
        assert_eq!(r.id, 7);
        assert_eq!(r.name, "greeter");
        assert_eq!(r.state, ModuleState::Installed);
    }
}
