//! 模块管理模块
//!
//! 包含模块管理系统的核心组件：
//! - `metadata`: 模块描述、状态与事件
//! - `parser`: 模块描述文件解析
//! - `dependency`: 依赖关系图
//! - `runtime`: 代码单元、代码加载器与模块上下文
//! - `lifecycle`: 模块与修订版
//! - `manager`: 模块管理器

pub mod dependency;
pub mod lifecycle;
pub mod manager;
pub mod metadata;
pub mod parser;
pub mod runtime;

// 重导出常用类型
pub use dependency::DependencyGraph;
pub use lifecycle::{Module, Revision};
pub use manager::ModuleManager;
pub use metadata::{Dependency, ModuleEvent, ModuleInfo, ModuleManifest, ModuleState};
pub use parser::ModuleParser;
pub use runtime::{
    CodeLoader, InstanceSlot, ModuleCode, ModuleContext, ModuleInstance, StaticCodeLoader,
};
