//! 模块元数据定义
//!
//! 定义模块描述文件 (module.yaml) 中的数据结构，以及模块状态、
//! 运行时信息快照和状态变更事件。

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// 依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// 依赖模块名称
    pub name: String,

    /// 版本要求（semver 范围格式）
    pub version: String,

    /// 是否必须
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Dependency {
    /// 创建必需依赖
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            required: true,
        }
    }

    /// 设置为可选依赖
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// 检查版本是否满足要求
    pub fn version_matches(&self, version: &Version) -> bool {
        VersionReq::parse(&self.version)
            .map(|req| req.matches(version))
            .unwrap_or(false)
    }
}

/// 模块描述
///
/// 对应 module.yaml 文件中的配置：
///
/// ```yaml
/// name: greeter
/// version: 1.0.0
/// entry: greeter
/// description: 问候服务
/// headers:
///   vendor: chips
/// dependencies:
///   - name: i18n
///     version: ^1.0
///     required: false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// 模块名称（进程内唯一）
    pub name: String,

    /// 模块版本（semver 格式）
    pub version: String,

    /// 代码单元入口，由 [`CodeLoader`](super::runtime::CodeLoader) 解释
    pub entry: String,

    /// 模块描述
    #[serde(default)]
    pub description: String,

    /// 头信息
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// 依赖声明
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl ModuleManifest {
    /// 创建模块描述，入口默认与名称相同
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            entry: name.clone(),
            name,
            version: version.into(),
            description: String::new(),
            headers: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    /// 设置入口
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    /// 添加依赖
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// 添加头信息
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// 解析版本号
    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }
}

/// 模块状态
///
/// ```text
/// INSTALLED → RESOLVED → STARTING → STARTED → ACTIVE → STOPPING → RESOLVED
///                                                               ↘ UNINSTALLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    /// 已安装，代码单元尚未就绪
    Installed,
    /// 代码单元已加载，可以启动
    Resolved,
    /// 正在启动
    Starting,
    /// 实例已创建，端点尚未发布
    Started,
    /// 运行中，端点已发布
    Active,
    /// 正在停止
    Stopping,
    /// 已卸载
    Uninstalled,
}

impl Default for ModuleState {
    fn default() -> Self {
        ModuleState::Installed
    }
}

impl ModuleState {
    /// 是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, ModuleState::Resolved)
    }

    /// 是否可以停止
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            ModuleState::Starting | ModuleState::Started | ModuleState::Active
        )
    }

    /// 是否可以卸载
    pub fn can_uninstall(&self) -> bool {
        matches!(self, ModuleState::Installed | ModuleState::Resolved)
    }

    /// 是否处于运行中
    pub fn is_active(&self) -> bool {
        matches!(self, ModuleState::Active)
    }

    /// 大写状态名，如 `ACTIVE`
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED",
            ModuleState::Starting => "STARTING",
            ModuleState::Started => "STARTED",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模块运行时信息
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    /// 模块 ID
    pub id: u64,

    /// 当前修订版的描述
    pub manifest: ModuleManifest,

    /// 当前状态
    pub state: ModuleState,

    /// 安装来源路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,

    /// 当前修订版 ID
    pub revision: u64,

    /// 仍保留的修订版数量
    pub revision_count: usize,

    /// 安装时间
    pub installed_at: DateTime<Utc>,

    /// 最近一次进入 ACTIVE 的时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// 最后错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ModuleInfo {
    /// 模块名称
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// 模块版本
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// 是否处于运行中
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// 模块状态变更事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleEvent {
    /// 模块 ID
    pub module_id: u64,
    /// 模块名称
    pub name: String,
    /// 转换前状态
    pub from: ModuleState,
    /// 转换后状态
    pub to: ModuleState,
    /// 转换时间
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_creation() {
        let manifest = ModuleManifest::new("greeter", "1.0.0")
            .with_dependency(Dependency::new("i18n", "^1.0").optional())
            .with_header("vendor", "chips");

        assert_eq!(manifest.entry, "greeter");
        assert_eq!(manifest.parsed_version(), Some(Version::new(1, 0, 0)));
        assert!(!manifest.dependencies[0].required);
        assert_eq!(manifest.headers["vendor"], "chips");
    }

    #[test]
    fn test_module_state_transitions() {
        assert!(ModuleState::Resolved.can_start());
        assert!(!ModuleState::Installed.can_start());
        assert!(!ModuleState::Active.can_start());

        assert!(ModuleState::Active.can_stop());
        assert!(ModuleState::Starting.can_stop());
        assert!(!ModuleState::Resolved.can_stop());

        assert!(ModuleState::Resolved.can_uninstall());
        assert!(ModuleState::Installed.can_uninstall());
        assert!(!ModuleState::Active.can_uninstall());
    }

    #[test]
    fn test_module_state_display() {
        assert_eq!(ModuleState::Active.to_string(), "ACTIVE");
        assert_eq!(
            serde_json::to_string(&ModuleState::Uninstalled).unwrap(),
            "\"UNINSTALLED\""
        );
    }

    #[test]
    fn test_dependency_version_check() {
        let dep = Dependency::new("other", "^1.0.0");

        assert!(dep.version_matches(&Version::parse("1.0.0").unwrap()));
        assert!(dep.version_matches(&Version::parse("1.5.0").unwrap()));
        assert!(!dep.version_matches(&Version::parse("2.0.0").unwrap()));
        assert!(!Dependency::new("x", "bogus").version_matches(&Version::new(1, 0, 0)));
    }

    #[test]
    fn test_manifest_serialization() {
        let manifest = ModuleManifest::new("greeter", "1.0.0")
            .with_dependency(Dependency::new("i18n", "^1.0"));

        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let parsed: ModuleManifest = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed, manifest);
    }
}
