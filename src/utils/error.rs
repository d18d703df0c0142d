//! 薯片运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型。生命周期错误总是携带出错模块的
//! 标识与状态，解析和调度错误携带具体的端点与参数标识。

use std::fmt;

use thiserror::Error;

use crate::module::metadata::ModuleState;

/// 模块引用
///
/// 附加在生命周期错误上，记录出错时模块的身份和状态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    /// 模块 ID
    pub id: u64,
    /// 模块名称
    pub name: String,
    /// 出错时的状态
    pub state: ModuleState,
}

impl ModuleRef {
    /// 创建模块引用
    pub fn new(id: u64, name: impl Into<String>, state: ModuleState) -> Self {
        Self {
            id,
            name: name.into(),
            state,
        }
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} [{}]", self.name, self.id, self.state)
    }
}

/// 薯片运行时核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 模块生命周期错误 ====================

    /// 模块启动失败
    #[error("模块启动失败: {module} - {reason}")]
    ModuleStart {
        module: ModuleRef,
        reason: String,
    },

    /// 模块停止失败
    #[error("模块停止失败: {module} - {reason}")]
    ModuleStop {
        module: ModuleRef,
        reason: String,
    },

    /// 模块刷新失败
    #[error("模块刷新失败: {module} - {reason}")]
    ModuleRefresh {
        module: ModuleRef,
        reason: String,
    },

    /// 模块卸载失败
    #[error("模块卸载失败: {module} - {reason}")]
    ModuleUninstall {
        module: ModuleRef,
        reason: String,
    },

    /// 模块安装失败
    #[error("模块安装失败: '{location}' - {reason}")]
    ModuleInstall {
        location: String,
        reason: String,
    },

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 模块已安装
    #[error("模块已安装: '{0}'")]
    ModuleAlreadyInstalled(String),

    /// 代码单元加载失败
    #[error("代码单元加载失败: entry '{entry}' - {reason}")]
    CodeLoadFailed {
        entry: String,
        reason: String,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    /// 依赖未找到
    #[error("依赖模块未找到: '{0}'")]
    DependencyNotFound(String),

    /// 版本不匹配
    #[error("版本不匹配: 模块 '{module}' 需要版本 {required}, 但找到版本 {found}")]
    VersionMismatch {
        module: String,
        required: String,
        found: String,
    },

    /// 无效的模块元数据
    #[error("无效的模块元数据: {0}")]
    InvalidMetadata(String),

    // ==================== 服务注册错误 ====================

    /// 服务实例与声明的类型不符
    #[error("无效的服务注册: 类型 '{service_type}' - {reason}")]
    InvalidRegistration {
        service_type: String,
        reason: String,
    },

    /// 注册已失效（已注销）
    #[error("服务注册已失效: id {0}")]
    RegistrationUnavailable(u64),

    // ==================== 端点调用错误 ====================

    /// 参数无法解析
    #[error("无法解析参数: 端点 '{endpoint}' 第 {index} 个参数 '{parameter}'")]
    UnresolvableArgument {
        endpoint: String,
        parameter: String,
        index: usize,
    },

    /// 参数不满足约束
    #[error("参数无效: 端点 '{endpoint}' 参数 '{parameter}' - {reason}")]
    InvalidArgument {
        endpoint: String,
        parameter: String,
        reason: String,
    },

    /// 端点已不可用（所属模块已停止）
    #[error("endpoint no longer available: '{0}'")]
    EndpointUnavailable(String),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 模块错误 (MODULE-xxx)
    /// 模块启动失败
    pub const MODULE_START_FAILED: &str = "MODULE-001";
    /// 模块停止失败
    pub const MODULE_STOP_FAILED: &str = "MODULE-002";
    /// 模块刷新失败
    pub const MODULE_REFRESH_FAILED: &str = "MODULE-003";
    /// 模块卸载失败
    pub const MODULE_UNINSTALL_FAILED: &str = "MODULE-004";
    /// 模块安装失败
    pub const MODULE_INSTALL_FAILED: &str = "MODULE-005";
    /// 模块不存在
    pub const MODULE_NOT_FOUND: &str = "MODULE-006";
    /// 循环依赖
    pub const MODULE_CIRCULAR_DEPENDENCY: &str = "MODULE-007";
    /// 依赖模块不存在
    pub const MODULE_DEPENDENCY_NOT_FOUND: &str = "MODULE-008";
    /// 模块描述无效
    pub const MODULE_INVALID_METADATA: &str = "MODULE-009";
    /// 代码单元加载失败
    pub const MODULE_CODE_LOAD_FAILED: &str = "MODULE-010";

    // 服务错误 (SERVICE-xxx)
    /// 服务注册无效
    pub const SERVICE_INVALID_REGISTRATION: &str = "SERVICE-001";
    /// 服务注册已失效
    pub const SERVICE_REGISTRATION_UNAVAILABLE: &str = "SERVICE-002";

    // 端点错误 (ENDPOINT-xxx)
    /// 参数无法解析
    pub const ENDPOINT_UNRESOLVABLE_ARGUMENT: &str = "ENDPOINT-001";
    /// 参数不合法
    pub const ENDPOINT_INVALID_ARGUMENT: &str = "ENDPOINT-002";
    /// 端点不可用
    pub const ENDPOINT_UNAVAILABLE: &str = "ENDPOINT-003";

    // 配置错误 (CONFIG-xxx)
    /// 配置加载失败
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    /// 配置值无效
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 未分类
    /// 未分类错误
    pub const UNKNOWN: &str = "UNKNOWN";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ModuleStart { .. } => error_code::MODULE_START_FAILED,
            CoreError::ModuleStop { .. } => error_code::MODULE_STOP_FAILED,
            CoreError::ModuleRefresh { .. } => error_code::MODULE_REFRESH_FAILED,
            CoreError::ModuleUninstall { .. } => error_code::MODULE_UNINSTALL_FAILED,
            CoreError::ModuleInstall { .. } | CoreError::ModuleAlreadyInstalled(_) => {
                error_code::MODULE_INSTALL_FAILED
            }
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::CircularDependency(_) => error_code::MODULE_CIRCULAR_DEPENDENCY,
            CoreError::DependencyNotFound(_) | CoreError::VersionMismatch { .. } => {
                error_code::MODULE_DEPENDENCY_NOT_FOUND
            }
            CoreError::InvalidMetadata(_) => error_code::MODULE_INVALID_METADATA,
            CoreError::CodeLoadFailed { .. } => error_code::MODULE_CODE_LOAD_FAILED,
            CoreError::InvalidRegistration { .. } => error_code::SERVICE_INVALID_REGISTRATION,
            CoreError::RegistrationUnavailable(_) => error_code::SERVICE_REGISTRATION_UNAVAILABLE,
            CoreError::UnresolvableArgument { .. } => error_code::ENDPOINT_UNRESOLVABLE_ARGUMENT,
            CoreError::InvalidArgument { .. } => error_code::ENDPOINT_INVALID_ARGUMENT,
            CoreError::EndpointUnavailable(_) => error_code::ENDPOINT_UNAVAILABLE,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => error_code::UNKNOWN,
        }
    }

    /// 获取生命周期错误附带的模块引用
    pub fn module_ref(&self) -> Option<&ModuleRef> {
        match self {
            CoreError::ModuleStart { module, .. }
            | CoreError::ModuleStop { module, .. }
            | CoreError::ModuleRefresh { module, .. }
            | CoreError::ModuleUninstall { module, .. } => Some(module),
            _ => None,
        }
    }

    /// 是否为生命周期错误
    pub fn is_lifecycle(&self) -> bool {
        self.module_ref().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::ModuleNotFound("greeter".to_string());
        assert!(err.to_string().contains("greeter"));
    }

    #[test]
    fn test_error_code() {
        let err = CoreError::RegistrationUnavailable(7);
        assert_eq!(err.error_code(), error_code::SERVICE_REGISTRATION_UNAVAILABLE);

        let err = CoreError::EndpointUnavailable("Greeter::greet(String)".to_string());
        assert_eq!(err.error_code(), error_code::ENDPOINT_UNAVAILABLE);
        assert!(err.to_string().contains("endpoint no longer available"));
    }

    #[test]
    fn test_lifecycle_error_carries_module() {
        let err = CoreError::ModuleStart {
            module: ModuleRef::new(3, "greeter", ModuleState::Resolved),
            reason: "依赖不可用".to_string(),
        };
        let module = err.module_ref().unwrap();
        assert_eq!(module.id, 3);
        assert_eq!(module.name, "greeter");
        assert_eq!(module.state, ModuleState::Resolved);
        assert!(err.is_lifecycle());
        assert!(err.to_string().contains("greeter#3"));
    }

    #[test]
    fn test_unresolvable_argument_names_parameter() {
        let err = CoreError::UnresolvableArgument {
            endpoint: "Greeter::greet(String)".to_string(),
            parameter: "name".to_string(),
            index: 0,
        };
        assert!(err.to_string().contains("'name'"));
        assert!(err.module_ref().is_none());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();
        assert!(matches!(core_err, CoreError::Io(_)));
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: CoreError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, CoreError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
