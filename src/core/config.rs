//! 运行时配置
//!
//! 定义运行时的配置结构和加载逻辑。配置文件可以是 YAML 或 JSON（按扩展名判断），
//! 所有字段都有默认值，缺省的段落按默认值填充。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::utils::{CoreError, Result};

/// 默认的模块描述文件名
pub const DEFAULT_MANIFEST_FILE: &str = "module.yaml";

/// 可识别的日志级别
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 模块管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// 模块目录列表（每个子目录包含一个模块描述文件）
    #[serde(default)]
    pub module_dirs: Vec<PathBuf>,

    /// 模块描述文件名
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,

    /// 运行时启动时是否自动安装模块目录中的模块
    #[serde(default = "default_true")]
    pub auto_install: bool,

    /// 运行时启动时是否自动启动已解析的模块
    #[serde(default)]
    pub auto_start: bool,

    /// 停止模块时是否先停止依赖它的活动模块
    #[serde(default = "default_true")]
    pub cascade_stop: bool,
}

fn default_manifest_file() -> String {
    DEFAULT_MANIFEST_FILE.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            module_dirs: vec![],
            manifest_file: default_manifest_file(),
            auto_install: true,
            auto_start: false,
            cascade_stop: true,
        }
    }
}

/// 服务注册中心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 新订阅是否补发已存在的匹配服务
    #[serde(default = "default_true")]
    pub replay_on_subscribe: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            replay_on_subscribe: true,
        }
    }
}

/// 端点调用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 是否在调用方解析器之后追加内置解析器
    #[serde(default = "default_true")]
    pub builtin_resolvers: bool,

    /// 是否安装必填参数检查拦截器
    #[serde(default = "default_true")]
    pub enforce_required: bool,

    /// 是否安装调用跟踪拦截器
    #[serde(default)]
    pub trace_calls: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            builtin_resolvers: true,
            enforce_required: true,
            trace_calls: false,
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 模块管理配置
    #[serde(default)]
    pub modules: ModuleConfig,

    /// 服务注册中心配置
    #[serde(default)]
    pub registry: RegistryConfig,

    /// 端点调用配置
    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// `.json` 扩展名按 JSON 解析，其余按 YAML 解析。
    ///
    /// # Errors
    ///
    /// - 文件无法读取时返回 `Io`
    /// - 内容格式错误时返回 `ConfigLoadFailed`
    /// - 配置值无效时返回 `InvalidConfigValue`
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await?;

        let is_json = path.extension().map(|e| e == "json").unwrap_or(false);
        let parsed = if is_json {
            serde_json::from_str::<RuntimeConfig>(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str::<RuntimeConfig>(&content).map_err(|e| e.to_string())
        };
        let mut config = parsed.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("{}: {}", path.display(), e))
        })?;

        config.validate()?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(CoreError::InvalidConfigValue {
                key: "logging.level".to_string(),
                reason: format!("未知的日志级别 '{}'", self.logging.level),
            });
        }
        if self.modules.manifest_file.trim().is_empty() {
            return Err(CoreError::InvalidConfigValue {
                key: "modules.manifest_file".to_string(),
                reason: "模块描述文件名不能为空".to_string(),
            });
        }
        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    ///
    /// 只覆盖 `other` 中偏离默认值的配置项，模块目录追加而非替换。
    pub fn merge(&mut self, other: RuntimeConfig) {
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if !other.modules.module_dirs.is_empty() {
            self.modules.module_dirs.extend(other.modules.module_dirs);
        }
        if other.modules.manifest_file != default_manifest_file() {
            self.modules.manifest_file = other.modules.manifest_file;
        }
        if !other.modules.auto_install {
            self.modules.auto_install = false;
        }
        if other.modules.auto_start {
            self.modules.auto_start = true;
        }
        if !other.modules.cascade_stop {
            self.modules.cascade_stop = false;
        }
        if !other.registry.replay_on_subscribe {
            self.registry.replay_on_subscribe = false;
        }
        if !other.endpoints.builtin_resolvers {
            self.endpoints.builtin_resolvers = false;
        }
        if !other.endpoints.enforce_required {
            self.endpoints.enforce_required = false;
        }
        if other.endpoints.trace_calls {
            self.endpoints.trace_calls = true;
        }
        if other.dev_mode {
            self.dev_mode = true;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 添加模块目录
    pub fn module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.modules.module_dirs.push(dir.into());
        self
    }

    /// 设置模块描述文件名
    pub fn manifest_file(mut self, name: impl Into<String>) -> Self {
        self.config.modules.manifest_file = name.into();
        self
    }

    /// 设置是否自动安装
    pub fn auto_install(mut self, enable: bool) -> Self {
        self.config.modules.auto_install = enable;
        self
    }

    /// 设置是否自动启动
    pub fn auto_start(mut self, enable: bool) -> Self {
        self.config.modules.auto_start = enable;
        self
    }

    /// 设置是否级联停止依赖者
    pub fn cascade_stop(mut self, enable: bool) -> Self {
        self.config.modules.cascade_stop = enable;
        self
    }

    /// 设置订阅时是否补发已有服务
    pub fn replay_on_subscribe(mut self, enable: bool) -> Self {
        self.config.registry.replay_on_subscribe = enable;
        self
    }

    /// 设置是否启用内置解析器
    pub fn builtin_resolvers(mut self, enable: bool) -> Self {
        self.config.endpoints.builtin_resolvers = enable;
        self
    }

    /// 设置是否强制必填参数
    pub fn enforce_required(mut self, enable: bool) -> Self {
        self.config.endpoints.enforce_required = enable;
        self
    }

    /// 启用调用跟踪
    pub fn trace_calls(mut self) -> Self {
        self.config.endpoints.trace_calls = true;
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
