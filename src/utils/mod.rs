//! 工具模块
//!
//! 包含错误类型、ID 生成、日志系统和调用统计等通用工具。

pub mod error;
pub mod id;
pub mod logger;
pub mod metrics;

// 重导出常用类型
pub use error::{error_code, CoreError, ModuleRef, Result};
pub use id::{generate_id, generate_uuid, is_valid_id, IdSequence};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use metrics::{CallStats, CallStatsSnapshot};
