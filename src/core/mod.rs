//! 核心模块
//!
//! 包含运行时配置。

pub mod config;

pub use config::{
    EndpointConfig, LogConfig, ModuleConfig, RegistryConfig, RuntimeConfig, RuntimeConfigBuilder,
    DEFAULT_MANIFEST_FILE,
};
