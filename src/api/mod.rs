//! API 模块
//!
//! 对外提供的运行时入口。
//!
//! - `sdk`: ChipsRuntime 主接口，装配注册中心、拦截器链与模块管理器
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_runtime::{ChipsRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = ChipsRuntime::new(RuntimeConfig::default())?;
//!     runtime.start().await?;
//!     println!("{:?}", runtime.health());
//!     Ok(())
//! }
//! ```

pub mod sdk;

// 重导出主要类型
pub use sdk::{ChipsRuntime, CoreState, HealthInfo};
