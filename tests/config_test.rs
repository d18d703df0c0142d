//! 运行时配置集成测试
//!
//! 测试配置文件加载、验证、合并与构建器的完整工作流程

use chips_runtime::{ChipsRuntime, CoreError, RuntimeConfig};
use tempfile::TempDir;

/// 测试从 YAML 文件加载配置
#[tokio::test]
async fn test_load_yaml_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.yaml");
    tokio::fs::write(
        &path,
        r#"
logging:
  level: debug
  json_format: true
modules:
  module_dirs:
    - /opt/chips/modules
  auto_start: true
  cascade_stop: false
endpoints:
  trace_calls: true
"#,
    )
    .await
    .unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();

    assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json_format);
    assert_eq!(config.modules.module_dirs.len(), 1);
    assert!(config.modules.auto_start);
    assert!(!config.modules.cascade_stop);
    assert!(config.endpoints.trace_calls);

    // 未出现的段落使用默认值
    assert_eq!(config.modules.manifest_file, "module.yaml");
    assert!(config.modules.auto_install);
    assert!(config.registry.replay_on_subscribe);
    assert!(config.endpoints.enforce_required);
}

/// 测试按扩展名识别 JSON 配置
#[tokio::test]
async fn test_load_json_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.json");
    tokio::fs::write(
        &path,
        r#"{ "modules": { "manifest_file": "chip.json", "auto_install": false }, "dev_mode": true }"#,
    )
    .await
    .unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();
    assert_eq!(config.modules.manifest_file, "chip.json");
    assert!(!config.modules.auto_install);
    assert!(config.dev_mode);
    assert_eq!(config.logging.level, "info");
}

/// 测试格式错误与无效值
#[tokio::test]
async fn test_load_invalid_config() {
    let temp_dir = TempDir::new().unwrap();

    let malformed = temp_dir.path().join("bad.yaml");
    tokio::fs::write(&malformed, "logging: [unclosed").await.unwrap();
    let err = RuntimeConfig::from_file(&malformed).await.unwrap_err();
    assert!(matches!(err, CoreError::ConfigLoadFailed(_)));

    let wrong_level = temp_dir.path().join("level.yaml");
    tokio::fs::write(&wrong_level, "logging:\n  level: loud\n")
        .await
        .unwrap();
    let err = RuntimeConfig::from_file(&wrong_level).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidConfigValue { ref key, .. } if key == "logging.level"));

    let missing = temp_dir.path().join("missing.yaml");
    assert!(RuntimeConfig::from_file(&missing).await.is_err());
}

/// 测试配置合并：偏离默认值的项覆盖，模块目录追加
#[test]
fn test_merge_config() {
    let mut base = RuntimeConfig::builder()
        .module_dir("/opt/chips/system")
        .log_level("warn")
        .build();

    let user = RuntimeConfig::builder()
        .module_dir("/home/user/chips")
        .auto_start(true)
        .cascade_stop(false)
        .build();

    base.merge(user);

    assert_eq!(base.logging.level, "warn");
    assert_eq!(base.modules.module_dirs.len(), 2);
    assert!(base.modules.auto_start);
    assert!(!base.modules.cascade_stop);
    assert!(base.modules.auto_install);
}

/// 测试构建器
#[test]
fn test_config_builder() {
    let temp_dir = TempDir::new().unwrap();
    let config = RuntimeConfig::builder()
        .log_level("trace")
        .file_logging(temp_dir.path())
        .json_logging()
        .manifest_file("chip.yaml")
        .auto_install(false)
        .replay_on_subscribe(false)
        .builtin_resolvers(false)
        .enforce_required(false)
        .trace_calls()
        .dev_mode()
        .build();

    assert_eq!(config.logging.level, "trace");
    assert!(config.logging.file_output);
    assert_eq!(config.logging.log_dir.as_deref(), Some(temp_dir.path()));
    assert!(config.logging.json_format);
    assert_eq!(config.modules.manifest_file, "chip.yaml");
    assert!(!config.modules.auto_install);
    assert!(!config.registry.replay_on_subscribe);
    assert!(!config.endpoints.builtin_resolvers);
    assert!(!config.endpoints.enforce_required);
    assert!(config.endpoints.trace_calls);
    assert!(config.dev_mode);
    assert!(config.validate().is_ok());
}

/// 测试运行时拒绝无效配置，并按配置安装内置拦截器
#[test]
fn test_runtime_applies_config() {
    let invalid = RuntimeConfig::builder().manifest_file("  ").build();
    assert!(matches!(
        ChipsRuntime::new(invalid),
        Err(CoreError::InvalidConfigValue { .. })
    ));

    let bare = RuntimeConfig::builder().enforce_required(false).build();
    let runtime = ChipsRuntime::new(bare).unwrap();
    assert!(runtime.interceptors().is_empty());

    let traced = RuntimeConfig::builder().trace_calls().build();
    let runtime = ChipsRuntime::new(traced).unwrap();
    assert_eq!(runtime.interceptors().len(), 2);
}
