//! 日志系统与调用统计集成测试
//!
//! 测试日志系统初始化、调用统计的并发记录，以及端点调用对统计的影响

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use chips_runtime::endpoint::keys;
use chips_runtime::utils::CallStats;
use chips_runtime::{
    handler, ChipsRuntime, EndpointDeclaration, Logger, LoggerConfig, ModuleCode, ModuleContext,
    ModuleInstance, ModuleManifest, PropertyFilter, ResolutionContext, RotationStrategy,
    RuntimeConfig, StaticCodeLoader,
};
use serde_json::{json, Value};
use tempfile::TempDir;

// ============================================================================
// 调用统计测试
// ============================================================================

/// 测试完整的统计流程
#[test]
fn test_call_stats_full_flow() {
    let stats = CallStats::new();

    for i in 0..100u64 {
        let success = i % 10 != 0; // 90% 成功率
        let latency = Duration::from_micros(100 + (i % 50) * 10);
        stats.record(success, latency);
    }
    stats.record_unavailable();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_calls, 100);
    assert_eq!(snapshot.successful_calls, 90);
    assert_eq!(snapshot.failed_calls, 10);
    assert_eq!(snapshot.unavailable_calls, 1);
    assert!((snapshot.success_rate - 0.9).abs() < 0.01);
    assert_eq!(snapshot.min_latency_us, 100);
    assert_eq!(snapshot.max_latency_us, 590);

    stats.reset();
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_calls, 0);
    assert_eq!(snapshot.min_latency_us, 0);
}

/// 测试并发记录
#[test]
fn test_call_stats_concurrent_recording() {
    let stats = Arc::new(CallStats::new());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let stats = stats.clone();
            thread::spawn(move || {
                for i in 0..1000u64 {
                    stats.record(i % 2 == 0, Duration::from_micros(t * 10 + i % 7));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_calls, 8000);
    assert_eq!(snapshot.successful_calls, 4000);
    assert_eq!(snapshot.failed_calls, 4000);
    assert_eq!(snapshot.min_latency_us, 0);
    assert_eq!(snapshot.max_latency_us, 76);
}

// ============================================================================
// 端点统计测试
// ============================================================================

struct CounterCode;

#[async_trait]
impl ModuleCode for CounterCode {
    fn endpoints(&self) -> Vec<EndpointDeclaration> {
        vec![
            EndpointDeclaration::new(
                "Counter",
                "ok",
                handler(|_: Arc<()>, _args: Vec<Value>| async move { Ok(json!(1)) }),
            ),
            EndpointDeclaration::new(
                "Counter",
                "fail",
                handler(|_: Arc<()>, _args: Vec<Value>| async move {
                    Err(chips_runtime::CoreError::Internal("boom".to_string()))
                }),
            ),
        ]
    }

    async fn activate(&self, _context: &ModuleContext) -> anyhow::Result<ModuleInstance> {
        Ok(Arc::new(()))
    }
}

/// 端点统计与全局统计分别记录
#[tokio::test]
async fn test_endpoint_and_runtime_stats() {
    let loader = StaticCodeLoader::new().with_entry("counter", |_| Ok(Arc::new(CounterCode)));
    let runtime = ChipsRuntime::with_loader(RuntimeConfig::default(), Arc::new(loader)).unwrap();
    let module = runtime
        .modules()
        .install_manifest(ModuleManifest::new("counter", "1.0.0"))
        .await
        .unwrap();
    runtime.modules().start(module.id()).await.unwrap();

    let ok = runtime
        .find_endpoint(&PropertyFilter::any().with(keys::METHOD, "ok"))
        .unwrap();
    let fail = runtime
        .find_endpoint(&PropertyFilter::any().with(keys::METHOD, "fail"))
        .unwrap();
    let ok_invoker = ok.create_invoker(Vec::new());
    let fail_invoker = fail.create_invoker(Vec::new());
    let context = ResolutionContext::new();

    for _ in 0..3 {
        ok_invoker.call(&context).await.unwrap();
    }
    assert!(fail_invoker.call(&context).await.is_err());

    runtime.modules().stop(module.id()).await.unwrap();
    assert!(ok_invoker.call(&context).await.is_err());

    let ok_stats = ok.stats();
    assert_eq!(ok_stats.total_calls, 3);
    assert_eq!(ok_stats.successful_calls, 3);
    assert_eq!(ok_stats.unavailable_calls, 1);

    let fail_stats = fail.stats();
    assert_eq!(fail_stats.total_calls, 1);
    assert_eq!(fail_stats.failed_calls, 1);

    let total = runtime.health().calls;
    assert_eq!(total.total_calls, 4);
    assert_eq!(total.successful_calls, 3);
    assert_eq!(total.failed_calls, 1);
    assert_eq!(total.unavailable_calls, 1);
}

// ============================================================================
// 日志系统测试
// ============================================================================

/// 测试文件日志：JSON 格式写入指定目录，重复初始化失败
#[test]
fn test_file_logging() {
    let temp_dir = TempDir::new().unwrap();
    let config = LoggerConfig::builder()
        .level("info")
        .console_output(false)
        .file_output(temp_dir.path())
        .file_prefix("runtime-test")
        .rotation(RotationStrategy::Never)
        .json_format(true)
        .build();

    let guard = Logger::init(config.clone()).unwrap();
    assert!(guard.is_active());
    assert!(Logger::init(config.clone()).is_err());
    assert!(!Logger::try_init(config).is_active());

    tracing::info!(module = "greeter", "日志写入测试");
    drop(guard);

    let content = std::fs::read_to_string(temp_dir.path().join("runtime-test.log")).unwrap();
    assert!(content.contains("日志写入测试"));
    assert!(content.contains("\"module\":\"greeter\""));
}
