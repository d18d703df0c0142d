//! 调用统计
//!
//! 基于原子计数器的无锁统计，记录端点调用次数、成功率和延迟分布。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// 调用统计
///
/// 所有字段均为原子量，可在并发调用路径上直接记录。
#[derive(Debug)]
pub struct CallStats {
    /// 总调用数
    total_calls: AtomicU64,
    /// 成功调用数
    successful_calls: AtomicU64,
    /// 失败调用数
    failed_calls: AtomicU64,
    /// 因端点不可用被拒绝的调用数
    unavailable_calls: AtomicU64,
    /// 总延迟（微秒）
    total_latency_us: AtomicU64,
    /// 最小延迟（微秒）
    min_latency_us: AtomicU64,
    /// 最大延迟（微秒）
    max_latency_us: AtomicU64,
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStats {
    /// 创建新的统计实例
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            unavailable_calls: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            min_latency_us: AtomicU64::new(u64::MAX),
            max_latency_us: AtomicU64::new(0),
        }
    }

    /// 记录一次调用结果
    pub fn record(&self, success: bool, latency: Duration) {
        let latency_us = latency.as_micros() as u64;
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);

        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        let mut current_min = self.min_latency_us.load(Ordering::Relaxed);
        while latency_us < current_min {
            match self.min_latency_us.compare_exchange_weak(
                current_min,
                latency_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_min = actual,
            }
        }

        let mut current_max = self.max_latency_us.load(Ordering::Relaxed);
        while latency_us > current_max {
            match self.max_latency_us.compare_exchange_weak(
                current_max,
                latency_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_max = actual,
            }
        }
    }

    /// 记录一次因端点不可用被拒绝的调用
    pub fn record_unavailable(&self) {
        self.unavailable_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取统计快照
    pub fn snapshot(&self) -> CallStatsSnapshot {
        let total = self.total_calls.load(Ordering::Relaxed);
        let successful = self.successful_calls.load(Ordering::Relaxed);
        let total_latency = self.total_latency_us.load(Ordering::Relaxed);
        let min_latency = self.min_latency_us.load(Ordering::Relaxed);

        CallStatsSnapshot {
            total_calls: total,
            successful_calls: successful,
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            unavailable_calls: self.unavailable_calls.load(Ordering::Relaxed),
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            avg_latency_us: if total > 0 { total_latency / total } else { 0 },
            min_latency_us: if min_latency == u64::MAX { 0 } else { min_latency },
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.unavailable_calls.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
        self.min_latency_us.store(u64::MAX, Ordering::Relaxed);
        self.max_latency_us.store(0, Ordering::Relaxed);
    }
}

/// 调用统计快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallStatsSnapshot {
    /// 总调用数（不含被拒绝的调用）
    pub total_calls: u64,
    /// 成功调用数
    pub successful_calls: u64,
    /// 失败调用数
    pub failed_calls: u64,
    /// 端点不可用的调用数
    pub unavailable_calls: u64,
    /// 成功率
    pub success_rate: f64,
    /// 平均延迟（微秒）
    pub avg_latency_us: u64,
    /// 最小延迟（微秒）
    pub min_latency_us: u64,
    /// 最大延迟（微秒）
    pub max_latency_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let stats = CallStats::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.min_latency_us, 0);
        assert_eq!(snapshot.success_rate, 0.0);
    }

    #[test]
    fn test_record_and_snapshot() {
        let stats = CallStats::new();
        stats.record(true, Duration::from_micros(100));
        stats.record(true, Duration::from_micros(300));
        stats.record(false, Duration::from_micros(200));
        stats.record_unavailable();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.successful_calls, 2);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.unavailable_calls, 1);
        assert_eq!(snapshot.avg_latency_us, 200);
        assert_eq!(snapshot.min_latency_us, 100);
        assert_eq!(snapshot.max_latency_us, 300);
    }

    #[test]
    fn test_reset() {
        let stats = CallStats::new();
        stats.record(true, Duration::from_micros(50));
        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.max_latency_us, 0);
    }
}
