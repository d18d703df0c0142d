//! 标识生成
//!
//! - [`IdSequence`]：进程内单调递增的数值 ID，用于服务注册、订阅和模块，
//!   已用过的 ID 永不复用
//! - [`generate_id`]：10 位 62 进制字符串，用于调用 ID 等日志关联字段
//! - [`generate_uuid`]：UUID v4，用于运行时实例标识

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// ID 长度
const ID_LENGTH: usize = 10;

/// 单调递增 ID 序列
///
/// 从 1 开始分配，0 保留为"无效"。
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    /// 创建从 1 开始的序列
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// 分配下一个 ID
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// 查看下一个将被分配的 ID（不消耗）
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// 生成 10 位 62 进制 ID
///
/// 使用时间戳与随机数组合
///
/// # Example
///
/// ```
/// use chips_runtime::utils::id::generate_id;
///
/// let id = generate_id();
/// assert_eq!(id.len(), 10);
/// ```
pub fn generate_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let random: u64 = rand::thread_rng().gen();

    let mut value = timestamp ^ random;
    let mut result = Vec::with_capacity(ID_LENGTH);
    for _ in 0..ID_LENGTH {
        result.push(char::from(BASE62_CHARS[(value % 62) as usize]));
        value /= 62;
    }

    result.into_iter().rev().collect()
}

/// 验证 ID 格式是否有效
///
/// ```
/// use chips_runtime::utils::id::is_valid_id;
///
/// assert!(is_valid_id("a1B2c3D4e5"));
/// assert!(!is_valid_id("too-short"));
/// ```
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 生成 UUID v4 格式的 ID
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence_is_monotonic() {
        let seq = IdSequence::new();
        let a = seq.next_id();
        let b = seq.next_id();
        assert_eq!(a, 1);
        assert!(b > a);
        assert_eq!(seq.peek(), b + 1);
    }

    #[test]
    fn test_sequence_never_reissues_across_threads() {
        let seq = Arc::new(IdSequence::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || (0..500).map(|_| seq.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "ID {} 被重复分配", id);
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_generate_id_format() {
        let id = generate_id();
        assert!(is_valid_id(&id));
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(generate_id()), "ID collision detected");
        }
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("0000000000"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("a1B2c3D4e!"));
    }

    #[test]
    fn test_generate_uuid() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), 36);
    }
}
