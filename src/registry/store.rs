//! 服务存储
//!
//! 按服务类型分桶保存注册记录，每个桶按 (rank 降序, id 升序) 保持有序，
//! 查找时按顺序过滤即可得到最佳匹配。本结构本身不加锁，由
//! [`ServiceRegistry`](super::ServiceRegistry) 以读写锁保护。

use std::any::TypeId;
use std::cmp::Reverse;
use std::collections::HashMap;

use super::filter::PropertyFilter;
use super::service::{ModuleId, ServiceReference};

fn sort_key(reference: &ServiceReference) -> (Reverse<i32>, u64) {
    (Reverse(reference.rank()), reference.id())
}

/// 服务存储
#[derive(Default)]
pub(crate) struct ServiceStore {
    by_type: HashMap<TypeId, Vec<ServiceReference>>,
    by_id: HashMap<u64, ServiceReference>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入注册记录，保持桶内有序
    pub fn insert(&mut self, reference: ServiceReference) {
        let key = sort_key(&reference);
        let bucket = self
            .by_type
            .entry(reference.service_type().type_id())
            .or_default();
        let pos = bucket.partition_point(|r| sort_key(r) < key);
        bucket.insert(pos, reference.clone());
        self.by_id.insert(reference.id(), reference);
    }

    /// 移除注册记录
    pub fn remove(&mut self, id: u64) -> Option<ServiceReference> {
        let reference = self.by_id.remove(&id)?;
        let type_id = reference.service_type().type_id();
        if let Some(bucket) = self.by_type.get_mut(&type_id) {
            if let Ok(pos) = bucket.binary_search_by_key(&sort_key(&reference), sort_key) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                self.by_type.remove(&type_id);
            }
        }
        Some(reference)
    }

    pub fn get(&self, id: u64) -> Option<ServiceReference> {
        self.by_id.get(&id).cloned()
    }

    /// 按顺序返回满足过滤器的记录
    pub fn find<'a>(
        &'a self,
        type_id: TypeId,
        filter: &'a PropertyFilter,
    ) -> impl Iterator<Item = &'a ServiceReference> + 'a {
        self.by_type
            .get(&type_id)
            .into_iter()
            .flatten()
            .filter(move |r| r.with_properties(|props| filter.matches(props)))
    }

    /// 某模块拥有的全部注册 ID（按 ID 升序）
    pub fn ids_owned_by(&self, owner: ModuleId) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .by_id
            .values()
            .filter(|r| r.owner() == Some(owner))
            .map(|r| r.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn count_for(&self, type_id: TypeId) -> usize {
        self.by_type.get(&type_id).map(Vec::len).unwrap_or(0)
    }
}
