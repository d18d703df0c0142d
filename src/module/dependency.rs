//! 模块依赖管理
//!
//! 按模块名称维护依赖关系图。图中的节点是已安装的模块，边来自模块描述中
//! 声明的依赖，指向的模块可以尚未安装。安装时拒绝会闭合环路的依赖，
//! 因此图始终是无环的。
//!
//! # 示例
//!
//! ```rust
//! use chips_runtime::module::dependency::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_module("storage", Vec::<&str>::new()).unwrap();
//! graph.add_module("app", ["storage"]).unwrap();
//!
//! assert_eq!(graph.dependencies("app"), vec!["storage".to_string()]);
//! assert_eq!(graph.load_order().unwrap(), vec!["storage", "app"]);
//! assert!(graph.add_module("storage", ["app"]).is_err());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::utils::{CoreError, Result};

/// 模块依赖关系图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 已安装的模块
    modules: BTreeSet<String>,
    /// 正向边：模块 -> 它依赖的模块
    edges: BTreeMap<String, BTreeSet<String>>,
    /// 反向边：模块 -> 依赖它的模块
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// 创建空依赖图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块及其依赖
    ///
    /// 已存在的模块会先移除旧的依赖边再写入新的。
    ///
    /// # Errors
    ///
    /// 新的依赖会形成环路时返回 `CircularDependency`，图保持不变。
    pub fn add_module<I, S>(&mut self, name: &str, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let dependencies: BTreeSet<String> = dependencies
            .into_iter()
            .map(|d| d.as_ref().to_string())
            .collect();

        for dep in &dependencies {
            if dep == name {
                return Err(CoreError::CircularDependency(format!("{} -> {}", name, name)));
            }
            if let Some(mut path) = self.find_path(dep, name) {
                path.insert(0, name.to_string());
                return Err(CoreError::CircularDependency(path.join(" -> ")));
            }
        }

        self.remove_edges(name);
        for dep in &dependencies {
            self.reverse_edges
                .entry(dep.clone())
                .or_default()
                .insert(name.to_string());
        }
        self.edges.insert(name.to_string(), dependencies);
        self.modules.insert(name.to_string());
        Ok(())
    }

    /// 移除模块
    ///
    /// 只移除该模块声明的依赖边；其他模块指向它的边保留，
    /// 以便它被重新安装时仍能检测环路。
    pub fn remove_module(&mut self, name: &str) {
        self.remove_edges(name);
        self.modules.remove(name);
    }

    fn remove_edges(&mut self, name: &str) {
        if let Some(deps) = self.edges.remove(name) {
            for dep in deps {
                if let Some(dependents) = self.reverse_edges.get_mut(&dep) {
                    dependents.remove(name);
                    if dependents.is_empty() {
                        self.reverse_edges.remove(&dep);
                    }
                }
            }
        }
    }

    /// 直接依赖
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.edges
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 直接依赖方
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.reverse_edges
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 全部传递依赖方，按停止顺序排列（离 `name` 最远的在前）
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(name.to_string());
        for dependent in self.dependents(name) {
            self.collect_dependents(&dependent, &mut result, &mut visited);
        }
        result
    }

    fn collect_dependents(&self, name: &str, result: &mut Vec<String>, visited: &mut HashSet<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        for dependent in self.dependents(name) {
            self.collect_dependents(&dependent, result, visited);
        }
        result.push(name.to_string());
    }

    /// 沿依赖边查找从 `from` 到 `to` 的路径
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.find_path_util(from, to, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn find_path_util(
        &self,
        node: &str,
        target: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if !visited.insert(node.to_string()) {
            return false;
        }
        path.push(node.to_string());
        if node == target {
            return true;
        }
        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                if self.find_path_util(dep, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// 加载顺序（Kahn 算法）
    ///
    /// 只包含已安装的模块，依赖在依赖方之前；未安装的依赖被忽略。
    /// 同一层内按名称排序，结果是确定的。
    pub fn load_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .modules
            .iter()
            .map(|name| {
                let degree = self
                    .edges
                    .get(name)
                    .map(|deps| deps.iter().filter(|d| self.modules.contains(*d)).count())
                    .unwrap_or(0);
                (name.as_str(), degree)
            })
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut result = Vec::with_capacity(self.modules.len());
        while let Some(name) = queue.pop_front() {
            result.push(name.to_string());
            if let Some(dependents) = self.reverse_edges.get(name) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.as_str());
                        }
                    }
                }
            }
        }

        if result.len() != self.modules.len() {
            return Err(CoreError::CircularDependency(
                "无法完成拓扑排序".to_string(),
            ));
        }
        Ok(result)
    }

    /// 卸载顺序（加载顺序的反序）
    pub fn unload_order(&self) -> Result<Vec<String>> {
        let mut order = self.load_order()?;
        order.reverse();
        Ok(order)
    }

    /// 是否包含模块
    pub fn contains_module(&self, name: &str) -> bool {
        self.modules.contains(name)
    }

    /// 模块数量
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
