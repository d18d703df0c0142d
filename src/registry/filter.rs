//! 属性过滤器
//!
//! 在扁平属性表上做相等/子集匹配，不提供布尔查询语言。
//! 匹配规则（对过滤器中的每个键）：
//!
//! - 属性值与过滤值相等即匹配
//! - 属性值为数组、过滤值为标量时，数组包含该值即匹配
//! - 属性值与过滤值都是数组时，过滤值是属性值的子集即匹配
//!
//! 空过滤器匹配一切。

use serde_json::Value;

use super::service::Properties;

/// 属性过滤器
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyFilter {
    constraints: Properties,
}

impl PropertyFilter {
    /// 匹配一切的空过滤器
    pub fn any() -> Self {
        Self::default()
    }

    /// 从属性表构造过滤器
    pub fn from_properties(constraints: Properties) -> Self {
        Self { constraints }
    }

    /// 追加一个约束
    ///
    /// ```
    /// use chips_runtime::registry::PropertyFilter;
    /// use chips_runtime::service_props;
    ///
    /// let filter = PropertyFilter::any().with("endpoint.kind", "action");
    /// assert!(filter.matches(&service_props! { "endpoint.kind" => "action", "x" => 1 }));
    /// assert!(!filter.matches(&service_props! { "endpoint.kind" => "task" }));
    /// ```
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    /// 是否为空过滤器
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// 判断属性表是否满足过滤器
    pub fn matches(&self, properties: &Properties) -> bool {
        self.constraints.iter().all(|(key, expected)| {
            properties
                .get(key)
                .map(|actual| value_matches(actual, expected))
                .unwrap_or(false)
        })
    }
}

fn value_matches(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Array(items), Value::Array(wanted)) => wanted.iter().all(|w| items.contains(w)),
        (Value::Array(items), scalar) => items.contains(scalar),
        _ => false,
    }
}
