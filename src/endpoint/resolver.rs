//! 参数解析
//!
//! 每个解析器是形式参数与调用上下文的纯函数：返回一个值，或者
//! [`Resolution::Skip`] 交给下一个解析器。`null` 也是有效的解析结果。
//! 调用器按 `(调用方解析器..., 内置解析器...)` 的顺序逐个尝试。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::endpoint::{attrs, Parameter};

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// 不处理此参数
    Skip,
    /// 解析出的值
    Value(Value),
}

impl Resolution {
    fn from_option(value: Option<&Value>) -> Self {
        match value {
            Some(value) => Resolution::Value(value.clone()),
            None => Resolution::Skip,
        }
    }
}

/// 调用上下文（键值表）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionContext {
    values: HashMap<String, Value>,
}

impl ResolutionContext {
    /// 创建空上下文
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个键值（构建器形式）
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// 写入条目
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// 读取条目
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// 是否包含条目
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// 条目数量
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 遍历全部条目
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// 整个上下文作为 JSON 对象
    pub fn to_object(&self) -> Value {
        let map: Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

impl From<HashMap<String, Value>> for ResolutionContext {
    fn from(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for ResolutionContext {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// 参数解析器
pub trait ParameterResolver: Send + Sync {
    /// 解析一个形式参数；不得修改上下文
    fn resolve(&self, parameter: &Parameter, context: &ResolutionContext) -> Resolution;
}

// ============================================================================
// 内置解析器
// ============================================================================

/// 按参数属性 `key` 指定的上下文键取值
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeKeyResolver;

impl ParameterResolver for AttributeKeyResolver {
    fn resolve(&self, parameter: &Parameter, context: &ResolutionContext) -> Resolution {
        match parameter.attribute(attrs::KEY).and_then(Value::as_str) {
            Some(key) => Resolution::from_option(context.get(key)),
            None => Resolution::Skip,
        }
    }
}

/// 以参数名为上下文键取值
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedResolver;

impl ParameterResolver for NamedResolver {
    fn resolve(&self, parameter: &Parameter, context: &ResolutionContext) -> Resolution {
        Resolution::from_option(context.get(&parameter.name))
    }
}

/// 使用参数属性 `default`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValueResolver;

impl ParameterResolver for DefaultValueResolver {
    fn resolve(&self, parameter: &Parameter, _context: &ResolutionContext) -> Resolution {
        Resolution::from_option(parameter.attribute(attrs::DEFAULT))
    }
}

/// 可选参数解析为 null
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionalResolver;

impl ParameterResolver for OptionalResolver {
    fn resolve(&self, parameter: &Parameter, _context: &ResolutionContext) -> Resolution {
        if parameter.is_flagged(attrs::OPTIONAL) {
            Resolution::Value(Value::Null)
        } else {
            Resolution::Skip
        }
    }
}

/// 内置解析器，按固定顺序：属性键、参数名、缺省值、可选
pub fn builtin_resolvers() -> Vec<Arc<dyn ParameterResolver>> {
    vec![
        Arc::new(AttributeKeyResolver),
        Arc::new(NamedResolver),
        Arc::new(DefaultValueResolver),
        Arc::new(OptionalResolver),
    ]
}

// ============================================================================
// 通用解析器
// ============================================================================

/// 把指定上下文键映射到指定参数
#[derive(Debug, Clone)]
pub struct ContextKeyResolver {
    key: String,
    parameter: String,
}

impl ContextKeyResolver {
    /// 把上下文中的 `key` 映射到名为 `parameter` 的参数
    pub fn new(key: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            parameter: parameter.into(),
        }
    }
}

impl ParameterResolver for ContextKeyResolver {
    fn resolve(&self, parameter: &Parameter, context: &ResolutionContext) -> Resolution {
        if parameter.name == self.parameter {
            Resolution::from_option(context.get(&self.key))
        } else {
            Resolution::Skip
        }
    }
}

#[derive(Debug, Clone)]
enum MapTarget {
    Name(String),
    Type(String),
}

/// 把整个上下文作为对象传给参数
#[derive(Debug, Clone)]
pub struct ContextMapResolver {
    target: MapTarget,
}

impl ContextMapResolver {
    /// 按参数名匹配
    pub fn for_parameter(name: impl Into<String>) -> Self {
        Self {
            target: MapTarget::Name(name.into()),
        }
    }

    /// 按参数类型名匹配
    pub fn for_type(type_name: impl Into<String>) -> Self {
        Self {
            target: MapTarget::Type(type_name.into()),
        }
    }
}

impl ParameterResolver for ContextMapResolver {
    fn resolve(&self, parameter: &Parameter, context: &ResolutionContext) -> Resolution {
        let matched = match self.target {
            MapTarget::Name(ref name) => parameter.name == *name,
            MapTarget::Type(ref type_name) => parameter.type_name == *type_name,
        };
        if matched {
            Resolution::Value(context.to_object())
        } else {
            Resolution::Skip
        }
    }
}

type ResolveFn = dyn Fn(&Parameter, &ResolutionContext) -> Resolution + Send + Sync;

/// 基于闭包的解析器
pub struct FnResolver {
    f: Box<ResolveFn>,
}

impl FnResolver {
    /// 以闭包创建解析器
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Parameter, &ResolutionContext) -> Resolution + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

impl ParameterResolver for FnResolver {
    fn resolve(&self, parameter: &Parameter, context: &ResolutionContext) -> Resolution {
        (self.f)(parameter, context)
    }
}

impl fmt::Debug for FnResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnResolver")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ResolutionContext {
        ResolutionContext::new()
            .with("name", "Bob")
            .with("user.id", 7)
            .with("missing", Value::Null)
    }

    #[test]
    fn test_attribute_key_resolver() {
        let p = Parameter::new("id", "u64").key("user.id");
        assert_eq!(AttributeKeyResolver.resolve(&p, &context()), Resolution::Value(json!(7)));

        let p = Parameter::new("id", "u64").key("nope");
        assert_eq!(AttributeKeyResolver.resolve(&p, &context()), Resolution::Skip);
        assert_eq!(
            AttributeKeyResolver.resolve(&Parameter::new("id", "u64"), &context()),
            Resolution::Skip
        );
    }

    #[test]
    fn test_named_resolver_keeps_null() {
        let p = Parameter::new("missing", "String");
        assert_eq!(NamedResolver.resolve(&p, &context()), Resolution::Value(Value::Null));
        assert_eq!(
            NamedResolver.resolve(&Parameter::new("other", "String"), &context()),
            Resolution::Skip
        );
    }

    #[test]
    fn test_default_and_optional() {
        let p = Parameter::new("times", "u32").default_value(3);
        assert_eq!(DefaultValueResolver.resolve(&p, &context()), Resolution::Value(json!(3)));

        let p = Parameter::new("tag", "String").optional();
        assert_eq!(OptionalResolver.resolve(&p, &context()), Resolution::Value(Value::Null));
        assert_eq!(
            OptionalResolver.resolve(&Parameter::new("tag", "String"), &context()),
            Resolution::Skip
        );
    }

    #[test]
    fn test_context_key_resolver() {
        let r = ContextKeyResolver::new("name", "who");
        assert_eq!(
            r.resolve(&Parameter::new("who", "String"), &context()),
            Resolution::Value(json!("Bob"))
        );
        assert_eq!(r.resolve(&Parameter::new("name", "String"), &context()), Resolution::Skip);
    }

    #[test]
    fn test_context_map_resolver() {
        let r = ContextMapResolver::for_type("Map");
        match r.resolve(&Parameter::new("all", "Map"), &context()) {
            Resolution::Value(Value::Object(map)) => {
                assert_eq!(map.len(), 3);
                assert_eq!(map["name"], json!("Bob"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        let r = ContextMapResolver::for_parameter("all");
        assert_eq!(r.resolve(&Parameter::new("x", "Map"), &context()), Resolution::Skip);
    }

    #[test]
    fn test_fn_resolver() {
        let r = FnResolver::new(|p, _| {
            if p.type_name == "Uuid" {
                Resolution::Value(json!("fixed"))
            } else {
                Resolution::Skip
            }
        });
        assert_eq!(r.resolve(&Parameter::new("id", "Uuid"), &context()), Resolution::Value(json!("fixed")));
    }

    #[test]
    fn test_context_from_iter() {
        let ctx: ResolutionContext = vec![("a", json!(1)), ("b", json!(2))].into_iter().collect();
        assert_eq!(ctx.len(), 2);
        assert!(ctx.contains("a"));
        assert_eq!(builtin_resolvers().len(), 4);
    }
}
