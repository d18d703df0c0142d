//! 端点模型
//!
//! 端点把模块的一个方法包装成可注册、可调用的服务。模块激活时按
//! [`EndpointDeclaration`] 表构建端点，以 `ServiceType::of::<Endpoint>()`
//! 注册，元数据展开为注册属性，消费方按属性过滤即可发现端点。
//!
//! 端点只记录方法签名，不持有实例：调用时从模块的实例槽位取当前实例。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use super::invoker::{InvocationEnv, Invoker};
use super::resolver::ParameterResolver;
use crate::module::runtime::{InstanceSlot, ModuleInstance};
use crate::registry::{ModuleId, Properties};
use crate::utils::{CallStats, CallStatsSnapshot, CoreError, Result};

/// 方法调用返回的 future
pub type MethodFuture = BoxFuture<'static, Result<Value>>;

/// 类型擦除的方法实现
pub type MethodRef = Arc<dyn Fn(ModuleInstance, Vec<Value>) -> MethodFuture + Send + Sync>;

/// 默认端点类别
pub const DEFAULT_KIND: &str = "endpoint";

/// 注册属性键
pub mod keys {
    /// 端点类别
    pub const KIND: &str = "endpoint.kind";
    /// 声明类型
    pub const DECLARING_TYPE: &str = "endpoint.declaring_type";
    /// 方法名
    pub const METHOD: &str = "endpoint.method";
    /// 完整签名
    pub const SIGNATURE: &str = "endpoint.signature";
    /// 返回类型
    pub const RETURN_TYPE: &str = "endpoint.return_type";
    /// 所属模块 ID
    pub const MODULE_ID: &str = "module.id";
    /// 所属模块名称
    pub const MODULE_NAME: &str = "module.name";
}

/// 参数属性键
pub mod attrs {
    /// 从此上下文键取值
    pub const KEY: &str = "key";
    /// 缺省值
    pub const DEFAULT: &str = "default";
    /// 可选参数，缺失时为 null
    pub const OPTIONAL: &str = "optional";
    /// 不允许为 null
    pub const REQUIRED: &str = "required";
}

/// 以具体实例类型包装方法实现
///
/// 实例在调用时从 [`ModuleInstance`] 向下转换为 `Arc<T>`。
///
/// ```
/// use std::sync::Arc;
/// use serde_json::{json, Value};
/// use chips_runtime::endpoint::handler;
///
/// struct Greeter {
///     greeting: String,
/// }
///
/// let method = handler(|greeter: Arc<Greeter>, args: Vec<Value>| async move {
///     let name = args.first().and_then(Value::as_str).unwrap_or("world");
///     Ok(json!(format!("{}, {}", greeter.greeting, name)))
/// });
/// ```
pub fn handler<T, F, Fut>(f: F) -> MethodRef
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |instance: ModuleInstance, args: Vec<Value>| -> MethodFuture {
        match instance.downcast::<T>() {
            Ok(typed) => Box::pin(f(typed, args)),
            Err(_) => {
                let reason = format!("模块实例不是 {}", std::any::type_name::<T>());
                Box::pin(async move { Err::<Value, _>(CoreError::Internal(reason)) })
            }
        }
    })
}

// ============================================================================
// 参数与声明
// ============================================================================

/// 形式参数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    /// 参数名
    pub name: String,
    /// 参数类型名
    pub type_name: String,
    /// 参数属性，内置解析器与拦截器读取其中的 `key`、`default`、`optional`、`required`
    pub attributes: Properties,
}

impl Parameter {
    /// 创建参数
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            attributes: Properties::new(),
        }
    }

    /// 设置属性
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// 从指定上下文键取值
    pub fn key(self, key: impl Into<String>) -> Self {
        self.with_attribute(attrs::KEY, key.into())
    }

    /// 缺省值
    pub fn default_value(self, value: impl Into<Value>) -> Self {
        self.with_attribute(attrs::DEFAULT, value)
    }

    /// 标记为可选
    pub fn optional(self) -> Self {
        self.with_attribute(attrs::OPTIONAL, true)
    }

    /// 标记为必填（非 null）
    pub fn required(self) -> Self {
        self.with_attribute(attrs::REQUIRED, true)
    }

    /// 读取参数属性
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// 布尔属性是否为 true
    pub fn is_flagged(&self, key: &str) -> bool {
        matches!(self.attributes.get(key), Some(Value::Bool(true)))
    }
}

/// 端点元数据
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointMetadata {
    /// 声明方法的类型名
    pub declaring_type: String,
    /// 方法名
    pub method_name: String,
    /// 返回类型名
    pub return_type: String,
    /// 形参列表，按调用顺序
    pub parameters: Vec<Parameter>,
    /// 端点种类，如 `action`
    pub kind: String,
    /// 附加属性，发布时展开到注册属性中
    pub attributes: Properties,
    /// 排序权重
    pub rank: i32,
}

impl EndpointMetadata {
    /// 签名：`Type::method(T1, T2)`
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self
            .parameters
            .iter()
            .map(|p| p.type_name.as_str())
            .collect();
        format!(
            "{}::{}({})",
            self.declaring_type,
            self.method_name,
            types.join(", ")
        )
    }
}

/// 端点声明
///
/// 模块代码单元在端点表中返回声明，激活时由模块管理器构建为 [`Endpoint`]。
#[derive(Clone)]
pub struct EndpointDeclaration {
    metadata: EndpointMetadata,
    method: MethodRef,
}

impl EndpointDeclaration {
    /// 声明端点
    pub fn new(declaring_type: impl Into<String>, method_name: impl Into<String>, method: MethodRef) -> Self {
        Self {
            metadata: EndpointMetadata {
                declaring_type: declaring_type.into(),
                method_name: method_name.into(),
                return_type: "()".to_string(),
                parameters: Vec::new(),
                kind: DEFAULT_KIND.to_string(),
                attributes: Properties::new(),
                rank: 0,
            },
            method,
        }
    }

    /// 追加形式参数
    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.metadata.parameters.push(parameter);
        self
    }

    /// 返回类型
    pub fn returns(mut self, return_type: impl Into<String>) -> Self {
        self.metadata.return_type = return_type.into();
        self
    }

    /// 端点类别
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.metadata.kind = kind.into();
        self
    }

    /// 类别相关属性，注册时展开为服务属性
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.attributes.insert(key.into(), value.into());
        self
    }

    /// 注册排序等级
    pub fn rank(mut self, rank: i32) -> Self {
        self.metadata.rank = rank;
        self
    }

    /// 端点元数据
    pub fn metadata(&self) -> &EndpointMetadata {
        &self.metadata
    }

    /// 端点签名 `Type.method(T1, T2)`
    pub fn signature(&self) -> String {
        self.metadata.signature()
    }

    pub(crate) fn into_parts(self) -> (EndpointMetadata, MethodRef) {
        (self.metadata, self.method)
    }
}

impl fmt::Debug for EndpointDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDeclaration")
            .field("signature", &self.signature())
            .field("kind", &self.metadata.kind)
            .finish()
    }
}

// ============================================================================
// 端点
// ============================================================================

/// 端点
pub struct Endpoint {
    metadata: EndpointMetadata,
    signature: String,
    module_id: ModuleId,
    module_name: String,
    slot: InstanceSlot,
    env: InvocationEnv,
    stats: CallStats,
}

impl Endpoint {
    pub(crate) fn new(
        metadata: EndpointMetadata,
        module_id: ModuleId,
        module_name: impl Into<String>,
        slot: InstanceSlot,
        env: InvocationEnv,
    ) -> Self {
        let signature = metadata.signature();
        Self {
            metadata,
            signature,
            module_id,
            module_name: module_name.into(),
            slot,
            env,
            stats: CallStats::new(),
        }
    }

    /// 端点签名
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// 端点元数据
    pub fn metadata(&self) -> &EndpointMetadata {
        &self.metadata
    }

    /// 声明方法的类型名
    pub fn declaring_type(&self) -> &str {
        &self.metadata.declaring_type
    }

    /// 方法名
    pub fn method_name(&self) -> &str {
        &self.metadata.method_name
    }

    /// 返回类型名
    pub fn return_type(&self) -> &str {
        &self.metadata.return_type
    }

    /// 形参列表
    pub fn parameters(&self) -> &[Parameter] {
        &self.metadata.parameters
    }

    /// 端点种类
    pub fn kind(&self) -> &str {
        &self.metadata.kind
    }

    /// 读取附加属性
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.metadata.attributes.get(key)
    }

    /// 所属模块 ID
    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    /// 所属模块名称
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// 展开后的注册属性
    ///
    /// 类别属性在前，保留键会覆盖同名的类别属性。
    pub fn properties(&self) -> Properties {
        let mut props = self.metadata.attributes.clone();
        props.insert(keys::KIND.to_string(), Value::from(self.metadata.kind.clone()));
        props.insert(
            keys::DECLARING_TYPE.to_string(),
            Value::from(self.metadata.declaring_type.clone()),
        );
        props.insert(keys::METHOD.to_string(), Value::from(self.metadata.method_name.clone()));
        props.insert(keys::SIGNATURE.to_string(), Value::from(self.signature.clone()));
        props.insert(
            keys::RETURN_TYPE.to_string(),
            Value::from(self.metadata.return_type.clone()),
        );
        props.insert(keys::MODULE_ID.to_string(), Value::from(self.module_id));
        props.insert(keys::MODULE_NAME.to_string(), Value::from(self.module_name.clone()));
        props
    }

    /// 所属模块当前是否提供实现
    pub fn is_available(&self) -> bool {
        self.target().is_some()
    }

    /// 创建调用器
    ///
    /// 不做任何校验，参数解析推迟到 [`Invoker::resolve`]。
    pub fn create_invoker(self: &Arc<Self>, resolvers: Vec<Arc<dyn ParameterResolver>>) -> Invoker {
        Invoker::new(self.clone(), resolvers)
    }

    /// 本端点的调用统计
    pub fn stats(&self) -> CallStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn target(&self) -> Option<(ModuleInstance, MethodRef)> {
        self.slot
            .load_full()
            .and_then(|active| active.target(&self.signature))
    }

    pub(crate) fn env(&self) -> &InvocationEnv {
        &self.env
    }

    pub(crate) fn record(&self, success: bool, latency: Duration) {
        self.stats.record(success, latency);
        self.env.stats_handle().record(success, latency);
    }

    pub(crate) fn record_unavailable(&self) {
        self.stats.record_unavailable();
        self.env.stats_handle().record_unavailable();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("signature", &self.signature)
            .field("kind", &self.metadata.kind)
            .field("module", &self.module_name)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::runtime::ActiveInstance;
    use arc_swap::ArcSwapOption;
    use serde_json::json;
    use std::collections::HashMap;

    struct Greeter;

    fn greet_declaration() -> EndpointDeclaration {
        EndpointDeclaration::new(
            "Greeter",
            "greet",
            handler(|_: Arc<Greeter>, args: Vec<Value>| async move {
                Ok(json!(format!("Hello, {}", args[0].as_str().unwrap_or_default())))
            }),
        )
        .parameter(Parameter::new("name", "String"))
        .parameter(Parameter::new("times", "u32").default_value(1))
        .returns("String")
        .kind("action")
        .attribute("path", "/greet")
        .attribute(keys::KIND, "spoofed")
    }

    #[test]
    fn test_signature() {
        let decl = greet_declaration();
        assert_eq!(decl.signature(), "Greeter::greet(String, u32)");

        let empty = EndpointDeclaration::new("A", "f", handler(|_: Arc<Greeter>, _| async { Ok(Value::Null) }));
        assert_eq!(empty.signature(), "A::f()");
        assert_eq!(empty.metadata().kind, DEFAULT_KIND);
    }

    #[test]
    fn test_parameter_flags() {
        let p = Parameter::new("id", "u64").required().key("user.id");
        assert!(p.is_flagged(attrs::REQUIRED));
        assert!(!p.is_flagged(attrs::OPTIONAL));
        assert_eq!(p.attribute(attrs::KEY), Some(&json!("user.id")));
    }

    #[test]
    fn test_properties_are_flattened() {
        let (metadata, _) = greet_declaration().into_parts();
        let slot: InstanceSlot = Arc::new(ArcSwapOption::empty());
        let endpoint = Endpoint::new(metadata, 3, "greeter", slot, InvocationEnv::default());

        let props = endpoint.properties();
        assert_eq!(props[keys::KIND], json!("action"));
        assert_eq!(props[keys::SIGNATURE], json!("Greeter::greet(String, u32)"));
        assert_eq!(props[keys::MODULE_ID], json!(3));
        assert_eq!(props[keys::MODULE_NAME], json!("greeter"));
        assert_eq!(props["path"], json!("/greet"));
    }

    #[tokio::test]
    async fn test_target_follows_slot() {
        let (metadata, method) = greet_declaration().into_parts();
        let slot: InstanceSlot = Arc::new(ArcSwapOption::empty());
        let endpoint = Endpoint::new(metadata, 1, "greeter", slot.clone(), InvocationEnv::default());
        assert!(!endpoint.is_available());

        let mut methods = HashMap::new();
        methods.insert(endpoint.signature().to_string(), method);
        slot.store(Some(Arc::new(ActiveInstance::new(Arc::new(Greeter), methods))));
        assert!(endpoint.is_available());

        let (instance, method) = endpoint.target().unwrap();
        let out = method(instance, vec![json!("Bob"), json!(1)]).await.unwrap();
        assert_eq!(out, json!("Hello, Bob"));

        slot.store(None);
        assert!(!endpoint.is_available());
    }

    #[tokio::test]
    async fn test_handler_rejects_wrong_instance() {
        let method = handler(|_: Arc<Greeter>, _| async { Ok(Value::Null) });
        let err = method(Arc::new(5u8), Vec::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
    }
}
