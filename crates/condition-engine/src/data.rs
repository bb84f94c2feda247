//! 评估数据上下文
//!
//! 调用方通过 [`ConditionDataBuilder`] 把任意类型的数据与条件名（或通配）关联，
//! 生成不可变、有序、已去重的 [`ConditionData`]，在规则评估时按条件选择数据。

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use serde_json::Value;

use crate::cache::ALL_TENANTS;
use crate::error::{Result, RuleError};

/// 可参与评估的数据类型
///
/// `TYPE_NAME` 是稳定的类型标识，条件的 `context_type` 和 JSON 规则都通过它引用数据类型。
pub trait DataType: Serialize + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

trait ErasedData: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn to_json(&self) -> serde_json::Result<Value>;
}

impl<D: DataType> ErasedData for D {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// 类型擦除后的数据负载
///
/// 既可以按原类型取回（闭包谓词、自定义评估器），也可以取 JSON 快照
/// （属性路径、字符串谓词、失败消息占位符）。JSON 快照首次使用时计算并缓存。
#[derive(Clone)]
pub struct Payload {
    type_name: &'static str,
    data: Arc<dyn ErasedData>,
    snapshot: Arc<OnceLock<std::result::Result<Value, String>>>,
}

impl Payload {
    pub fn new<D: DataType>(data: D) -> Self {
        Self {
            type_name: D::TYPE_NAME,
            data: Arc::new(data),
            snapshot: Arc::new(OnceLock::new()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<D: DataType>(&self) -> bool {
        self.data.as_any().is::<D>()
    }

    pub fn downcast_ref<D: DataType>(&self) -> Option<&D> {
        self.data.as_any().downcast_ref::<D>()
    }

    /// 获取 JSON 快照
    pub fn json(&self) -> Result<&Value> {
        let snapshot = self
            .snapshot
            .get_or_init(|| self.data.to_json().map_err(|e| e.to_string()));

        snapshot.as_ref().map_err(|reason| RuleError::TypeMismatch {
            expected: format!("可序列化的 {}", self.type_name),
            actual: reason.clone(),
        })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// 单个数据上下文：数据 + 关联的条件名（空字符串表示适用于任意条件）
#[derive(Debug, Clone)]
pub struct DataContext {
    pub data: Payload,
    pub condition_name: String,
}

impl DataContext {
    pub fn is_for_any(&self) -> bool {
        self.condition_name.is_empty()
    }
}

/// 一次评估使用的全部数据上下文，以及数据所属租户
#[derive(Debug, Clone)]
pub struct ConditionData {
    contexts: Arc<[DataContext]>,
    tenant_id: String,
}

impl ConditionData {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn contexts(&self) -> &[DataContext] {
        &self.contexts
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// 为条件选择数据上下文
    ///
    /// 优先使用显式标记了该条件名的上下文；否则使用第一个未标记且类型匹配的上下文。
    pub fn find_for_condition(&self, condition_name: &str, context_type: &str) -> Result<&Payload> {
        if let Some(named) = self
            .contexts
            .iter()
            .find(|c| !c.is_for_any() && c.condition_name == condition_name)
        {
            if named.data.type_name() != context_type {
                return Err(RuleError::ContextTypeMismatch {
                    condition_name: condition_name.to_string(),
                    expected: context_type.to_string(),
                    actual: named.data.type_name().to_string(),
                });
            }
            return Ok(&named.data);
        }

        self.contexts
            .iter()
            .find(|c| c.is_for_any() && c.data.type_name() == context_type)
            .map(|c| &c.data)
            .ok_or_else(|| RuleError::MissingDataContext {
                condition_name: condition_name.to_string(),
                context_type: context_type.to_string(),
            })
    }
}

/// 数据上下文构建器
///
/// 去重规则（先写入者优先）：
/// - 带条件名的上下文：已有相同条件名的上下文时丢弃
/// - 通配上下文：已有同类型数据的上下文时丢弃
#[derive(Debug, Default)]
pub struct ConditionDataBuilder {
    contexts: Vec<DataContext>,
}

impl ConditionDataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加只供指定条件使用的数据
    pub fn for_condition<D: DataType>(mut self, condition_name: impl Into<String>, data: D) -> Self {
        let condition_name = condition_name.into();
        if condition_name.is_empty() {
            return self.for_any(data);
        }
        if !self
            .contexts
            .iter()
            .any(|c| c.condition_name == condition_name)
        {
            self.contexts.push(DataContext {
                data: Payload::new(data),
                condition_name,
            });
        }
        self
    }

    /// 添加可供任意条件按类型匹配使用的数据
    pub fn for_any<D: DataType>(mut self, data: D) -> Self {
        if !self.contexts.iter().any(|c| c.data.is::<D>()) {
            self.contexts.push(DataContext {
                data: Payload::new(data),
                condition_name: String::new(),
            });
        }
        self
    }

    /// 构建属于所有租户的数据
    pub fn build(self) -> ConditionData {
        self.build_for_tenant(ALL_TENANTS)
    }

    /// 构建属于指定租户的数据
    pub fn build_for_tenant(self, tenant_id: impl Into<String>) -> ConditionData {
        ConditionData {
            contexts: self.contexts.into(),
            tenant_id: tenant_id.into(),
        }
    }
}
