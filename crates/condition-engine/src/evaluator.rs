//! 条件评估器
//!
//! 评估器是可插拔的执行策略：内置的谓词评估器和正则评估器，
//! 以及通过 [`CustomEvaluator`] 按具体数据类型实现的自定义评估器。

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::Disposable;
use crate::data::{DataType, Payload};
use crate::error::{DisposeError, Result, RuleError};
use crate::models::{Condition, ConditionKind};

/// 评估器输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluatorOutcome {
    pub is_success: bool,
    /// 覆盖条件上声明的失败消息模板
    pub failure_message: Option<String>,
    /// 合并到条件结果的附加信息中
    pub additional_info: BTreeMap<String, String>,
}

impl EvaluatorOutcome {
    pub fn success() -> Self {
        Self::from_bool(true)
    }

    pub fn failure() -> Self {
        Self::from_bool(false)
    }

    pub fn from_bool(is_success: bool) -> Self {
        Self {
            is_success,
            ..Default::default()
        }
    }

    pub fn with_failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_info.insert(key.into(), value.into());
        self
    }
}

/// 条件评估器
///
/// `cancel` 是协作式取消信号，耗时的评估器应自行检查。
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        condition: &Condition,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> Result<EvaluatorOutcome>;

    /// 缓存中的评估器被替换或移除时调用
    fn dispose(&self) -> std::result::Result<(), DisposeError> {
        Ok(())
    }
}

/// 缓存中保存的评估器句柄，释放时转发到评估器
pub struct CachedEvaluator(pub Arc<dyn ConditionEvaluator>);

impl Disposable for CachedEvaluator {
    fn dispose(&self) -> std::result::Result<(), DisposeError> {
        self.0.dispose()
    }
}

/// 内置谓词评估器：执行闭包谓词或编译后的字符串谓词
#[derive(Debug, Default)]
pub struct PredicateEvaluator;

#[async_trait]
impl ConditionEvaluator for PredicateEvaluator {
    async fn evaluate(
        &self,
        condition: &Condition,
        payload: &Payload,
        _cancel: &CancellationToken,
    ) -> Result<EvaluatorOutcome> {
        let passed = match condition.kind() {
            ConditionKind::Predicate(predicate) => predicate(payload)?,
            ConditionKind::PredicateExpression(Ok(expression)) => {
                expression.evaluate(payload.json()?)?
            }
            ConditionKind::PredicateExpression(Err(e)) => {
                return Err(RuleError::PredicateCompilation(e.clone()));
            }
            other => return Err(unsupported("predicate", condition, other)),
        };
        Ok(EvaluatorOutcome::from_bool(passed))
    }
}

/// 内置正则评估器：取属性路径上的值做正则匹配
///
/// 值为 null 视为不匹配；数字和布尔值按文本匹配。
#[derive(Debug, Default)]
pub struct RegexEvaluator;

#[async_trait]
impl ConditionEvaluator for RegexEvaluator {
    async fn evaluate(
        &self,
        condition: &Condition,
        payload: &Payload,
        _cancel: &CancellationToken,
    ) -> Result<EvaluatorOutcome> {
        let ConditionKind::Regex { path, regex, .. } = condition.kind() else {
            return Err(unsupported("regex", condition, condition.kind()));
        };
        let path = path.as_ref().map_err(|e| RuleError::PredicateCompilation(e.clone()))?;
        let regex = regex.as_ref().map_err(|e| RuleError::PredicateCompilation(e.clone()))?;

        let matched = match path.resolve_required(payload.json()?)? {
            Value::Null => false,
            Value::String(s) => regex.is_match(s),
            Value::Number(n) => regex.is_match(&n.to_string()),
            Value::Bool(b) => regex.is_match(&b.to_string()),
            other => {
                return Err(RuleError::TypeMismatch {
                    expected: "string".to_string(),
                    actual: if other.is_array() { "array" } else { "object" }.to_string(),
                });
            }
        };
        Ok(EvaluatorOutcome::from_bool(matched))
    }
}

fn unsupported(evaluator: &str, condition: &Condition, kind: &ConditionKind) -> RuleError {
    RuleError::EvaluatorFailed {
        evaluator_name: evaluator.to_string(),
        message: format!("条件 {} 的形态 {:?} 不受支持", condition.condition_name, kind),
    }
}

/// 按具体数据类型实现的自定义评估器
#[async_trait]
pub trait CustomEvaluator<D: DataType>: Send + Sync {
    async fn evaluate(
        &self,
        condition: &Condition,
        data: &D,
        cancel: &CancellationToken,
    ) -> Result<EvaluatorOutcome>;

    fn dispose(&self) -> std::result::Result<(), DisposeError> {
        Ok(())
    }
}

/// 把 [`CustomEvaluator`] 适配为 [`ConditionEvaluator`]
pub struct TypedEvaluator<D, E> {
    inner: E,
    _data: PhantomData<fn() -> D>,
}

impl<D, E> TypedEvaluator<D, E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            _data: PhantomData,
        }
    }
}

#[async_trait]
impl<D, E> ConditionEvaluator for TypedEvaluator<D, E>
where
    D: DataType,
    E: CustomEvaluator<D>,
{
    async fn evaluate(
        &self,
        condition: &Condition,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> Result<EvaluatorOutcome> {
        let data = payload
            .downcast_ref::<D>()
            .ok_or_else(|| RuleError::TypeMismatch {
                expected: D::TYPE_NAME.to_string(),
                actual: payload.type_name().to_string(),
            })?;
        self.inner.evaluate(condition, data, cancel).await
    }

    fn dispose(&self) -> std::result::Result<(), DisposeError> {
        self.inner.dispose()
    }
}

/// 创建类型适配后的评估器实例
pub fn typed_evaluator<D, E>(inner: E) -> Arc<dyn ConditionEvaluator>
where
    D: DataType,
    E: CustomEvaluator<D> + 'static,
{
    Arc::new(TypedEvaluator::<D, E>::new(inner))
}
