//! 条件引擎错误类型
//!
//! 只有结构性错误（规则不存在、评估器缺失等）会返回给调用方，
//! 条件级别的失败全部以 `Arc<RuleError>` 的形式记录到评估结果中。

use thiserror::Error;

/// 表达式编译错误
///
/// 记录原始表达式、出错位置（字节偏移）和原因，可克隆以便存放在条件中。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("表达式 '{source_text}' 在位置 {position} 编译失败: {reason}")]
pub struct CompileError {
    pub source_text: String,
    pub position: usize,
    pub reason: String,
}

impl CompileError {
    pub fn new(source_text: impl Into<String>, position: usize, reason: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            position,
            reason: reason.into(),
        }
    }
}

/// 缓存项释放钩子返回的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DisposeError(pub String);

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("规则未找到: {rule_name} (tenant={tenant_id}, culture={culture_id})")]
    RuleNotFound {
        rule_name: String,
        tenant_id: String,
        culture_id: String,
    },

    #[error("规则 {rule_name} 的数据类型与请求的类型 {expected} 不一致")]
    RuleTypeMismatch { rule_name: String, expected: String },

    #[error("未找到评估器: {evaluator_name} (数据类型 {data_type})")]
    MissingEvaluator {
        evaluator_name: String,
        data_type: String,
    },

    #[error("谓词编译失败: {0}")]
    PredicateCompilation(#[from] CompileError),

    #[error("属性不存在: {path}")]
    PropertyNotFound { path: String },

    #[error("条件 {condition_name} 缺少类型为 {context_type} 的数据上下文")]
    MissingDataContext {
        condition_name: String,
        context_type: String,
    },

    #[error("条件 {condition_name} 期望数据类型 {expected}, 实际 {actual}")]
    ContextTypeMismatch {
        condition_name: String,
        expected: String,
        actual: String,
    },

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("释放已移除的缓存项失败: {key}")]
    DisposingRemovedItem {
        key: String,
        #[source]
        source: DisposeError,
    },

    #[error("获取缓存锁超时: {key}")]
    LockTimeout { key: String },

    #[error("缓存项类型不匹配: {key}")]
    CacheTypeMismatch { key: String },

    #[error("评估器 {evaluator_name} 执行失败: {message}")]
    EvaluatorFailed {
        evaluator_name: String,
        message: String,
    },

    #[error("条件 {condition_name} 使用闭包谓词，无法序列化")]
    NotSerializable { condition_name: String },

    #[error("评估已取消")]
    Cancelled,

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::RuleNotFound { .. } => "RULE_NOT_FOUND",
            Self::RuleTypeMismatch { .. } => "RULE_TYPE_MISMATCH",
            Self::MissingEvaluator { .. } => "MISSING_EVALUATOR",
            Self::PredicateCompilation(_) => "PREDICATE_COMPILATION",
            Self::PropertyNotFound { .. } => "PROPERTY_NOT_FOUND",
            Self::MissingDataContext { .. } => "MISSING_DATA_CONTEXT",
            Self::ContextTypeMismatch { .. } => "CONTEXT_TYPE_MISMATCH",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::DisposingRemovedItem { .. } => "DISPOSING_REMOVED_ITEM",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::CacheTypeMismatch { .. } => "CACHE_TYPE_MISMATCH",
            Self::EvaluatorFailed { .. } => "EVALUATOR_FAILED",
            Self::NotSerializable { .. } => "NOT_SERIALIZABLE",
            Self::Cancelled => "CANCELLED",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// 是否属于数据上下文相关的失败
    pub fn is_data_context_error(&self) -> bool {
        matches!(
            self,
            Self::MissingDataContext { .. } | Self::ContextTypeMismatch { .. }
        )
    }
}
