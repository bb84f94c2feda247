//! 条件引擎
//!
//! 可嵌入的规则/条件评估引擎，支持：
//! - 按租户、区域隔离的规则与评估器缓存（按键加锁，同一键只构建一次）
//! - 闭包谓词、字符串谓词、正则和自定义评估器
//! - JSON 规则加载与序列化，加载时编译表达式
//! - 条件集 OR 串联、短路和协作式取消
//! - 评估结果链与按租户路由的 fire-and-forget 事件

pub mod cache;
pub mod compiler;
pub mod config;
pub mod data;
pub mod document;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod models;
pub mod observability;
pub mod resolver;
pub mod results;
pub mod template;

pub use cache::{ALL_TENANTS, CacheItem, CacheKey, CacheStore, DEFAULT_CULTURE, Disposable};
pub use compiler::{CompiledExpression, ExpressionCompiler, PropertyPath, RegexOptions};
pub use config::EngineConfig;
pub use data::{ConditionData, ConditionDataBuilder, DataContext, DataType, Payload};
pub use document::{RuleDocument, rule_from_json, rule_to_json};
pub use engine::ConditionEngine;
pub use error::{CompileError, DisposeError, Result, RuleError};
pub use evaluator::{
    ConditionEvaluator, CustomEvaluator, EvaluatorOutcome, PredicateEvaluator, RegexEvaluator,
    typed_evaluator,
};
pub use events::{
    ConditionResultEvent, EventAggregator, EventHandler, RuleResultEvent, Subscription,
    handler_fn, handler_instance,
};
pub use models::{Condition, ConditionKind, ConditionSet, EventDetails, EventWhen, Rule};
pub use resolver::{
    EvaluatorFactory, EvaluatorRegistration, EvaluatorResolver, ServiceType, TypeResolver,
    evaluator_instance,
};
pub use results::{ConditionResult, RuleResult, SetResult};

// 供宿主实现评估器和事件处理器时使用
pub use tokio_util::sync::CancellationToken;
