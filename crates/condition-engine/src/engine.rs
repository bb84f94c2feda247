//! 条件引擎
//!
//! 对外的统一入口：规则注册与查询、规则评估、JSON 规则加载、
//! 自定义评估器注册以及事件订阅与发布。

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cache::{ALL_TENANTS, CacheItem, CacheKey, CacheStore, DEFAULT_CULTURE};
use crate::compiler::ExpressionCompiler;
use crate::config::EngineConfig;
use crate::data::{ConditionData, DataType};
use crate::document;
use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::events::{EventAggregator, EventHandler, Subscription};
use crate::executor::RuleExecutor;
use crate::models::Rule;
use crate::resolver::{EvaluatorFactory, EvaluatorRegistration, EvaluatorResolver, TypeResolver};
use crate::results::RuleResult;

/// 条件引擎
pub struct ConditionEngine {
    config: EngineConfig,
    rules: CacheStore,
    resolver: EvaluatorResolver,
    events: EventAggregator,
    compiler: ExpressionCompiler,
}

impl Default for ConditionEngine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ConditionEngine {
    /// 创建引擎
    ///
    /// 不提供类型解析函数时，依赖注入的评估器和事件处理器都不可用，只使用内置评估器。
    pub fn new(type_resolver: Option<TypeResolver>) -> Self {
        Self::with_config(EngineConfig::default(), type_resolver)
    }

    pub fn with_config(config: EngineConfig, type_resolver: Option<TypeResolver>) -> Self {
        let lock_timeout = config.cache_lock_timeout();
        info!(
            has_type_resolver = type_resolver.is_some(),
            placeholder = %config.missing_token_placeholder,
            "创建条件引擎"
        );
        Self {
            rules: CacheStore::with_lock_timeout(lock_timeout),
            resolver: EvaluatorResolver::new(type_resolver.clone(), lock_timeout),
            events: EventAggregator::new(type_resolver),
            compiler: ExpressionCompiler::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==================== 规则管理 ====================

    /// 新增或替换规则，键为 (规则名, 租户, 区域)
    #[instrument(skip(self, rule), fields(rule = %rule.rule_name, tenant = %rule.tenant_id, culture = %rule.culture_id))]
    pub fn add_or_update_rule<T>(&self, rule: Rule<T>) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = rule.cache_key();
        self.rules.add_or_update_item(
            &key.item_name,
            CacheItem::new(rule),
            &key.tenant_id,
            &key.culture_id,
        )
    }

    /// 默认租户和区域下是否存在规则
    pub fn contains_rule(&self, rule_name: &str) -> bool {
        self.contains_rule_for(rule_name, ALL_TENANTS, DEFAULT_CULTURE)
    }

    pub fn contains_rule_for(&self, rule_name: &str, tenant_id: &str, culture_id: &str) -> bool {
        self.rules.contains_item(rule_name, tenant_id, culture_id)
    }

    /// 获取默认租户和区域下的规则，不存在或数据类型不符时返回 None
    pub fn try_get_rule<T>(&self, rule_name: &str) -> Option<Arc<Rule<T>>>
    where
        T: Send + Sync + 'static,
    {
        self.try_get_rule_for(rule_name, ALL_TENANTS, DEFAULT_CULTURE)
    }

    pub fn try_get_rule_for<T>(
        &self,
        rule_name: &str,
        tenant_id: &str,
        culture_id: &str,
    ) -> Option<Arc<Rule<T>>>
    where
        T: Send + Sync + 'static,
    {
        self.rules.try_get_item::<Rule<T>>(rule_name, tenant_id, culture_id)
    }

    /// 移除规则，返回是否确实移除
    pub fn remove_rule(&self, rule_name: &str, tenant_id: &str, culture_id: &str) -> Result<bool> {
        self.rules.remove_item(rule_name, tenant_id, culture_id)
    }

    /// 已注册的规则数（所有租户和区域）
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    // ==================== 规则评估 ====================

    /// 在默认租户和区域下评估规则
    pub async fn evaluate_rule<T>(
        &self,
        rule_name: &str,
        data: &ConditionData,
        cancel: &CancellationToken,
    ) -> Result<RuleResult<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.evaluate_rule_for(rule_name, data, cancel, None, ALL_TENANTS, DEFAULT_CULTURE)
            .await
    }

    /// 评估规则
    ///
    /// 规则不存在、数据类型不符或评估器缺失时返回错误；
    /// 条件级失败都记录在返回的结果中。
    #[instrument(skip(self, data, cancel, previous))]
    pub async fn evaluate_rule_for<T>(
        &self,
        rule_name: &str,
        data: &ConditionData,
        cancel: &CancellationToken,
        previous: Option<Arc<RuleResult<T>>>,
        tenant_id: &str,
        culture_id: &str,
    ) -> Result<RuleResult<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let rule = self.fetch_rule::<T>(rule_name, tenant_id, culture_id)?;
        RuleExecutor::new(&self.resolver, &self.events, &self.config.missing_token_placeholder)
            .execute(&rule, data, cancel, previous)
            .await
    }

    fn fetch_rule<T>(&self, rule_name: &str, tenant_id: &str, culture_id: &str) -> Result<Arc<Rule<T>>>
    where
        T: Send + Sync + 'static,
    {
        if let Some(rule) = self.try_get_rule_for::<T>(rule_name, tenant_id, culture_id) {
            return Ok(rule);
        }
        if self.contains_rule_for(rule_name, tenant_id, culture_id) {
            return Err(RuleError::RuleTypeMismatch {
                rule_name: rule_name.to_string(),
                expected: std::any::type_name::<T>().to_string(),
            });
        }
        Err(RuleError::RuleNotFound {
            rule_name: rule_name.to_string(),
            tenant_id: tenant_id.to_string(),
            culture_id: culture_id.to_string(),
        })
    }

    // ==================== JSON ====================

    /// 从 JSON 加载规则并注册，返回规则的缓存键
    ///
    /// 表达式编译失败不会导致加载失败，错误会在评估时出现在条件结果中。
    pub fn ingest_rule_from_json<T>(&self, json: &str) -> Result<CacheKey>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let rule = document::rule_from_json::<T>(json, &self.compiler)?;
        let key = rule.cache_key();
        self.add_or_update_rule(rule)?;
        Ok(key)
    }

    pub fn rule_to_json<T: Serialize + Clone>(&self, rule: &Rule<T>) -> Result<String> {
        document::rule_to_json(rule)
    }

    /// 注册数据类型的结构，之后加载的 JSON 规则会校验属性路径
    pub fn register_data_type<D: DataType + Default>(&self) -> Result<()> {
        let shape = serde_json::to_value(D::default())?;
        self.compiler.register_shape(D::TYPE_NAME, shape);
        Ok(())
    }

    // ==================== 评估器 ====================

    /// 注册通过类型解析函数实例化的自定义评估器
    pub fn register_custom_evaluator_for_dependency_injection(
        &self,
        evaluator_name: impl Into<String>,
        registration: EvaluatorRegistration,
    ) {
        self.resolver
            .register_for_dependency_injection(evaluator_name, registration);
    }

    /// 注册不依赖类型解析函数的自定义评估器工厂
    pub fn register_custom_evaluator(&self, evaluator_name: impl Into<String>, factory: EvaluatorFactory) {
        self.resolver.register_custom_evaluator(evaluator_name, factory);
    }

    /// 解析评估器（默认租户和区域）
    pub fn evaluator_resolver(
        &self,
        evaluator_name: &str,
        data_type: &str,
    ) -> Result<Arc<dyn ConditionEvaluator>> {
        self.resolver
            .resolve(evaluator_name, data_type, ALL_TENANTS, DEFAULT_CULTURE)
    }

    // ==================== 事件 ====================

    pub fn subscribe_to_event<E>(&self, handler: Arc<dyn EventHandler<E>>) -> Subscription
    where
        E: Clone + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    /// 发布事件，不等待处理完成
    pub fn event_publisher<E>(&self, event: E, cancel: &CancellationToken)
    where
        E: Clone + Send + Sync + 'static,
    {
        self.events.publish(event, cancel.clone());
    }

    pub fn events(&self) -> &EventAggregator {
        &self.events
    }

    /// 等待已发布事件全部处理完成
    pub async fn drain_events(&self) {
        self.events.drain().await;
    }
}
