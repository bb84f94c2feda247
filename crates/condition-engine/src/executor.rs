//! 规则执行器
//!
//! 按声明顺序逐个评估条件并链接结果：
//! - 条件级失败（数据缺失、评估器报错或 panic、表达式编译失败）记录在结果中，不中断规则
//! - 评估器缺失等结构性错误直接返回给调用方
//! - 条件集失败时依次尝试 OR 备选条件集
//! - 每个条件开始前检查取消信号，已取消时剩余条件不再评估

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::data::{ConditionData, Payload};
use crate::error::{Result, RuleError};
use crate::evaluator::EvaluatorOutcome;
use crate::events::{ConditionResultEvent, EventAggregator, RuleResultEvent};
use crate::models::{Condition, ConditionSet, Rule};
use crate::observability::metrics;
use crate::resolver::EvaluatorResolver;
use crate::results::{ConditionResult, RuleResult, SetResult};
use crate::template;

/// 规则执行器
pub struct RuleExecutor<'a> {
    resolver: &'a EvaluatorResolver,
    events: &'a EventAggregator,
    placeholder: &'a str,
}

/// 单个条件集的执行状态
struct SetOutcome {
    is_success: bool,
    evaluation_count: usize,
    short_circuited: bool,
    cancelled: bool,
    failure_messages: Vec<String>,
}

impl<'a> RuleExecutor<'a> {
    pub fn new(
        resolver: &'a EvaluatorResolver,
        events: &'a EventAggregator,
        placeholder: &'a str,
    ) -> Self {
        Self {
            resolver,
            events,
            placeholder,
        }
    }

    /// 执行规则
    #[instrument(skip_all, fields(rule = %rule.rule_name, data_tenant = %data.tenant_id()))]
    pub async fn execute<T>(
        &self,
        rule: &Rule<T>,
        data: &ConditionData,
        cancel: &CancellationToken,
        previous: Option<Arc<RuleResult<T>>>,
    ) -> Result<RuleResult<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let start = Instant::now();

        let mut condition_chain: Option<Arc<ConditionResult>> = None;
        let mut set_chain: Option<Arc<SetResult<T>>> = None;
        let mut exceptions: Vec<Arc<RuleError>> = Vec::new();
        let mut evaluation_count = 0;
        let mut short_circuited = false;
        let mut decisive: Option<(&ConditionSet<T>, SetOutcome)> = None;

        for set in rule.condition_set.chain() {
            let outcome = self
                .execute_set(rule, set, data, cancel, &mut condition_chain, &mut exceptions)
                .await?;

            evaluation_count += outcome.evaluation_count;
            short_circuited |= outcome.short_circuited;

            set_chain = Some(Arc::new(SetResult {
                set_name: set.name.clone(),
                set_data: set.set_data.clone(),
                is_success: outcome.is_success,
                evaluation_count: outcome.evaluation_count,
                short_circuited: outcome.short_circuited,
                data: data.clone(),
                condition_results: condition_chain.clone(),
                previous: set_chain.take(),
            }));

            let stop = outcome.is_success || outcome.cancelled;
            if !outcome.is_success && !outcome.cancelled {
                debug!(set = %set.name, "条件集未通过，尝试备选条件集");
            }
            decisive = Some((set, outcome));
            if stop {
                break;
            }
        }

        let (final_set, final_outcome) = match decisive {
            Some((set, outcome)) => (set, outcome),
            // 根条件集总会被评估，这里只是兜底
            None => (
                &rule.condition_set,
                SetOutcome {
                    is_success: false,
                    evaluation_count: 0,
                    short_circuited: false,
                    cancelled: false,
                    failure_messages: Vec::new(),
                },
            ),
        };

        let elapsed = start.elapsed();
        let result = RuleResult {
            rule_name: rule.rule_name.clone(),
            is_success: final_outcome.is_success,
            rule_data: rule.rule_data.clone(),
            final_set_name: final_set.name.clone(),
            set_data: final_set.set_data.clone(),
            tenant_id: rule.tenant_id.clone(),
            culture_id: rule.culture_id.clone(),
            elapsed,
            evaluated_at: Utc::now(),
            evaluation_count,
            short_circuited,
            failure_messages: final_outcome.failure_messages,
            exceptions,
            condition_set_chain: condition_chain,
            set_result_chain: set_chain,
            previous_rule_result: previous,
        };

        metrics::record_rule_evaluation(&rule.rule_name, result.is_success, elapsed.as_secs_f64());
        info!(
            success = result.is_success,
            final_set = %result.final_set_name,
            evaluation_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "规则评估完成"
        );

        if let Some(details) = rule
            .event_details
            .as_ref()
            .filter(|d| d.event_when.should_raise(result.is_success))
        {
            let result = Arc::new(result.clone());
            self.events.publish(
                RuleResultEvent {
                    event_id: Uuid::new_v4(),
                    event_type_name: details.event_type_name.clone(),
                    rule_name: rule.rule_name.clone(),
                    is_success: result.is_success,
                    tenant_id: rule.tenant_id.clone(),
                    result,
                    created_at: Utc::now(),
                },
                cancel.clone(),
            );
        }

        Ok(result)
    }

    async fn execute_set<T>(
        &self,
        rule: &Rule<T>,
        set: &ConditionSet<T>,
        data: &ConditionData,
        cancel: &CancellationToken,
        chain: &mut Option<Arc<ConditionResult>>,
        exceptions: &mut Vec<Arc<RuleError>>,
    ) -> Result<SetOutcome>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut outcome = SetOutcome {
            is_success: true,
            evaluation_count: 0,
            short_circuited: false,
            cancelled: false,
            failure_messages: Vec::new(),
        };

        for condition in &set.conditions {
            if cancel.is_cancelled() {
                debug!(condition = %condition.condition_name, "评估已取消，跳过剩余条件");
                exceptions.push(Arc::new(RuleError::Cancelled));
                outcome.is_success = false;
                outcome.cancelled = true;
                break;
            }

            let (result, payload) = self
                .evaluate_condition(rule, condition, data, cancel, chain.take())
                .await?;
            outcome.evaluation_count += 1;
            exceptions.extend(result.exceptions.iter().cloned());

            if !result.is_success {
                outcome.is_success = false;
                if !result.failure_message.is_empty() {
                    outcome.failure_messages.push(result.failure_message.clone());
                }
            }

            if let Some(details) = result
                .event_details
                .as_ref()
                .filter(|d| d.event_when.should_raise(result.is_success))
            {
                self.events.publish(
                    ConditionResultEvent {
                        event_id: Uuid::new_v4(),
                        event_type_name: details.event_type_name.clone(),
                        rule_name: rule.rule_name.clone(),
                        condition_name: result.condition_name.clone(),
                        is_success: result.is_success,
                        failure_message: result.failure_message.clone(),
                        payload,
                        tenant_id: data.tenant_id().to_string(),
                        exceptions: result.exceptions.clone(),
                        created_at: Utc::now(),
                    },
                    cancel.clone(),
                );
            }

            let failed = !result.is_success;
            *chain = Some(Arc::new(result));

            if failed && set.short_circuit {
                debug!(set = %set.name, condition = %condition.condition_name, "条件失败，短路");
                outcome.short_circuited = true;
                break;
            }
        }

        Ok(outcome)
    }

    async fn evaluate_condition<T>(
        &self,
        rule: &Rule<T>,
        condition: &Condition,
        data: &ConditionData,
        cancel: &CancellationToken,
        previous: Option<Arc<ConditionResult>>,
    ) -> Result<(ConditionResult, Option<Payload>)> {
        let mut exceptions = Vec::new();
        let mut additional_info = condition.additional_info.clone();
        let mut message_override = None;
        let mut is_success = false;

        let payload = match data.find_for_condition(&condition.condition_name, &condition.context_type)
        {
            Ok(payload) => Some(payload.clone()),
            Err(e) => {
                debug!(condition = %condition.condition_name, error = %e, "数据上下文缺失");
                exceptions.push(Arc::new(e));
                None
            }
        };

        if let Some(payload) = &payload {
            match self.run_evaluator(rule, condition, payload, cancel).await? {
                Ok(outcome) => {
                    is_success = outcome.is_success;
                    additional_info.extend(outcome.additional_info);
                    message_override = outcome.failure_message;
                }
                Err(e) => {
                    debug!(condition = %condition.condition_name, error = %e, "条件评估失败");
                    exceptions.push(Arc::new(e));
                }
            }
        }

        metrics::record_condition_evaluation(&condition.evaluator_type_name, is_success);

        let failure_message = if is_success {
            String::new()
        } else {
            let template = message_override
                .as_deref()
                .unwrap_or(&condition.failure_message);
            let json = payload.as_ref().and_then(|p| p.json().ok());
            template::render(template, json, self.placeholder)
        };

        let result = ConditionResult {
            condition_name: condition.condition_name.clone(),
            context_type: condition.context_type.clone(),
            evaluator_type_name: condition.evaluator_type_name.clone(),
            expression_to_evaluate: condition.expression_to_evaluate.clone(),
            is_success,
            failure_message,
            additional_info,
            event_details: condition.event_details.clone(),
            exceptions,
            previous,
        };
        Ok((result, payload))
    }

    /// 解析并调用评估器
    ///
    /// 外层 `Result` 是结构性错误（评估器缺失、缓存锁超时），返回给调用方；
    /// 内层是条件级错误，panic 也转换为内层错误。
    async fn run_evaluator<T>(
        &self,
        rule: &Rule<T>,
        condition: &Condition,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> Result<Result<EvaluatorOutcome>> {
        let evaluator = self.resolver.resolve(
            &condition.evaluator_type_name,
            &condition.context_type,
            &rule.tenant_id,
            &rule.culture_id,
        )?;

        let outcome = AssertUnwindSafe(evaluator.evaluate(condition, payload, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(RuleError::EvaluatorFailed {
                    evaluator_name: condition.evaluator_type_name.clone(),
                    message: panic_message(panic.as_ref()),
                })
            });
        Ok(outcome)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "评估器发生 panic".to_string()
    }
}
