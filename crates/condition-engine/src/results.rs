//! 评估结果
//!
//! 条件结果、条件集结果和规则结果都通过 `previous` 单向链接成结果链，
//! 链头是最新的结果。结果创建后只读，使用 `Arc` 共享。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::data::ConditionData;
use crate::error::RuleError;
use crate::models::EventDetails;

/// 单个条件的评估结果
#[derive(Debug, Clone)]
pub struct ConditionResult {
    pub condition_name: String,
    pub context_type: String,
    pub evaluator_type_name: String,
    pub expression_to_evaluate: String,
    pub is_success: bool,
    /// 已替换占位符的失败消息，成功时为空
    pub failure_message: String,
    pub additional_info: BTreeMap<String, String>,
    pub event_details: Option<EventDetails>,
    pub exceptions: Vec<Arc<RuleError>>,
    pub previous: Option<Arc<ConditionResult>>,
}

impl ConditionResult {
    /// 从当前结果开始，向前遍历整条结果链
    pub fn chain(&self) -> impl Iterator<Item = &ConditionResult> {
        std::iter::successors(Some(self), |r| r.previous.as_deref())
    }
}

/// 条件集的评估结果
#[derive(Debug, Clone)]
pub struct SetResult<T> {
    pub set_name: String,
    pub set_data: T,
    pub is_success: bool,
    /// 本条件集实际评估的条件数
    pub evaluation_count: usize,
    pub short_circuited: bool,
    /// 本次评估使用的数据，租户取自数据本身
    pub data: ConditionData,
    pub condition_results: Option<Arc<ConditionResult>>,
    pub previous: Option<Arc<SetResult<T>>>,
}

impl<T> SetResult<T> {
    pub fn tenant_id(&self) -> &str {
        self.data.tenant_id()
    }

    pub fn chain(&self) -> impl Iterator<Item = &SetResult<T>> {
        std::iter::successors(Some(self), |r| r.previous.as_deref())
    }
}

/// 规则的评估结果
#[derive(Debug, Clone)]
pub struct RuleResult<T> {
    pub rule_name: String,
    pub is_success: bool,
    pub rule_data: T,
    /// 决定结果的条件集（第一个成功的条件集，或最后一个被评估的条件集）
    pub final_set_name: String,
    pub set_data: T,
    /// 规则自身的租户，与数据的租户无关
    pub tenant_id: String,
    pub culture_id: String,
    pub elapsed: Duration,
    pub evaluated_at: DateTime<Utc>,
    /// 所有条件集中实际评估的条件总数
    pub evaluation_count: usize,
    pub short_circuited: bool,
    /// 决定结果的条件集中失败条件的消息（按声明顺序，空消息不计入）
    pub failure_messages: Vec<String>,
    /// 所有被评估条件记录的异常
    pub exceptions: Vec<Arc<RuleError>>,
    /// 全部条件结果链，链头为最后评估的条件
    pub condition_set_chain: Option<Arc<ConditionResult>>,
    pub set_result_chain: Option<Arc<SetResult<T>>>,
    pub previous_rule_result: Option<Arc<RuleResult<T>>>,
}

impl<T> RuleResult<T> {
    /// 按评估顺序列出全部条件结果
    pub fn condition_results(&self) -> Vec<&ConditionResult> {
        let mut results: Vec<&ConditionResult> = self
            .condition_set_chain
            .as_deref()
            .map(|head| head.chain().collect())
            .unwrap_or_default();
        results.reverse();
        results
    }

    /// 按名称查找条件结果（取最后一次评估）
    pub fn condition_result(&self, condition_name: &str) -> Option<&ConditionResult> {
        self.condition_set_chain
            .as_deref()?
            .chain()
            .find(|r| r.condition_name == condition_name)
    }

    /// 按评估顺序列出条件集结果
    pub fn set_results(&self) -> Vec<&SetResult<T>> {
        let mut results: Vec<&SetResult<T>> = self
            .set_result_chain
            .as_deref()
            .map(|head| head.chain().collect())
            .unwrap_or_default();
        results.reverse();
        results
    }

    /// 拼接后的失败消息
    pub fn failure_message(&self) -> String {
        self.failure_messages.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(name: &str, previous: Option<Arc<ConditionResult>>) -> Arc<ConditionResult> {
        Arc::new(ConditionResult {
            condition_name: name.to_string(),
            context_type: "Probe".to_string(),
            evaluator_type_name: "predicate".to_string(),
            expression_to_evaluate: String::new(),
            is_success: true,
            failure_message: String::new(),
            additional_info: BTreeMap::new(),
            event_details: None,
            exceptions: Vec::new(),
            previous,
        })
    }

    #[test]
    fn test_condition_chain_order() {
        let first = condition("a", None);
        let second = condition("b", Some(first));
        let third = condition("c", Some(second));

        let names: Vec<&str> = third.chain().map(|r| r.condition_name.as_str()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);

        let result = RuleResult {
            rule_name: "r".to_string(),
            is_success: true,
            rule_data: (),
            final_set_name: "s".to_string(),
            set_data: (),
            tenant_id: "All_Tenants".to_string(),
            culture_id: "en-GB".to_string(),
            elapsed: Duration::ZERO,
            evaluated_at: Utc::now(),
            evaluation_count: 3,
            short_circuited: false,
            failure_messages: vec!["x".to_string(), "y".to_string()],
            exceptions: Vec::new(),
            condition_set_chain: Some(third),
            set_result_chain: None,
            previous_rule_result: None,
        };

        let ordered: Vec<&str> = result
            .condition_results()
            .iter()
            .map(|r| r.condition_name.as_str())
            .collect();
        assert_eq!(ordered, vec!["a", "b", "c"]);
        assert!(result.condition_result("b").is_some());
        assert!(result.set_results().is_empty());
        assert_eq!(result.failure_message(), "x; y");
    }
}
