//! JSON 规则格式
//!
//! 规则以 JSON 文档保存：谓词和属性路径是字符串，正则及其选项放在附加信息中。
//! 加载时由 [`ExpressionCompiler`] 编译，编译失败记录在条件上，不会导致加载失败。
//! 闭包谓词无法表示为字符串，序列化包含闭包谓词的规则返回 `NotSerializable`。

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::{ALL_TENANTS, DEFAULT_CULTURE};
use crate::compiler::{ExpressionCompiler, PATTERN_KEY, RegexOptions};
use crate::error::{CompileError, Result, RuleError};
use crate::models::{
    Condition, ConditionKind, ConditionSet, EventDetails, PREDICATE_EVALUATOR, REGEX_EVALUATOR,
    Rule,
};

fn default_tenant() -> String {
    ALL_TENANTS.to_string()
}

fn default_culture() -> String {
    DEFAULT_CULTURE.to_string()
}

/// 规则文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDocument<T> {
    pub rule_name: String,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default = "default_culture")]
    pub culture_id: String,
    pub rule_data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_details: Option<EventDetails>,
    pub condition_set: ConditionSetDocument<T>,
}

/// 条件集文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSetDocument<T> {
    pub name: String,
    pub set_data: T,
    #[serde(default)]
    pub short_circuit: bool,
    #[serde(default)]
    pub conditions: Vec<ConditionDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub or_set: Option<Box<ConditionSetDocument<T>>>,
}

/// 条件文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDocument {
    pub condition_name: String,
    pub context_type: String,
    pub evaluator_type_name: String,
    #[serde(default)]
    pub expression_to_evaluate: String,
    #[serde(default)]
    pub failure_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_details: Option<EventDetails>,
    #[serde(default)]
    pub additional_info: BTreeMap<String, String>,
}

impl<T: Clone> RuleDocument<T> {
    /// 从规则生成文档
    pub fn from_rule(rule: &Rule<T>) -> Result<Self> {
        Ok(Self {
            rule_name: rule.rule_name.clone(),
            tenant_id: rule.tenant_id.clone(),
            culture_id: rule.culture_id.clone(),
            rule_data: rule.rule_data.clone(),
            event_details: rule.event_details.clone(),
            condition_set: ConditionSetDocument::from_set(&rule.condition_set)?,
        })
    }
}

impl<T> RuleDocument<T> {
    /// 编译文档中的表达式，生成规则
    pub fn into_rule(self, compiler: &ExpressionCompiler) -> Rule<T> {
        Rule {
            rule_name: self.rule_name,
            rule_data: self.rule_data,
            condition_set: self.condition_set.into_set(compiler),
            event_details: self.event_details,
            tenant_id: self.tenant_id,
            culture_id: self.culture_id,
        }
    }
}

impl<T: Clone> ConditionSetDocument<T> {
    fn from_set(set: &ConditionSet<T>) -> Result<Self> {
        let conditions = set
            .conditions
            .iter()
            .map(ConditionDocument::from_condition)
            .collect::<Result<Vec<_>>>()?;
        let or_set = match &set.or_set {
            Some(next) => Some(Box::new(Self::from_set(next)?)),
            None => None,
        };
        Ok(Self {
            name: set.name.clone(),
            set_data: set.set_data.clone(),
            short_circuit: set.short_circuit,
            conditions,
            or_set,
        })
    }
}

impl<T> ConditionSetDocument<T> {
    fn into_set(self, compiler: &ExpressionCompiler) -> ConditionSet<T> {
        ConditionSet {
            name: self.name,
            set_data: self.set_data,
            conditions: self
                .conditions
                .into_iter()
                .map(|c| c.into_condition(compiler))
                .collect(),
            short_circuit: self.short_circuit,
            or_set: self.or_set.map(|next| Box::new(next.into_set(compiler))),
        }
    }
}

impl ConditionDocument {
    fn from_condition(condition: &Condition) -> Result<Self> {
        if !condition.is_serializable() {
            return Err(RuleError::NotSerializable {
                condition_name: condition.condition_name.clone(),
            });
        }
        Ok(Self {
            condition_name: condition.condition_name.clone(),
            context_type: condition.context_type.clone(),
            evaluator_type_name: condition.evaluator_type_name.clone(),
            expression_to_evaluate: condition.expression_to_evaluate.clone(),
            failure_message: condition.failure_message.clone(),
            event_details: condition.event_details.clone(),
            additional_info: condition.additional_info.clone(),
        })
    }

    fn into_condition(self, compiler: &ExpressionCompiler) -> Condition {
        let kind = compile_kind(
            compiler,
            &self.evaluator_type_name,
            &self.expression_to_evaluate,
            &self.context_type,
            &self.additional_info,
        );
        if let Some(error) = kind_error(&kind) {
            debug!(condition = %self.condition_name, error = %error, "条件编译失败，将在评估时报告");
        }

        let mut condition = Condition::with_kind(
            self.condition_name,
            self.context_type,
            self.evaluator_type_name,
            self.expression_to_evaluate,
            self.failure_message,
            kind,
        );
        condition.event_details = self.event_details;
        condition.additional_info = self.additional_info;
        condition
    }
}

fn compile_kind(
    compiler: &ExpressionCompiler,
    evaluator_type_name: &str,
    expression: &str,
    context_type: &str,
    additional_info: &BTreeMap<String, String>,
) -> ConditionKind {
    if evaluator_type_name.eq_ignore_ascii_case(PREDICATE_EVALUATOR) {
        return ConditionKind::PredicateExpression(
            compiler.compile_predicate(expression, context_type),
        );
    }

    if evaluator_type_name.eq_ignore_ascii_case(REGEX_EVALUATOR) {
        let options = RegexOptions::from_additional_info(additional_info);
        let regex = match additional_info.get(PATTERN_KEY) {
            Some(pattern) => options.build(pattern),
            None => Err(CompileError::new(
                expression,
                0,
                format!("正则条件缺少附加信息 {}", PATTERN_KEY),
            )),
        };
        return ConditionKind::Regex {
            path: compiler.compile_path(expression, context_type),
            regex,
            options,
        };
    }

    ConditionKind::Custom
}

fn kind_error(kind: &ConditionKind) -> Option<&CompileError> {
    match kind {
        ConditionKind::PredicateExpression(Err(e)) => Some(e),
        ConditionKind::Regex { path: Err(e), .. } | ConditionKind::Regex { regex: Err(e), .. } => {
            Some(e)
        }
        _ => None,
    }
}

/// 序列化规则为 JSON
pub fn rule_to_json<T: Serialize + Clone>(rule: &Rule<T>) -> Result<String> {
    let document = RuleDocument::from_rule(rule)?;
    Ok(serde_json::to_string_pretty(&document)?)
}

/// 从 JSON 解析并编译规则
#[instrument(skip_all)]
pub fn rule_from_json<T: DeserializeOwned>(json: &str, compiler: &ExpressionCompiler) -> Result<Rule<T>> {
    let document: RuleDocument<T> = serde_json::from_str(json)?;
    debug!(rule = %document.rule_name, tenant = %document.tenant_id, "解析规则文档");
    Ok(document.into_rule(compiler))
}

impl<T: Serialize + Clone> Rule<T> {
    pub fn to_json(&self) -> Result<String> {
        rule_to_json(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::REGEX_OPTION_KEY;
    use crate::data::DataType;
    use crate::models::EventWhen;
    use serde_json::{Value, json};

    #[derive(Debug, Default, Serialize)]
    struct Customer {
        #[serde(rename = "Name")]
        name: String,
    }

    impl DataType for Customer {
        const TYPE_NAME: &'static str = "Customer";
    }

    fn sample_rule() -> Rule<String> {
        let set = ConditionSet::new("main", "set-data".to_string())
            .and(
                Condition::predicate_expression("IsBob", "Customer", "c => c.Name == 'Bob'", "@{Name}")
                    .with_event(EventDetails::new("BobChecked", EventWhen::OnFailure)),
            )
            .and(Condition::regex(
                "Upper",
                "Customer",
                "Name",
                "^[A-Z]",
                RegexOptions::default(),
                "",
            ))
            .or_set(ConditionSet::new("fallback", "other".to_string()).with_short_circuit(true));
        Rule::new("Sample", "rule-data".to_string(), set).with_tenant("Tenant1")
    }

    #[test]
    fn test_round_trip_structure() {
        let rule = sample_rule();
        let json = rule.to_json().unwrap();

        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["rule_name"], "Sample");
        assert_eq!(value["condition_set"]["conditions"][1]["additional_info"][PATTERN_KEY], "^[A-Z]");
        assert_eq!(value["condition_set"]["or_set"]["short_circuit"], true);

        let restored: Rule<String> = rule_from_json(&json, &ExpressionCompiler::new()).unwrap();
        assert_eq!(restored.tenant_id, "Tenant1");
        assert_eq!(restored.condition_set.condition_count(), 2);
        assert!(matches!(
            restored.condition_set.conditions[0].kind(),
            ConditionKind::PredicateExpression(Ok(_))
        ));
        assert!(matches!(
            restored.condition_set.conditions[1].kind(),
            ConditionKind::Regex { regex: Ok(_), .. }
        ));
        assert_eq!(
            restored.condition_set.conditions[0].event_details,
            Some(EventDetails::new("BobChecked", EventWhen::OnFailure))
        );
        assert_eq!(restored.condition_set.or_set.as_ref().unwrap().name, "fallback");
    }

    #[test]
    fn test_closure_predicate_not_serializable() {
        let set = ConditionSet::new("main", ()).and(Condition::predicate::<Customer, _>(
            "Closure",
            |c| c.name.is_empty(),
            "",
        ));
        let err = Rule::new("r", (), set).to_json().unwrap_err();
        assert!(matches!(err, RuleError::NotSerializable { .. }));
    }

    #[test]
    fn test_defaults_and_option_typo() {
        let json = json!({
            "rule_name": "Minimal",
            "rule_data": null,
            "condition_set": {
                "name": "main",
                "set_data": null,
                "conditions": [{
                    "condition_name": "Town",
                    "context_type": "Address",
                    "evaluator_type_name": "Regex",
                    "expression_to_evaluate": "Town",
                    "additional_info": { "Pattern": "^leeds$", "RegexOption": "IgnorCase" }
                }]
            }
        })
        .to_string();

        let rule: Rule<()> = rule_from_json(&json, &ExpressionCompiler::new()).unwrap();
        assert_eq!(rule.tenant_id, ALL_TENANTS);
        assert_eq!(rule.culture_id, DEFAULT_CULTURE);

        let condition = &rule.condition_set.conditions[0];
        assert_eq!(condition.additional_info[REGEX_OPTION_KEY], "IgnorCase");
        let ConditionKind::Regex { regex: Ok(regex), options, .. } = condition.kind() else {
            panic!("expected compiled regex");
        };
        assert_eq!(*options, RegexOptions::default());
        assert!(!regex.is_match("LEEDS"));
    }

    #[test]
    fn test_compile_failures_are_kept_on_condition() {
        let compiler = ExpressionCompiler::new();
        compiler.register_shape("Customer", serde_json::to_value(Customer::default()).unwrap());

        let json = json!({
            "rule_name": "Broken",
            "rule_data": 1,
            "condition_set": {
                "name": "main",
                "set_data": 1,
                "conditions": [
                    {
                        "condition_name": "Typo",
                        "context_type": "Customer",
                        "evaluator_type_name": "predicate",
                        "expression_to_evaluate": "c => c.Nmae == 'x'"
                    },
                    {
                        "condition_name": "NoPattern",
                        "context_type": "Customer",
                        "evaluator_type_name": "regex",
                        "expression_to_evaluate": "Name"
                    }
                ]
            }
        })
        .to_string();

        let rule: Rule<i32> = rule_from_json(&json, &compiler).unwrap();
        assert!(kind_error(rule.condition_set.conditions[0].kind()).is_some());
        assert!(kind_error(rule.condition_set.conditions[1].kind()).is_some());
    }

    /// 规则数据不要求实现 Default，缺省的 or_set 读作 None
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reward {
        points: u32,
    }

    #[test]
    fn test_rule_data_without_default() {
        let json = json!({
            "rule_name": "Bonus",
            "rule_data": { "points": 10 },
            "condition_set": {
                "name": "main",
                "set_data": { "points": 5 },
                "conditions": []
            }
        })
        .to_string();

        let rule: Rule<Reward> = rule_from_json(&json, &ExpressionCompiler::new()).unwrap();
        assert_eq!(rule.rule_data, Reward { points: 10 });
        assert_eq!(rule.condition_set.set_data, Reward { points: 5 });
        assert!(rule.condition_set.or_set.is_none());

        let again: Rule<Reward> =
            rule_from_json(&rule.to_json().unwrap(), &ExpressionCompiler::new()).unwrap();
        assert_eq!(again.rule_data, rule.rule_data);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let err = rule_from_json::<()>("{ not json", &ExpressionCompiler::new()).unwrap_err();
        assert_eq!(err.code(), "JSON_ERROR");
    }
}
