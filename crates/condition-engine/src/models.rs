//! 条件引擎领域模型
//!
//! 规则（Rule）包含一个根条件集（ConditionSet），条件集可以通过 `or_set`
//! 串联备选条件集；条件集内的条件全部成功时该条件集成功。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::{ALL_TENANTS, CacheKey, DEFAULT_CULTURE};
use crate::compiler::{
    CompiledExpression, PATTERN_KEY, PropertyPath, REGEX_OPTION_KEY, RegexOptions,
};
use crate::data::{DataType, Payload};
use crate::error::{CompileError, Result, RuleError};

/// 内置谓词评估器名称
pub const PREDICATE_EVALUATOR: &str = "predicate";

/// 内置正则评估器名称
pub const REGEX_EVALUATOR: &str = "regex";

/// 事件触发时机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventWhen {
    OnSuccess,
    OnFailure,
    OnSuccessOrFailure,
}

impl EventWhen {
    pub fn should_raise(self, is_success: bool) -> bool {
        match self {
            Self::OnSuccess => is_success,
            Self::OnFailure => !is_success,
            Self::OnSuccessOrFailure => true,
        }
    }
}

/// 事件声明：评估结果满足触发时机时发布事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    pub event_type_name: String,
    pub event_when: EventWhen,
}

impl EventDetails {
    pub fn new(event_type_name: impl Into<String>, event_when: EventWhen) -> Self {
        Self {
            event_type_name: event_type_name.into(),
            event_when,
        }
    }
}

/// 闭包谓词，入参为已按条件类型选出的数据
pub type PredicateFn = Arc<dyn Fn(&Payload) -> Result<bool> + Send + Sync>;

/// 条件的执行形态
#[derive(Clone)]
pub enum ConditionKind {
    /// 代码中构建的闭包谓词
    Predicate(PredicateFn),
    /// 字符串谓词，编译失败时保留错误，在评估时暴露
    PredicateExpression(std::result::Result<Arc<CompiledExpression>, CompileError>),
    /// 对属性路径上的值做正则匹配
    Regex {
        path: std::result::Result<PropertyPath, CompileError>,
        regex: std::result::Result<Regex, CompileError>,
        options: RegexOptions,
    },
    /// 由注册的自定义评估器执行
    Custom,
}

impl fmt::Debug for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate(_) => f.write_str("Predicate(<closure>)"),
            Self::PredicateExpression(compiled) => f
                .debug_tuple("PredicateExpression")
                .field(&compiled.as_ref().map(|c| c.source()))
                .finish(),
            Self::Regex { path, regex, options } => f
                .debug_struct("Regex")
                .field("path", &path.as_ref().map(|p| p.as_str()))
                .field("pattern", &regex.as_ref().map(|r| r.as_str()))
                .field("options", options)
                .finish(),
            Self::Custom => f.write_str("Custom"),
        }
    }
}

/// 条件
#[derive(Debug, Clone)]
pub struct Condition {
    pub condition_name: String,
    /// 条件期望的数据类型（[`DataType::TYPE_NAME`]）
    pub context_type: String,
    pub evaluator_type_name: String,
    /// 字符串谓词或属性路径，闭包谓词为空
    pub expression_to_evaluate: String,
    /// 失败消息模板，可包含 `@{Property.Path}` 占位符
    pub failure_message: String,
    pub event_details: Option<EventDetails>,
    pub additional_info: BTreeMap<String, String>,
    kind: ConditionKind,
}

impl Condition {
    /// 闭包谓词条件
    pub fn predicate<D, F>(
        condition_name: impl Into<String>,
        predicate: F,
        failure_message: impl Into<String>,
    ) -> Self
    where
        D: DataType,
        F: Fn(&D) -> bool + Send + Sync + 'static,
    {
        let predicate: PredicateFn = Arc::new(move |payload: &Payload| {
            payload
                .downcast_ref::<D>()
                .map(&predicate)
                .ok_or_else(|| RuleError::TypeMismatch {
                    expected: D::TYPE_NAME.to_string(),
                    actual: payload.type_name().to_string(),
                })
        });

        Self::with_kind(
            condition_name,
            D::TYPE_NAME,
            PREDICATE_EVALUATOR,
            String::new(),
            failure_message,
            ConditionKind::Predicate(predicate),
        )
    }

    /// 字符串谓词条件，如 `c => c.Age >= 18`
    ///
    /// 立即编译；编译失败不会报错，而是在评估时记录为 `PredicateCompilation`。
    pub fn predicate_expression(
        condition_name: impl Into<String>,
        context_type: impl Into<String>,
        expression: impl Into<String>,
        failure_message: impl Into<String>,
    ) -> Self {
        let expression = expression.into();
        let compiled = CompiledExpression::parse(&expression).map(Arc::new);
        Self::with_kind(
            condition_name,
            context_type,
            PREDICATE_EVALUATOR,
            expression,
            failure_message,
            ConditionKind::PredicateExpression(compiled),
        )
    }

    /// 正则条件：取 `property_path` 上的值与 `pattern` 匹配
    ///
    /// 正则和选项同时写入附加信息（`Pattern` / `RegexOption`），用于序列化。
    pub fn regex(
        condition_name: impl Into<String>,
        context_type: impl Into<String>,
        property_path: impl Into<String>,
        pattern: impl Into<String>,
        options: RegexOptions,
        failure_message: impl Into<String>,
    ) -> Self {
        let property_path = property_path.into();
        let pattern = pattern.into();
        let kind = ConditionKind::Regex {
            path: PropertyPath::parse(&property_path),
            regex: options.build(&pattern),
            options,
        };

        let mut condition = Self::with_kind(
            condition_name,
            context_type,
            REGEX_EVALUATOR,
            property_path,
            failure_message,
            kind,
        );
        condition
            .additional_info
            .insert(PATTERN_KEY.to_string(), pattern);
        condition
            .additional_info
            .insert(REGEX_OPTION_KEY.to_string(), options.to_option_string());
        condition
    }

    /// 自定义评估器条件
    pub fn custom(
        condition_name: impl Into<String>,
        context_type: impl Into<String>,
        evaluator_type_name: impl Into<String>,
        expression: impl Into<String>,
        failure_message: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            condition_name,
            context_type,
            evaluator_type_name,
            expression,
            failure_message,
            ConditionKind::Custom,
        )
    }

    pub(crate) fn with_kind(
        condition_name: impl Into<String>,
        context_type: impl Into<String>,
        evaluator_type_name: impl Into<String>,
        expression: impl Into<String>,
        failure_message: impl Into<String>,
        kind: ConditionKind,
    ) -> Self {
        Self {
            condition_name: condition_name.into(),
            context_type: context_type.into(),
            evaluator_type_name: evaluator_type_name.into(),
            expression_to_evaluate: expression.into(),
            failure_message: failure_message.into(),
            event_details: None,
            additional_info: BTreeMap::new(),
            kind,
        }
    }

    pub fn with_event(mut self, event_details: EventDetails) -> Self {
        self.event_details = Some(event_details);
        self
    }

    /// 添加附加信息。正则条件的 `Pattern` / `RegexOption` 在构建时已编译，之后修改不会生效
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_info.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> &ConditionKind {
        &self.kind
    }

    /// 闭包谓词无法序列化
    pub fn is_serializable(&self) -> bool {
        !matches!(self.kind, ConditionKind::Predicate(_))
    }
}

/// 条件集：全部条件成功时成功，可串联 OR 备选条件集
#[derive(Debug, Clone)]
pub struct ConditionSet<T> {
    pub name: String,
    pub set_data: T,
    pub conditions: Vec<Condition>,
    /// 遇到第一个失败条件即停止本条件集的评估
    pub short_circuit: bool,
    pub or_set: Option<Box<ConditionSet<T>>>,
}

impl<T> ConditionSet<T> {
    pub fn new(name: impl Into<String>, set_data: T) -> Self {
        Self {
            name: name.into(),
            set_data,
            conditions: Vec::new(),
            short_circuit: false,
            or_set: None,
        }
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_short_circuit(mut self, short_circuit: bool) -> Self {
        self.short_circuit = short_circuit;
        self
    }

    /// 在链尾追加备选条件集
    pub fn or_set(mut self, other: ConditionSet<T>) -> Self {
        self.append_or(other);
        self
    }

    fn append_or(&mut self, other: ConditionSet<T>) {
        match self.or_set.as_mut() {
            Some(next) => next.append_or(other),
            None => self.or_set = Some(Box::new(other)),
        }
    }

    /// 按顺序遍历自身及所有备选条件集
    pub fn chain(&self) -> impl Iterator<Item = &ConditionSet<T>> {
        std::iter::successors(Some(self), |set| set.or_set.as_deref())
    }

    /// 整条 OR 链中的条件总数
    pub fn condition_count(&self) -> usize {
        self.chain().map(|set| set.conditions.len()).sum()
    }
}

/// 规则
#[derive(Debug, Clone)]
pub struct Rule<T> {
    pub rule_name: String,
    pub rule_data: T,
    pub condition_set: ConditionSet<T>,
    pub event_details: Option<EventDetails>,
    pub tenant_id: String,
    pub culture_id: String,
}

impl<T> Rule<T> {
    /// 创建适用于所有租户、默认区域的规则
    pub fn new(rule_name: impl Into<String>, rule_data: T, condition_set: ConditionSet<T>) -> Self {
        Self {
            rule_name: rule_name.into(),
            rule_data,
            condition_set,
            event_details: None,
            tenant_id: ALL_TENANTS.to_string(),
            culture_id: DEFAULT_CULTURE.to_string(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_culture(mut self, culture_id: impl Into<String>) -> Self {
        self.culture_id = culture_id.into();
        self
    }

    pub fn with_event(mut self, event_details: EventDetails) -> Self {
        self.event_details = Some(event_details);
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.rule_name, &self.tenant_id, &self.culture_id)
    }
}
