//! 引擎指标
//!
//! 基于 metrics crate 门面记录规则评估、条件评估和事件分发指标。
//! 宿主进程未安装 recorder 时这些调用都是空操作。

/// 注册指标描述，出现在导出端的 HELP 注释中
pub fn describe_metrics() {
    ::metrics::describe_counter!("rule_evaluations_total", "Total number of rule evaluations");
    ::metrics::describe_histogram!(
        "rule_evaluation_duration_seconds",
        "Rule evaluation duration in seconds"
    );
    ::metrics::describe_counter!(
        "condition_evaluations_total",
        "Total number of condition evaluations"
    );
    ::metrics::describe_counter!("event_dispatches_total", "Total number of event dispatches");
}

/// 记录规则评估
pub fn record_rule_evaluation(rule_name: &str, success: bool, duration_secs: f64) {
    ::metrics::counter!(
        "rule_evaluations_total",
        "rule" => rule_name.to_string(),
        "result" => if success { "passed" } else { "failed" }
    )
    .increment(1);
    ::metrics::histogram!("rule_evaluation_duration_seconds").record(duration_secs);
}

/// 记录条件评估
pub fn record_condition_evaluation(evaluator: &str, success: bool) {
    ::metrics::counter!(
        "condition_evaluations_total",
        "evaluator" => evaluator.to_string(),
        "result" => if success { "passed" } else { "failed" }
    )
    .increment(1);
}

/// 记录事件分发结果（handled / failed / cancelled / panicked）
pub fn record_event_dispatch(event_type: &'static str, outcome: &'static str) {
    ::metrics::counter!(
        "event_dispatches_total",
        "event_type" => event_type,
        "outcome" => outcome
    )
    .increment(1);
}
