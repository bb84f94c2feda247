//! 条件引擎性能基准测试
//!
//! 覆盖表达式编译、表达式求值和完整规则评估。

use condition_engine::{
    CancellationToken, CompiledExpression, Condition, ConditionDataBuilder, ConditionEngine,
    ConditionSet, DataType, RegexOptions, Rule,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde::Serialize;
use serde_json::json;
use std::hint::black_box;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Order {
    id: String,
    amount: f64,
    channel: String,
}

impl DataType for Order {
    const TYPE_NAME: &'static str = "Order";
}

fn order() -> Order {
    Order {
        id: "ORD-20260101-0001".to_string(),
        amount: 1250.0,
        channel: "mobile".to_string(),
    }
}

/// 构建包含 n 个字符串谓词条件的规则
fn create_rule(condition_count: usize, short_circuit: bool) -> Rule<()> {
    let mut set = ConditionSet::new("bench", ()).with_short_circuit(short_circuit);
    for i in 0..condition_count {
        set = set.and(Condition::predicate_expression(
            format!("c{}", i),
            "Order",
            format!("o => o.Amount > {} && o.Channel == 'mobile'", i),
            "@{Id} rejected",
        ));
    }
    Rule::new(format!("rule_{}", condition_count), (), set)
}

/// 表达式编译基准
fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    group.bench_function("simple", |b| {
        b.iter(|| CompiledExpression::parse(black_box("o => o.Amount > 100")))
    });

    group.bench_function("compound", |b| {
        b.iter(|| {
            CompiledExpression::parse(black_box(
                "o => (o.Amount >= 100 && o.Amount < 5000) || !o.Channel.StartsWith(\"web\")",
            ))
        })
    });

    group.bench_function("regex", |b| {
        let options = RegexOptions::parse(Some("IgnoreCase"));
        b.iter(|| options.build(black_box(r"^ORD-\d{8}-\d{4}$")))
    });

    group.finish();
}

/// 已编译表达式求值基准
fn bench_expression_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("expression_evaluate");
    let data = json!({ "Id": "ORD-1", "Amount": 1250.0, "Channel": "mobile" });

    let simple = CompiledExpression::parse("o => o.Amount > 100").ok();
    let compound =
        CompiledExpression::parse("o => o.Amount > 100 && o.Channel.Contains('mob') && o.Id.Length == 5")
            .ok();

    if let Some(expr) = simple {
        group.bench_function("simple", |b| b.iter(|| expr.evaluate(black_box(&data))));
    }
    if let Some(expr) = compound {
        group.bench_function("compound", |b| b.iter(|| expr.evaluate(black_box(&data))));
    }

    group.finish();
}

/// 完整规则评估基准（包含评估器解析和结果链构建）
fn bench_rule_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_evaluation");
    let Ok(runtime) = tokio::runtime::Runtime::new() else {
        return;
    };

    for count in [1usize, 5, 20] {
        let engine = ConditionEngine::default();
        let rule = create_rule(count, false);
        let name = rule.rule_name.clone();
        if engine.add_or_update_rule(rule).is_err() {
            continue;
        }
        let data = ConditionDataBuilder::new().for_any(order()).build();
        let cancel = CancellationToken::new();

        group.bench_with_input(BenchmarkId::new("conditions", count), &count, |b, _| {
            b.iter(|| {
                runtime.block_on(engine.evaluate_rule::<()>(
                    black_box(&name),
                    black_box(&data),
                    &cancel,
                ))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_compile,
    bench_expression_evaluate,
    bench_rule_evaluation
);
criterion_main!(benches);
