//! 失败消息模板
//!
//! 失败消息中的 `@{Property.Path}` 占位符在条件评估后用匹配到的数据替换。
//! 路径非法、无法解析或值为 null 时使用配置的替换文本；空模板原样返回。

use serde_json::Value;
use tracing::debug;

use crate::compiler::PropertyPath;

const TOKEN_START: &str = "@{";
const TOKEN_END: char = '}';

/// 渲染失败消息
///
/// `data` 为 None 表示没有可用数据（如数据上下文缺失），此时所有占位符都使用替换文本。
/// 占位符内容不是合法属性路径时同样使用替换文本；未闭合的 `@{` 原样保留。
pub fn render(template: &str, data: Option<&Value>, placeholder: &str) -> String {
    if template.is_empty() || !template.contains(TOKEN_START) {
        return template.to_string();
    }

    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(TOKEN_START) {
        output.push_str(&rest[..start]);
        let after = &rest[start + TOKEN_START.len()..];

        let Some(end) = after.find(TOKEN_END) else {
            // 未闭合，剩余部分原样输出
            output.push_str(&rest[start..]);
            return output;
        };

        let token = &after[..end];
        let value = PropertyPath::parse(token)
            .ok()
            .and_then(|path| data.and_then(|d| path.resolve(d)));
        match value {
            Some(value) if !value.is_null() => output.push_str(&display_value(value)),
            _ => {
                debug!(token, "占位符无法解析，使用替换文本");
                output.push_str(placeholder);
            }
        }

        rest = &after[end + 1..];
    }

    output.push_str(rest);
    output
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
