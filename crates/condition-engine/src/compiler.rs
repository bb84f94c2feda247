//! 表达式编译器
//!
//! JSON 规则中的谓词和属性路径以字符串形式保存，在加载时编译成可执行结构：
//! - 属性路径 `Address.AddressLine`：点号分隔，数字段表示数组下标
//! - 布尔谓词 `p => p.Age >= 18 && p.Name.StartsWith("A")`：可选的 lambda 参数前缀，
//!   支持 `|| && ! == != > >= < <=`、括号、字面量和少量字符串/集合方法
//! - 正则选项：从条件的附加信息中读取，无法识别的值一律视为无选项
//!
//! 编译失败以 [`CompileError`] 返回，由调用方记录到条件上，不会中断规则加载。

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde_json::{Number, Value};
use tracing::{debug, warn};

use crate::error::{CompileError, Result, RuleError};

/// 附加信息中保存正则表达式的键
pub const PATTERN_KEY: &str = "Pattern";

/// 附加信息中保存正则选项的键
pub const REGEX_OPTION_KEY: &str = "RegexOption";

// ---------------------------------------------------------------------------
// PropertyPath
// ---------------------------------------------------------------------------

/// 编译后的属性路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPath {
    source: String,
    segments: Vec<String>,
}

impl PropertyPath {
    /// 解析点号分隔的属性路径
    pub fn parse(source: &str) -> std::result::Result<Self, CompileError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(CompileError::new(source, 0, "属性路径不能为空"));
        }

        let mut segments = Vec::new();
        let mut offset = source.len() - source.trim_start().len();
        for segment in trimmed.split('.') {
            let valid = !segment.is_empty()
                && (segment.chars().all(|c| c.is_ascii_digit())
                    || (segment
                        .chars()
                        .next()
                        .is_some_and(|c| c.is_alphabetic() || c == '_')
                        && segment.chars().all(|c| c.is_alphanumeric() || c == '_')));
            if !valid {
                return Err(CompileError::new(
                    source,
                    offset,
                    format!("无效的属性名 '{}'", segment),
                ));
            }
            segments.push(segment.to_string());
            offset += segment.len() + 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            segments,
        })
    }

    fn from_segments(segments: Vec<String>) -> Self {
        Self {
            source: segments.join("."),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// 在 JSON 数据上解析路径，任一段不存在返回 None
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for part in &self.segments {
            match current {
                Value::Object(map) => current = map.get(part)?,
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    /// 解析路径，不存在时返回 `PropertyNotFound`
    pub fn resolve_required<'a>(&self, root: &'a Value) -> Result<&'a Value> {
        self.resolve(root).ok_or_else(|| RuleError::PropertyNotFound {
            path: self.source.clone(),
        })
    }

    /// 按数据类型的结构校验路径
    ///
    /// 结构来自类型默认值的 JSON 形态：对象必须包含对应字段；
    /// 遇到 null、基础类型或空数组时无法继续判断，视为通过。
    fn validate_against(&self, shape: &Value) -> std::result::Result<(), String> {
        let mut current = shape;
        for part in &self.segments {
            match current {
                Value::Object(map) => match map.get(part) {
                    Some(next) => current = next,
                    None => return Err(format!("类型中不存在属性 '{}'", part)),
                },
                Value::Array(arr) => {
                    if part.parse::<usize>().is_err() {
                        return Err(format!("数组不能按 '{}' 访问", part));
                    }
                    match arr.first() {
                        Some(first) => current = first,
                        None => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
        Ok(())
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    AndAnd,
    OrOr,
    Not,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    LParen,
    RParen,
    Dot,
    Comma,
    Arrow,
}

fn tokenize(source: &str) -> std::result::Result<Vec<(Token, usize)>, CompileError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|(_, c)| *c);

    while let Some(&(pos, c)) = chars.get(i) {
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = (c, peek(i + 1));
        let token = match two {
            ('&', Some('&')) => Some((Token::AndAnd, 2)),
            ('|', Some('|')) => Some((Token::OrOr, 2)),
            ('=', Some('=')) => Some((Token::Eq, 2)),
            ('=', Some('>')) => Some((Token::Arrow, 2)),
            ('!', Some('=')) => Some((Token::Ne, 2)),
            ('>', Some('=')) => Some((Token::Ge, 2)),
            ('<', Some('=')) => Some((Token::Le, 2)),
            ('!', _) => Some((Token::Not, 1)),
            ('>', _) => Some((Token::Gt, 1)),
            ('<', _) => Some((Token::Lt, 1)),
            ('(', _) => Some((Token::LParen, 1)),
            (')', _) => Some((Token::RParen, 1)),
            ('.', _) => Some((Token::Dot, 1)),
            (',', _) => Some((Token::Comma, 1)),
            _ => None,
        };
        if let Some((token, width)) = token {
            tokens.push((token, pos));
            i += width;
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match peek(i) {
                    None => return Err(CompileError::new(source, pos, "字符串字面量未闭合")),
                    Some('\\') => {
                        let escaped = peek(i + 1).ok_or_else(|| {
                            CompileError::new(source, pos, "字符串字面量未闭合")
                        })?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    }
                    Some(ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push((Token::Str(text), pos));
            continue;
        }

        if c.is_ascii_digit() || (c == '-' && peek(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while peek(i).is_some_and(|n| n.is_ascii_digit()) {
                i += 1;
            }
            // 只有小数点后紧跟数字时才是小数，否则是路径分隔符（如 items.0.name）
            if peek(i) == Some('.') && peek(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                i += 1;
                while peek(i).is_some_and(|n| n.is_ascii_digit()) {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| CompileError::new(source, pos, format!("无效的数字 '{}'", text)))?;
            tokens.push((Token::Number(number), pos));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while peek(i).is_some_and(|n| n.is_alphanumeric() || n == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            tokens.push((Token::Ident(text), pos));
            continue;
        }

        return Err(CompileError::new(source, pos, format!("无法识别的字符 '{}'", c)));
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    StartsWith,
    EndsWith,
    Contains,
    Length,
}

impl Method {
    fn parse(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "startswith" => Some(Self::StartsWith),
            "endswith" => Some(Self::EndsWith),
            "contains" => Some(Self::Contains),
            "length" | "len" | "count" => Some(Self::Length),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Length => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path(PropertyPath),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Call {
        target: Box<Expr>,
        method: Method,
        args: Vec<Expr>,
    },
    /// 不带括号的 `.Length` / `.Count`：目标对象有同名属性时取属性，否则取长度
    LengthOrProperty { target: Box<Expr>, name: String },
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
    parameter: Option<String>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: Vec<(Token, usize)>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
            parameter: None,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, p)| *p)
            .unwrap_or(self.source.len())
    }

    fn error(&self, reason: impl Into<String>) -> CompileError {
        CompileError::new(self.source, self.offset(), reason)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse(mut self) -> std::result::Result<Expr, CompileError> {
        if self.tokens.is_empty() {
            return Err(self.error("表达式不能为空"));
        }

        // 可选的 lambda 参数：`p => ...`
        if let (Some((Token::Ident(name), _)), Some((Token::Arrow, _))) =
            (self.tokens.first(), self.tokens.get(1))
        {
            self.parameter = Some(name.clone());
            self.pos = 2;
        }

        let expr = self.parse_or()?;
        if self.pos < self.tokens.len() {
            return Err(self.error("表达式末尾存在多余内容"));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> std::result::Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> std::result::Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> std::result::Result<Expr, CompileError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> std::result::Result<Expr, CompileError> {
        let left = self.parse_postfix()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_postfix()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_postfix(&mut self) -> std::result::Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;

        while self.eat(&Token::Dot) {
            let segment = match self.advance() {
                Some(Token::Ident(name)) => name,
                Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => (n as u64).to_string(),
                _ => {
                    self.pos -= 1;
                    return Err(self.error("'.' 之后需要属性名或方法名"));
                }
            };

            let is_call = self.peek() == Some(&Token::LParen);
            if !is_call && segment_is_length_property(&segment) {
                expr = Expr::LengthOrProperty {
                    target: Box::new(expr),
                    name: segment,
                };
                continue;
            }
            let method = Method::parse(&segment).filter(|_| is_call);

            match (method, expr) {
                (Some(method), target) => {
                    let args = self.parse_args()?;
                    if args.len() != method.arity() {
                        return Err(self.error(format!(
                            "方法 {} 需要 {} 个参数，实际 {}",
                            segment,
                            method.arity(),
                            args.len()
                        )));
                    }
                    expr = Expr::Call {
                        target: Box::new(target),
                        method,
                        args,
                    };
                }
                (None, _) if is_call => {
                    return Err(self.error(format!("不支持的方法 '{}'", segment)));
                }
                (None, Expr::Path(path)) => {
                    let mut segments = path.segments;
                    segments.push(segment);
                    expr = Expr::Path(PropertyPath::from_segments(segments));
                }
                (None, _) => {
                    return Err(self.error(format!("无法在非属性值上访问 '{}'", segment)));
                }
            }
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> std::result::Result<Vec<Expr>, CompileError> {
        // 当前位于 '('
        self.pos += 1;
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            return Err(self.error("参数列表缺少 ')'"));
        }
    }

    fn parse_primary(&mut self) -> std::result::Result<Expr, CompileError> {
        match self.advance() {
            Some(Token::Number(n)) => Number::from_f64(n)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| self.error("无效的数字")),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("缺少 ')'"));
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ if self.parameter.as_deref() == Some(name.as_str()) => {
                    Expr::Path(PropertyPath::from_segments(Vec::new()))
                }
                _ => Expr::Path(PropertyPath::from_segments(vec![name])),
            }),
            Some(_) => {
                self.pos -= 1;
                Err(self.error("此处需要值、属性或 '('"))
            }
            None => Err(self.error("表达式意外结束")),
        }
    }
}

/// 不带括号也可用的长度写法
fn segment_is_length_property(segment: &str) -> bool {
    matches!(segment, "Length" | "Count")
}

// ---------------------------------------------------------------------------
// CompiledExpression
// ---------------------------------------------------------------------------

/// 编译后的布尔谓词
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: String,
    root: Expr,
}

impl CompiledExpression {
    /// 解析谓词字符串（不做属性校验）
    pub fn parse(source: &str) -> std::result::Result<Self, CompileError> {
        let tokens = tokenize(source)?;
        let root = Parser::new(source, tokens).parse()?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 表达式中引用的全部属性路径
    pub fn paths(&self) -> Vec<&PropertyPath> {
        let mut paths = Vec::new();
        collect_paths(&self.root, &mut paths);
        paths
    }

    /// 在数据的 JSON 快照上执行谓词
    pub fn evaluate(&self, data: &Value) -> Result<bool> {
        let value = eval(&self.root, data)?;
        value.as_bool().ok_or_else(|| RuleError::TypeMismatch {
            expected: "bool".to_string(),
            actual: type_name(&value).to_string(),
        })
    }
}

fn collect_paths<'a>(expr: &'a Expr, paths: &mut Vec<&'a PropertyPath>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path(path) => paths.push(path),
        Expr::Not(inner) => collect_paths(inner, paths),
        Expr::And(l, r) | Expr::Or(l, r) | Expr::Compare(_, l, r) => {
            collect_paths(l, paths);
            collect_paths(r, paths);
        }
        Expr::LengthOrProperty { target, .. } => collect_paths(target, paths),
        Expr::Call { target, args, .. } => {
            collect_paths(target, paths);
            for arg in args {
                collect_paths(arg, paths);
            }
        }
    }
}

fn eval<'a>(expr: &'a Expr, data: &'a Value) -> Result<Cow<'a, Value>> {
    match expr {
        Expr::Literal(value) => Ok(Cow::Borrowed(value)),
        Expr::Path(path) => path.resolve_required(data).map(Cow::Borrowed),
        Expr::Not(inner) => Ok(Cow::Owned(Value::Bool(!eval_bool(inner, data)?))),
        Expr::And(l, r) => Ok(Cow::Owned(Value::Bool(
            eval_bool(l, data)? && eval_bool(r, data)?,
        ))),
        Expr::Or(l, r) => Ok(Cow::Owned(Value::Bool(
            eval_bool(l, data)? || eval_bool(r, data)?,
        ))),
        Expr::Compare(op, l, r) => {
            let left = eval(l, data)?;
            let right = eval(r, data)?;
            Ok(Cow::Owned(Value::Bool(compare(*op, &left, &right)?)))
        }
        Expr::Call {
            target,
            method,
            args,
        } => {
            let target = eval(target, data)?;
            let arg = match args.first() {
                Some(arg) => Some(eval(arg, data)?),
                None => None,
            };
            call(*method, &target, arg.as_deref()).map(Cow::Owned)
        }
        Expr::LengthOrProperty { target, name } => {
            let target = eval(target, data)?;
            if let Some(field) = target.as_object().and_then(|map| map.get(name.as_str())) {
                return Ok(Cow::Owned(field.clone()));
            }
            call(Method::Length, &target, None).map(Cow::Owned)
        }
    }
}

fn eval_bool(expr: &Expr, data: &Value) -> Result<bool> {
    let value = eval(expr, data)?;
    value.as_bool().ok_or_else(|| RuleError::TypeMismatch {
        expected: "bool".to_string(),
        actual: type_name(&value).to_string(),
    })
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::Ne => Ok(!values_equal(left, right)),
        _ => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b)
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| RuleError::TypeMismatch {
                expected: type_name(left).to_string(),
                actual: type_name(right).to_string(),
            })?;

            Ok(match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Eq => ordering.is_eq(),
                CompareOp::Ne => ordering.is_ne(),
            })
        }
    }
}

/// 相等比较，数值统一转为浮点数避免 100 与 100.0 不相等
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return (a - b).abs() < f64::EPSILON;
    }
    left == right
}

fn call(method: Method, target: &Value, arg: Option<&Value>) -> Result<Value> {
    let expect_str = |value: Option<&Value>| -> Result<String> {
        value
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RuleError::TypeMismatch {
                expected: "string".to_string(),
                actual: value.map(type_name).unwrap_or("none").to_string(),
            })
    };

    match method {
        Method::StartsWith => {
            let target = expect_str(Some(target))?;
            Ok(Value::Bool(target.starts_with(&expect_str(arg)?)))
        }
        Method::EndsWith => {
            let target = expect_str(Some(target))?;
            Ok(Value::Bool(target.ends_with(&expect_str(arg)?)))
        }
        Method::Contains => match target {
            Value::String(s) => Ok(Value::Bool(s.contains(&expect_str(arg)?))),
            Value::Array(items) => {
                let needle = arg.unwrap_or(&Value::Null);
                Ok(Value::Bool(items.iter().any(|item| values_equal(item, needle))))
            }
            other => Err(RuleError::TypeMismatch {
                expected: "string or array".to_string(),
                actual: type_name(other).to_string(),
            }),
        },
        Method::Length => {
            let len = match target {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(RuleError::TypeMismatch {
                        expected: "string, array or object".to_string(),
                        actual: type_name(other).to_string(),
                    });
                }
            };
            Ok(Value::from(len as u64))
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Regex options
// ---------------------------------------------------------------------------

/// 正则选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexOptions {
    pub ignore_case: bool,
    pub multiline: bool,
    pub single_line: bool,
    pub ignore_whitespace: bool,
}

impl RegexOptions {
    /// 解析选项字符串，如 `IgnoreCase|Multiline`
    ///
    /// 缺失或包含无法识别的选项时返回默认值（无选项），不会报错。
    pub fn parse(value: Option<&str>) -> Self {
        let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Self::default();
        };

        let mut options = Self::default();
        for flag in raw.split([',', '|']).map(str::trim) {
            match flag.to_ascii_lowercase().as_str() {
                "none" | "" => {}
                "ignorecase" => options.ignore_case = true,
                "multiline" => options.multiline = true,
                "singleline" => options.single_line = true,
                "ignorepatternwhitespace" => options.ignore_whitespace = true,
                _ => {
                    warn!(value = raw, flag, "无法识别的正则选项，按无选项处理");
                    return Self::default();
                }
            }
        }
        options
    }

    /// 从条件附加信息中读取选项
    pub fn from_additional_info(info: &BTreeMap<String, String>) -> Self {
        Self::parse(info.get(REGEX_OPTION_KEY).map(String::as_str))
    }

    /// 还原成选项字符串，用于序列化
    pub fn to_option_string(&self) -> String {
        let mut flags = Vec::new();
        if self.ignore_case {
            flags.push("IgnoreCase");
        }
        if self.multiline {
            flags.push("Multiline");
        }
        if self.single_line {
            flags.push("Singleline");
        }
        if self.ignore_whitespace {
            flags.push("IgnorePatternWhitespace");
        }
        if flags.is_empty() {
            "None".to_string()
        } else {
            flags.join("|")
        }
    }

    /// 按选项编译正则
    pub fn build(&self, pattern: &str) -> std::result::Result<Regex, CompileError> {
        RegexBuilder::new(pattern)
            .case_insensitive(self.ignore_case)
            .multi_line(self.multiline)
            .dot_matches_new_line(self.single_line)
            .ignore_whitespace(self.ignore_whitespace)
            .build()
            .map_err(|e| CompileError::new(pattern, 0, format!("正则表达式无效: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// ExpressionCompiler
// ---------------------------------------------------------------------------

/// 表达式编译器
///
/// 持有已注册数据类型的结构，用于在加载时校验属性路径。
#[derive(Default)]
pub struct ExpressionCompiler {
    shapes: DashMap<String, Value>,
}

impl ExpressionCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册数据类型的 JSON 结构
    pub fn register_shape(&self, type_name: impl Into<String>, shape: Value) {
        let type_name = type_name.into();
        debug!(type_name = %type_name, "注册数据类型结构");
        self.shapes.insert(type_name, shape);
    }

    pub fn has_shape(&self, type_name: &str) -> bool {
        self.shapes.contains_key(type_name)
    }

    /// 编译谓词，并在类型结构已知时校验其中的属性路径
    pub fn compile_predicate(
        &self,
        source: &str,
        context_type: &str,
    ) -> std::result::Result<Arc<CompiledExpression>, CompileError> {
        let compiled = CompiledExpression::parse(source)?;
        for path in compiled.paths() {
            self.check_path(source, path, context_type)?;
        }
        Ok(Arc::new(compiled))
    }

    /// 编译属性路径，并在类型结构已知时校验
    pub fn compile_path(
        &self,
        source: &str,
        context_type: &str,
    ) -> std::result::Result<PropertyPath, CompileError> {
        let path = PropertyPath::parse(source)?;
        self.check_path(source, &path, context_type)?;
        Ok(path)
    }

    fn check_path(
        &self,
        source: &str,
        path: &PropertyPath,
        context_type: &str,
    ) -> std::result::Result<(), CompileError> {
        let Some(shape) = self.shapes.get(context_type) else {
            return Ok(());
        };
        path.validate_against(shape.value()).map_err(|reason| {
            let position = source.find(path.as_str()).unwrap_or(0);
            CompileError::new(source, position, format!("{} ({})", reason, context_type))
        })
    }
}
