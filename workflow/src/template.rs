//! Argument templating and condition expressions.
//!
//! String values may embed `{{ … }}` tokens drawing from an immutable
//! snapshot of inputs and prior step results:
//!
//! - `inputs.«name»` (with optional path into structured inputs)
//! - `steps.«id».result`
//! - `steps.«id».is_error`
//! - `steps.«id».json.«path»` (empty string when the result is not JSON)
//!
//! Conditions are boolean expressions over the same namespace with `==`,
//! `!=`, `&&`, `||`, parentheses and literals (`true`, `false`, numbers,
//! single-quoted strings without escapes).

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::StepResult;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed '{{{{' in template")]
    Unclosed,

    #[error("unknown input '{0}'")]
    UnknownInput(String),

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("unsupported expression '{0}'")]
    BadExpression(String),

    #[error("invalid condition: {0}")]
    BadCondition(String),
}

/// Immutable snapshot passed into a level's argument resolution and
/// condition evaluation. Steps in one level never see each other's
/// results because the snapshot is taken before the level starts.
#[derive(Debug, Default, Clone)]
pub struct TemplateContext {
    inputs: Map<String, Value>,
    steps: HashMap<String, StepResult>,
}

impl TemplateContext {
    pub fn new(inputs: Map<String, Value>, steps: HashMap<String, StepResult>) -> Self {
        Self { inputs, steps }
    }

    /// Expand every `{{ … }}` token inside `template`.
    pub fn expand(&self, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or(TemplateError::Unclosed)?;
            let value = self.lookup(after[..end].trim())?;
            out.push_str(&value_to_string(&value));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Recursively resolve templated strings inside a JSON value.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, TemplateError> {
        Ok(match value {
            Value::String(text) => Value::String(self.expand(text)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(self.resolve_map(map)?),
            other => other.clone(),
        })
    }

    pub fn resolve_map(&self, map: &Map<String, Value>) -> Result<Map<String, Value>, TemplateError> {
        map.iter()
            .map(|(key, value)| Ok((key.clone(), self.resolve_value(value)?)))
            .collect()
    }

    fn lookup(&self, expr: &str) -> Result<Value, TemplateError> {
        if let Some(path) = expr.strip_prefix("inputs.") {
            let (name, rest) = match path.split_once('.') {
                Some((name, rest)) => (name, Some(rest)),
                None => (path, None),
            };
            let value = self
                .inputs
                .get(name)
                .ok_or_else(|| TemplateError::UnknownInput(name.to_string()))?;
            return Ok(match rest {
                Some(rest) => json_path(value, rest).cloned().unwrap_or(Value::String(String::new())),
                None => value.clone(),
            });
        }
        if let Some(path) = expr.strip_prefix("steps.") {
            let (id, field) = path
                .split_once('.')
                .ok_or_else(|| TemplateError::BadExpression(expr.to_string()))?;
            let step = self
                .steps
                .get(id)
                .ok_or_else(|| TemplateError::UnknownStep(id.to_string()))?;
            return match field {
                "result" => Ok(Value::String(step.text.clone())),
                "is_error" => Ok(Value::Bool(step.is_error)),
                "json" => Ok(step.json().cloned().unwrap_or(Value::String(String::new()))),
                field if field.starts_with("json.") => {
                    let path = &field["json.".len()..];
                    Ok(step
                        .json()
                        .and_then(|doc| json_path(doc, path))
                        .cloned()
                        .unwrap_or(Value::String(String::new())))
                }
                _ => Err(TemplateError::BadExpression(expr.to_string())),
            };
        }
        Err(TemplateError::BadExpression(expr.to_string()))
    }

    /// Evaluate a condition expression to a boolean.
    pub fn eval_condition(&self, expr: &str) -> Result<bool, TemplateError> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser { tokens, pos: 0 };
        let value = parser.parse_or(self)?;
        if parser.pos != parser.tokens.len() {
            return Err(TemplateError::BadCondition(format!(
                "trailing tokens in '{expr}'"
            )));
        }
        Ok(truthy(&value))
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => match (left, right) {
            (Value::Bool(l), Value::Bool(r)) => l == r,
            _ => value_to_string(left) == value_to_string(right),
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    Bool(bool),
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, TemplateError> {
    let bytes = expr.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '&' | '|' => {
                let token = match (c, bytes.get(i + 1).copied()) {
                    ('=', Some(b'=')) => Token::EqEq,
                    ('!', Some(b'=')) => Token::NotEq,
                    ('&', Some(b'&')) => Token::AndAnd,
                    ('|', Some(b'|')) => Token::OrOr,
                    _ => {
                        return Err(TemplateError::BadCondition(format!(
                            "unexpected '{c}' in '{expr}'"
                        )))
                    }
                };
                tokens.push(token);
                i += 2;
            }
            '\'' => {
                let rest = &expr[i + 1..];
                let end = rest.find('\'').ok_or_else(|| {
                    TemplateError::BadCondition(format!("unterminated string in '{expr}'"))
                })?;
                tokens.push(Token::Str(rest[..end].to_string()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let number: f64 = expr[start..i].parse().map_err(|_| {
                    TemplateError::BadCondition(format!("bad number in '{expr}'"))
                })?;
                tokens.push(Token::Num(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                match &expr[start..i] {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    path => tokens.push(Token::Path(path.to_string())),
                }
            }
            other => {
                return Err(TemplateError::BadCondition(format!(
                    "unexpected '{other}' in '{expr}'"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self, context: &TemplateContext) -> Result<Value, TemplateError> {
        let mut value = self.parse_and(context)?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let right = self.parse_and(context)?;
            value = Value::Bool(truthy(&value) || truthy(&right));
        }
        Ok(value)
    }

    fn parse_and(&mut self, context: &TemplateContext) -> Result<Value, TemplateError> {
        let mut value = self.parse_cmp(context)?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let right = self.parse_cmp(context)?;
            value = Value::Bool(truthy(&value) && truthy(&right));
        }
        Ok(value)
    }

    fn parse_cmp(&mut self, context: &TemplateContext) -> Result<Value, TemplateError> {
        let left = self.parse_operand(context)?;
        let negate = match self.peek() {
            Some(Token::EqEq) => false,
            Some(Token::NotEq) => true,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_operand(context)?;
        Ok(Value::Bool(values_equal(&left, &right) != negate))
    }

    fn parse_operand(&mut self, context: &TemplateContext) -> Result<Value, TemplateError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| TemplateError::BadCondition("unexpected end of expression".to_string()))?;
        self.pos += 1;
        match token {
            Token::Str(text) => Ok(Value::String(text)),
            Token::Num(number) => Ok(serde_json::json!(number)),
            Token::Bool(flag) => Ok(Value::Bool(flag)),
            Token::Path(path) => context.lookup(&path),
            Token::LParen => {
                let value = self.parse_or(context)?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(TemplateError::BadCondition("missing ')'".to_string()));
                }
                self.pos += 1;
                Ok(value)
            }
            other => Err(TemplateError::BadCondition(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}
