//! Template substitution and condition evaluation
//!
//! Supports:
//! - `{{ identifier }}` - a context variable
//! - `{{ node_id.port }}` - an output of a previously executed node
//! - `{{ var.field.nested }}` - navigation into object variables
//!
//! Unresolved references are left verbatim. Conditions are a minimal safe
//! language: literals, identifiers, `==`, `!=`, `>`, `>=`, `<`, `<=`, `!`,
//! `&&` and `||` (no parentheses, no function calls).

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").unwrap()
});

/// Errors that can occur during condition evaluation
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Invalid expression syntax: {0}")]
    InvalidSyntax(String),
}

/// Something `{{ }}` references can be resolved against
pub trait ValueLookup {
    fn lookup(&self, path: &str) -> Option<Value>;
}

impl ValueLookup for HashMap<String, Value> {
    fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.get(path) {
            return Some(value.clone());
        }
        let mut parts = path.split('.');
        let root = self.get(parts.next()?)?;
        navigate(root, parts).cloned()
    }
}

/// Walk into objects by key and arrays by index
pub fn navigate<'a, 'p>(
    mut value: &'a Value,
    parts: impl Iterator<Item = &'p str>,
) -> Option<&'a Value> {
    for part in parts {
        value = match value {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Render a value for string interpolation (strings are not quoted)
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute every resolvable reference in a string
pub fn render(input: &str, lookup: &dyn ValueLookup) -> String {
    TEMPLATE_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let path = &caps[1];
            match lookup.lookup(path) {
                Some(value) => display_value(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve a string template.
///
/// A string that consists of exactly one reference resolves to the referenced
/// value itself (keeping its JSON type); anything else is rendered as a string.
pub fn resolve_template(input: &str, lookup: &dyn ValueLookup) -> Value {
    if let Some(caps) = TEMPLATE_REGEX.captures(input.trim()) {
        let whole = caps.get(0).map(|m| m.as_str().len()) == Some(input.trim().len());
        if whole {
            if let Some(value) = lookup.lookup(&caps[1]) {
                return value;
            }
            return Value::String(input.to_string());
        }
    }
    Value::String(render(input, lookup))
}

/// Resolve templates recursively inside arrays and objects
pub fn resolve_value(value: &Value, lookup: &dyn ValueLookup) -> Value {
    match value {
        Value::String(s) if s.contains("{{") => resolve_template(s, lookup),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Truthiness used by conditions and `if` nodes
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let lower = s.trim().to_lowercase();
            !lower.is_empty() && lower != "false" && lower != "0" && lower != "null" && lower != "none"
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate a boolean condition
pub fn evaluate_condition(condition: &str, lookup: &dyn ValueLookup) -> Result<bool, ExpressionError> {
    let rendered = render(condition, lookup);
    let expr = rendered.trim();
    if expr.is_empty() {
        return Err(ExpressionError::InvalidSyntax("empty condition".to_string()));
    }
    eval_or(expr, lookup)
}

fn eval_or(expr: &str, lookup: &dyn ValueLookup) -> Result<bool, ExpressionError> {
    let parts = split_top_level(expr, "||");
    let mut any = false;
    for part in parts {
        if eval_and(part, lookup)? {
            any = true;
        }
    }
    Ok(any)
}

fn eval_and(expr: &str, lookup: &dyn ValueLookup) -> Result<bool, ExpressionError> {
    for part in split_top_level(expr, "&&") {
        if !eval_unary(part, lookup)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_unary(expr: &str, lookup: &dyn ValueLookup) -> Result<bool, ExpressionError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ExpressionError::InvalidSyntax("missing operand".to_string()));
    }
    if let Some(rest) = expr.strip_prefix('!') {
        if !rest.starts_with('=') {
            return Ok(!eval_unary(rest, lookup)?);
        }
    }
    eval_comparison(expr, lookup)
}

const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

fn eval_comparison(expr: &str, lookup: &dyn ValueLookup) -> Result<bool, ExpressionError> {
    let Some((pos, op)) = find_operator(expr) else {
        return Ok(is_truthy(&parse_operand(expr, lookup)?));
    };

    let left = parse_operand(&expr[..pos], lookup)?;
    let right = parse_operand(&expr[pos + op.len()..], lookup)?;

    let result = match op {
        "==" => values_equal(&left, &right),
        "!=" => !values_equal(&left, &right),
        _ => {
            let ordering = compare_values(&left, &right).ok_or_else(|| {
                ExpressionError::InvalidSyntax(format!("cannot compare '{}'", expr))
            })?;
            match op {
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                "<" => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
    };
    Ok(result)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => display_value(left) == display_value(right),
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_operand(token: &str, lookup: &dyn ValueLookup) -> Result<Value, ExpressionError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ExpressionError::InvalidSyntax("missing operand".to_string()));
    }

    for quote in ['\'', '"'] {
        if token.len() >= 2 && token.starts_with(quote) && token.ends_with(quote) {
            return Ok(Value::String(token[1..token.len() - 1].to_string()));
        }
    }

    match token {
        "true" | "True" => return Ok(Value::Bool(true)),
        "false" | "False" => return Ok(Value::Bool(false)),
        "null" | "None" => return Ok(Value::Null),
        _ => {}
    }

    if let Ok(i) = token.parse::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = token.parse::<f64>() {
        return Ok(Value::from(f));
    }

    let is_identifier = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if !is_identifier {
        return Err(ExpressionError::InvalidSyntax(token.to_string()));
    }

    lookup
        .lookup(token)
        .ok_or_else(|| ExpressionError::UnknownVariable(token.to_string()))
}

/// Find the first comparison operator outside quotes
fn find_operator(expr: &str) -> Option<(usize, &'static str)> {
    let bytes = expr.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == b'\'' || c == b'"' => quote = Some(c),
            None => {
                for op in OPERATORS {
                    if bytes[i..].starts_with(op.as_bytes()) {
                        return Some((i, op));
                    }
                }
            }
        }
        i += 1;
    }
    None
}

/// Split on a separator that is not inside quotes
fn split_top_level<'a>(expr: &'a str, separator: &str) -> Vec<&'a str> {
    let bytes = expr.as_bytes();
    let mut parts = Vec::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == b'\'' || c == b'"' => quote = Some(c),
            None if bytes[i..].starts_with(separator.as_bytes()) => {
                parts.push(&expr[start..i]);
                i += separator.len();
                start = i;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}
