//! Expression language shared by `condition`, `transform`, and
//! `webhook_response` (spec.md §4.2).
//!
//! Tokens:
//! - Literals: unquoted numeric → number; single/double-quoted → string;
//!   `true`/`1` → boolean true, `false`/`0` → boolean false.
//! - `$input.a.b.c` → path into the workflow input.
//! - `$nodeId.a.b.c` → path into that node's recorded result.
//! - `"{{$ref}}"` → string template, substitutes the resolved value.

use serde_json::Value;

/// Resolve a single token: a literal, or a `$`-prefixed path.
///
/// `$input...` walks `input`; `$nodeId...` walks `node_results[nodeId]`.
/// Unknown tokens (missing path segments, unrecognized root) resolve to
/// `Value::Null`, which callers treat as falsy/"undefined".
pub fn resolve(token: &str, input: &Value, node_results: &Value) -> Value {
    let token = token.trim();

    if let Some(path) = token.strip_prefix('$') {
        return resolve_path(path, input, node_results);
    }

    parse_literal(token)
}

fn resolve_path(path: &str, input: &Value, node_results: &Value) -> Value {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return Value::Null;
    };

    let mut current = if root == "input" {
        input
    } else {
        match node_results.get(root) {
            Some(v) => v,
            None => return Value::Null,
        }
    };

    for segment in segments {
        current = match current.get(segment) {
            Some(v) => v,
            None => return Value::Null,
        };
    }

    current.clone()
}

fn parse_literal(token: &str) -> Value {
    if (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
        || (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
    {
        return Value::String(token[1..token.len() - 1].to_string());
    }

    match token {
        "true" | "1" => return Value::Bool(true),
        "false" | "0" => return Value::Bool(false),
        _ => {}
    }

    if let Ok(n) = token.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Value::Number(num);
        }
    }

    Value::String(token.to_string())
}

const OPERATORS: &[&str] = &[">=", "<=", "!=", "==", ">", "<"];

/// Evaluate a `condition` node's `config.expression` against the workflow
/// input and recorded node results. Returns the boolean result.
pub fn evaluate_condition(expression: &str, input: &Value, node_results: &Value) -> bool {
    let expression = expression.trim();

    match expression {
        "true" | "1" => return true,
        "false" | "0" => return false,
        _ => {}
    }

    for op in OPERATORS {
        if let Some(pos) = expression.find(op) {
            let (left, right) = expression.split_at(pos);
            let right = &right[op.len()..];
            let lhs = resolve(left.trim(), input, node_results);
            let rhs = resolve(right.trim(), input, node_results);
            return apply_operator(op, &lhs, &rhs);
        }
    }

    // No recognized operator: resolve as a single token and take its truthiness.
    truthy(&resolve(expression, input, node_results))
}

fn apply_operator(op: &str, lhs: &Value, rhs: &Value) -> bool {
    match op {
        "==" => value_to_string(lhs) == value_to_string(rhs),
        "!=" => value_to_string(lhs) != value_to_string(rhs),
        ">=" | "<=" | ">" | "<" => {
            let (Some(l), Some(r)) = (as_f64(lhs), as_f64(rhs)) else {
                return false;
            };
            if l.is_nan() || r.is_nan() {
                return false;
            }
            match op {
                ">=" => l >= r,
                "<=" => l <= r,
                ">" => l > r,
                "<" => l < r,
                _ => unreachable!(),
            }
        }
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Interpolate `"{{$ref}}"`-style placeholders in `template`, substituting
/// each resolved value (stringified; `null` becomes an empty string).
pub fn interpolate(template: &str, input: &Value, node_results: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token = after_open[..end].trim();
        let value = resolve(token, input, node_results);
        out.push_str(&stringify(&value));
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    out
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
