//! Evaluator for the expression language.
//!
//! Selection never fails on missing data: walking off the edge of a
//! document produces `Undefined`, and wildcard-like steps simply yield
//! fewer matches. Errors are reserved for type misuse (a non-boolean
//! operand to `&&`, a regex over an object, an unknown function), which the
//! matcher treats as a negative match.

use std::collections::BTreeMap;

use crate::expr::ast::{BinaryOp, Expr, PathRoot, Segment, UnaryOp, UnionMember};
use crate::expr::functions;
use crate::expr::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{name}() expects {expected}")]
    FunctionUsage { name: String, expected: String },
    #[error("invalid regular expression '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("date() could not parse '{0}'")]
    DateParse(String),
}

/// One node selected by a path, together with the keys captured at each
/// wildcard-like step along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct PathMatch {
    pub captures: Vec<Vec<String>>,
    pub value: Value,
}

/// Evaluate an expression against a document.
pub fn evaluate(expr: &Expr, root: &Value) -> Result<Value, EvalError> {
    eval(expr, root, root)
}

fn eval(expr: &Expr, root: &Value, current: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, root, current)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval(value, root, current)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Path {
            root: path_root,
            segments,
        } => {
            let base = match path_root {
                PathRoot::Root => root,
                PathRoot::Current => current,
            };
            let has_wildcards = segments.iter().any(Segment::is_wildcard_like);
            let matches = select(base, segments, root)?;
            if has_wildcards {
                Ok(Value::Array(matches.into_iter().map(|m| m.value).collect()))
            } else {
                // Definite paths address exactly one node.
                Ok(matches
                    .into_iter()
                    .next()
                    .map(|m| m.value)
                    .unwrap_or(Value::Undefined))
            }
        }
        Expr::Placeholder {
            ordinal,
            root: path_root,
            segments,
        } => {
            let base = match path_root {
                PathRoot::Root => root,
                PathRoot::Current => current,
            };
            let matches = select(base, segments, root)?;
            Ok(placeholder_map(matches, *ordinal))
        }
        Expr::Unary { op, expr } => {
            let value = eval(expr, root, current)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!as_bool(&value)?)),
                UnaryOp::Neg => match value {
                    Value::Number(n) => Ok(Value::Number(-n)),
                    other => Err(EvalError::TypeMismatch(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, root, current),
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            let cond = eval(cond, root, current)?;
            if is_fallback(&cond) {
                eval(else_expr, root, current)
            } else {
                eval(then_expr, root, current)
            }
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, root, current)?);
            }
            functions::call(name, values)
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    root: &Value,
    current: &Value,
) -> Result<Value, EvalError> {
    // Short-circuiting forms first; their right side may not be evaluated.
    match op {
        BinaryOp::And => {
            let lhs = as_bool(&eval(left, root, current)?)?;
            if !lhs {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(as_bool(&eval(right, root, current)?)?));
        }
        BinaryOp::Or => {
            let lhs = as_bool(&eval(left, root, current)?)?;
            if lhs {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(as_bool(&eval(right, root, current)?)?));
        }
        BinaryOp::Coalesce => {
            let lhs = eval(left, root, current)?;
            if is_fallback(&lhs) {
                return eval(right, root, current);
            }
            return Ok(lhs);
        }
        _ => {}
    }

    let lhs = eval(left, root, current)?;
    let rhs = eval(right, root, current)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, &lhs, &rhs),
        BinaryOp::Matches => Ok(Value::Bool(regex_match(&lhs, &rhs)?)),
        BinaryOp::NotMatches => Ok(Value::Bool(!regex_match(&lhs, &rhs)?)),
        BinaryOp::In => match rhs {
            Value::Array(items) => Ok(Value::Bool(items.contains(&lhs))),
            other => Err(EvalError::TypeMismatch(format!(
                "'in' expects an array on the right, got {}",
                other.type_name()
            ))),
        },
        BinaryOp::Add => match (&lhs, &rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(_), _) | (_, Value::String(_)) => {
                if lhs.is_undefined() || rhs.is_undefined() {
                    return Err(EvalError::TypeMismatch(
                        "cannot concatenate undefined".into(),
                    ));
                }
                Ok(Value::String(format!(
                    "{}{}",
                    lhs.to_plain_string(),
                    rhs.to_plain_string()
                )))
            }
            _ => Err(EvalError::TypeMismatch(format!(
                "cannot add {} and {}",
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (a, b) = both_numbers(&lhs, &rhs, op)?;
            Ok(Value::Number(match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            }))
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr => {
            let (a, b) = both_numbers(&lhs, &rhs, op)?;
            let (a, b) = (a as i64, b as i64);
            let out = match op {
                BinaryOp::BitAnd => a & b,
                BinaryOp::BitOr => a | b,
                BinaryOp::BitXor => a ^ b,
                BinaryOp::Shl => a.wrapping_shl(b as u32),
                _ => a.wrapping_shr(b as u32),
            };
            Ok(Value::Number(out as f64))
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => unreachable!("handled above"),
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            a.partial_cmp(b).ok_or_else(|| {
                EvalError::TypeMismatch("cannot order NaN".into())
            })?
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            return Err(EvalError::TypeMismatch(format!(
                "cannot compare {} and {}",
                lhs.type_name(),
                rhs.type_name()
            )))
        }
    };
    Ok(Value::Bool(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    }))
}

fn regex_match(lhs: &Value, rhs: &Value) -> Result<bool, EvalError> {
    let subject = match lhs {
        Value::String(s) => s.clone(),
        Value::Number(_) | Value::Bool(_) => lhs.to_plain_string(),
        other => {
            return Err(EvalError::TypeMismatch(format!(
                "cannot regex-match {}",
                other.type_name()
            )))
        }
    };
    let pattern = match rhs {
        Value::String(s) => s,
        other => {
            return Err(EvalError::TypeMismatch(format!(
                "regex pattern must be a string, got {}",
                other.type_name()
            )))
        }
    };
    let re = regex::Regex::new(pattern).map_err(|source| EvalError::InvalidRegex {
        pattern: pattern.clone(),
        source,
    })?;
    Ok(re.is_match(&subject))
}

fn both_numbers(lhs: &Value, rhs: &Value, op: BinaryOp) -> Result<(f64, f64), EvalError> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => Ok((*a, *b)),
        _ => Err(EvalError::TypeMismatch(format!(
            "{:?} requires numeric operands, got {} and {}",
            op,
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn as_bool(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(EvalError::TypeMismatch(format!(
            "expected bool, got {}",
            other.type_name()
        ))),
    }
}

/// `??` and `?:` select their fallback branch on null, undefined and false.
fn is_fallback(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Undefined | Value::Bool(false))
}

/// Run a path selection, tracking placeholder captures.
pub fn select(base: &Value, segments: &[Segment], root: &Value) -> Result<Vec<PathMatch>, EvalError> {
    let mut matches = vec![PathMatch {
        captures: Vec::new(),
        value: base.clone(),
    }];
    for segment in segments {
        matches = apply_segment(matches, segment, root)?;
    }
    Ok(matches)
}

fn apply_segment(
    matches: Vec<PathMatch>,
    segment: &Segment,
    root: &Value,
) -> Result<Vec<PathMatch>, EvalError> {
    let mut out = Vec::new();
    for m in matches {
        match segment {
            Segment::Key(key) => out.push(PathMatch {
                value: get_key(&m.value, key),
                captures: m.captures,
            }),
            Segment::Index(index) => out.push(PathMatch {
                value: get_index(&m.value, *index),
                captures: m.captures,
            }),
            Segment::Wildcard => {
                for (key, child) in children(&m.value) {
                    out.push(extend(&m, key, child));
                }
            }
            Segment::Slice { start, stop, step } => {
                if let Value::Array(items) = &m.value {
                    for index in slice_indices(items.len(), *start, *stop, *step) {
                        out.push(extend(&m, index.to_string(), items[index].clone()));
                    }
                }
            }
            Segment::Union(members) => {
                for member in members {
                    match (&m.value, member) {
                        (Value::Array(items), UnionMember::Index(i)) => {
                            if let Some(index) = normalize_index(*i, items.len()) {
                                out.push(extend(&m, index.to_string(), items[index].clone()));
                            }
                        }
                        (Value::Object(map), member) => {
                            let key = match member {
                                UnionMember::Index(i) => i.to_string(),
                                UnionMember::Key(k) => k.clone(),
                            };
                            if let Some(child) = map.get(&key) {
                                out.push(extend(&m, key, child.clone()));
                            }
                        }
                        _ => {}
                    }
                }
            }
            Segment::Filter(predicate) => {
                for (key, child) in children(&m.value) {
                    // A failing or non-boolean predicate is a non-match, the
                    // same way a missing key is.
                    let keep = matches!(eval(predicate, root, &child), Ok(Value::Bool(true)));
                    if keep {
                        out.push(extend(&m, key, child));
                    }
                }
            }
            Segment::Descent(inner) => {
                for (path, node) in descend(&m.value) {
                    let sub = apply_segment(
                        vec![PathMatch {
                            captures: Vec::new(),
                            value: node,
                        }],
                        inner,
                        root,
                    )?;
                    for s in sub {
                        // A definite inner step matches a descendant only
                        // when the addressed node exists; otherwise every
                        // node in the tree would yield an undefined match.
                        if !inner.is_wildcard_like() && s.value.is_undefined() {
                            continue;
                        }
                        let mut captures = m.captures.clone();
                        captures.push(path.clone());
                        captures.extend(s.captures);
                        out.push(PathMatch {
                            captures,
                            value: s.value,
                        });
                    }
                }
            }
        }
    }
    Ok(out)
}

fn extend(m: &PathMatch, key: String, value: Value) -> PathMatch {
    let mut captures = m.captures.clone();
    captures.push(vec![key]);
    PathMatch {
        captures,
        value,
    }
}

fn get_key(value: &Value, key: &str) -> Value {
    match value {
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

fn get_index(value: &Value, index: i64) -> Value {
    match value {
        Value::Array(items) => normalize_index(index, items.len())
            .map(|i| items[i].clone())
            .unwrap_or(Value::Undefined),
        Value::Object(map) => map
            .get(&index.to_string())
            .cloned()
            .unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let index = if index < 0 { index + len as i64 } else { index };
    if index >= 0 && (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

/// Immediate children of a node: array elements keyed by index, object
/// values keyed by key (in key order). Scalars have none.
fn children(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Vec::new(),
    }
}

/// Pre-order walk of a subtree; each node is paired with the keys on the
/// way down from (and excluding) the starting node.
fn descend(value: &Value) -> Vec<(Vec<String>, Value)> {
    let mut out = Vec::new();
    let mut stack = vec![(Vec::new(), value.clone())];
    while let Some((path, node)) = stack.pop() {
        let kids = children(&node);
        out.push((path.clone(), node));
        // Reverse so the LIFO stack yields children in natural order.
        for (key, child) in kids.into_iter().rev() {
            let mut child_path = path.clone();
            child_path.push(key);
            stack.push((child_path, child));
        }
    }
    out
}

fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Vec<usize> {
    let len = len as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Vec::new();
    }

    let clamp = |v: i64, low: i64, high: i64| v.max(low).min(high);
    let resolve = |v: i64| if v < 0 { v + len } else { v };

    let mut indices = Vec::new();
    if step > 0 {
        let start = clamp(start.map(resolve).unwrap_or(0), 0, len);
        let stop = clamp(stop.map(resolve).unwrap_or(len), 0, len);
        let mut i = start;
        while i < stop {
            indices.push(i as usize);
            i += step;
        }
    } else {
        let start = clamp(start.map(resolve).unwrap_or(len - 1), -1, len - 1);
        let stop = clamp(stop.map(resolve).unwrap_or(-1), -1, len - 1);
        let mut i = start;
        while i > stop {
            indices.push(i as usize);
            i += step;
        }
        indices.reverse();
    }
    indices
}

fn placeholder_map(matches: Vec<PathMatch>, ordinal: Option<usize>) -> Value {
    let mut map = BTreeMap::new();
    for m in matches {
        if m.value.is_undefined() {
            continue;
        }
        let key = match ordinal {
            None => {
                let mut key = String::from("$");
                for segment in &m.captures {
                    for part in segment {
                        key.push_str(&format!("[\"{}\"]", part));
                    }
                }
                key
            }
            Some(i) => match m.captures.get(i) {
                None => continue,
                Some(segment) if segment.len() == 1 => segment[0].clone(),
                Some(segment) => segment
                    .iter()
                    .map(|part| format!("[\"{}\"]", part))
                    .collect(),
            },
        };
        map.insert(key, m.value);
    }
    Value::Object(map)
}
