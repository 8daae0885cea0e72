//! RFC 6902 patch application with the engine's lenient options.
//!
//! The `json_patch` crate's own `patch()` is strict: `add` fails when the
//! parent path is absent, `remove` fails when the target is absent, and
//! array indices must be non-negative. Rule-authored patches rely on the
//! opposite behavior, so application is implemented here over
//! `serde_json::Value` with three switches:
//!
//! * `ensure_path_exists_on_add`: `add` creates missing intermediate
//!   containers (arrays when the next token is an index or `-`, objects
//!   otherwise) and pads arrays with `null`s;
//! * `allow_missing_path_on_remove`: `remove` of an absent path is a
//!   no-op;
//! * `support_negative_indices`: `-1` addresses the last element.

use json_patch::{Patch, PatchOperation};
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub struct PatchOptions {
    pub allow_missing_path_on_remove: bool,
    pub support_negative_indices: bool,
    pub ensure_path_exists_on_add: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            allow_missing_path_on_remove: true,
            support_negative_indices: true,
            ensure_path_exists_on_add: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("path '{0}' does not exist")]
    PathNotFound(String),
    #[error("invalid array index '{0}'")]
    InvalidIndex(String),
    #[error("cannot traverse {found} at '{path}'")]
    NotAContainer { path: String, found: &'static str },
    #[error("unsupported patch operation '{0}'")]
    UnsupportedOperation(&'static str),
}

/// Apply all operations in order. The document is mutated in place; callers
/// that need all-or-nothing behavior apply to a clone and commit on
/// success.
pub fn apply(doc: &mut Value, patch: &Patch, options: &PatchOptions) -> Result<(), PatchError> {
    for operation in &patch.0 {
        apply_operation(doc, operation, options)?;
    }
    Ok(())
}

fn apply_operation(
    doc: &mut Value,
    operation: &PatchOperation,
    options: &PatchOptions,
) -> Result<(), PatchError> {
    match operation {
        PatchOperation::Add(op) => add(doc, &tokens(&op.path), op.value.clone(), options),
        PatchOperation::Replace(op) => replace(doc, &tokens(&op.path), op.value.clone(), options),
        PatchOperation::Remove(op) => remove(doc, &tokens(&op.path), options),
        PatchOperation::Move(_) => Err(PatchError::UnsupportedOperation("move")),
        PatchOperation::Copy(_) => Err(PatchError::UnsupportedOperation("copy")),
        PatchOperation::Test(_) => Err(PatchError::UnsupportedOperation("test")),
    }
}

fn tokens(pointer: &json_patch::jsonptr::Pointer) -> Vec<String> {
    pointer
        .tokens()
        .map(|t| t.decoded().into_owned())
        .collect()
}

fn join(tokens: &[String]) -> String {
    let mut out = String::new();
    for token in tokens {
        out.push('/');
        out.push_str(token);
    }
    out
}

fn add(doc: &mut Value, tokens: &[String], value: Value, options: &PatchOptions) -> Result<(), PatchError> {
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };

    let mut node = doc;
    for (depth, token) in parents.iter().enumerate() {
        node = step_for_add(node, token, parents.get(depth + 1).or(Some(last)), tokens, options)?;
    }

    match node {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index = parse_index(last, items.len(), options)?;
            if index > items.len() {
                if !options.ensure_path_exists_on_add {
                    return Err(PatchError::PathNotFound(join(tokens)));
                }
                items.resize(index, Value::Null);
            }
            items.insert(index.min(items.len()), value);
            Ok(())
        }
        other => Err(PatchError::NotAContainer {
            path: join(tokens),
            found: type_name(other),
        }),
    }
}

/// Descend one level while applying `add`, creating the child when allowed.
fn step_for_add<'a>(
    node: &'a mut Value,
    token: &str,
    next: Option<&String>,
    full_path: &[String],
    options: &PatchOptions,
) -> Result<&'a mut Value, PatchError> {
    let ensure = options.ensure_path_exists_on_add;
    match node {
        Value::Object(map) => match map.entry(token.to_string()) {
            serde_json::map::Entry::Vacant(slot) => {
                if !ensure {
                    return Err(PatchError::PathNotFound(join(full_path)));
                }
                Ok(slot.insert(empty_container(next)))
            }
            serde_json::map::Entry::Occupied(slot) => {
                let child = slot.into_mut();
                if ensure && child.is_null() {
                    *child = empty_container(next);
                }
                Ok(child)
            }
        },
        Value::Array(items) => {
            let index = parse_index(token, items.len(), options)?;
            if index >= items.len() {
                if !ensure {
                    return Err(PatchError::PathNotFound(join(full_path)));
                }
                items.resize(index + 1, Value::Null);
            }
            let child = &mut items[index];
            if ensure && child.is_null() {
                *child = empty_container(next);
            }
            Ok(child)
        }
        other => Err(PatchError::NotAContainer {
            path: join(full_path),
            found: type_name(other),
        }),
    }
}

fn empty_container(next: Option<&String>) -> Value {
    let array_like = next
        .map(|t| t == "-" || t.chars().all(|c| c.is_ascii_digit()) && !t.is_empty())
        .unwrap_or(false);
    if array_like {
        Value::Array(Vec::new())
    } else {
        Value::Object(serde_json::Map::new())
    }
}

fn replace(doc: &mut Value, tokens: &[String], value: Value, options: &PatchOptions) -> Result<(), PatchError> {
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };

    let Some(node) = walk(doc, parents, options)? else {
        return Err(PatchError::PathNotFound(join(tokens)));
    };

    match node {
        Value::Object(map) => match map.get_mut(last) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(PatchError::PathNotFound(join(tokens))),
        },
        Value::Array(items) => {
            let index = parse_index(last, items.len(), options)?;
            match items.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(PatchError::PathNotFound(join(tokens))),
            }
        }
        other => Err(PatchError::NotAContainer {
            path: join(tokens),
            found: type_name(other),
        }),
    }
}

fn remove(doc: &mut Value, tokens: &[String], options: &PatchOptions) -> Result<(), PatchError> {
    let missing_ok = options.allow_missing_path_on_remove;
    let missing = |tokens: &[String]| {
        if missing_ok {
            Ok(())
        } else {
            Err(PatchError::PathNotFound(join(tokens)))
        }
    };

    let Some((last, parents)) = tokens.split_last() else {
        *doc = Value::Null;
        return Ok(());
    };

    let Some(node) = walk(doc, parents, options)? else {
        return missing(tokens);
    };

    match node {
        Value::Object(map) => {
            if map.remove(last).is_none() {
                return missing(tokens);
            }
            Ok(())
        }
        Value::Array(items) => {
            let index = match parse_index(last, items.len(), options) {
                Ok(index) => index,
                Err(_) if missing_ok => return Ok(()),
                Err(e) => return Err(e),
            };
            if index >= items.len() {
                return missing(tokens);
            }
            items.remove(index);
            Ok(())
        }
        _ => missing(tokens),
    }
}

/// Walk to a node without creating anything; `Ok(None)` means a step was
/// missing.
fn walk<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    options: &PatchOptions,
) -> Result<Option<&'a mut Value>, PatchError> {
    let mut node = doc;
    for token in tokens {
        node = match node {
            Value::Object(map) => match map.get_mut(token) {
                Some(child) => child,
                None => return Ok(None),
            },
            Value::Array(items) => {
                let len = items.len();
                let Ok(index) = parse_index(token, len, options) else {
                    return Ok(None);
                };
                match items.get_mut(index) {
                    Some(child) => child,
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
    }
    Ok(Some(node))
}

fn parse_index(token: &str, len: usize, options: &PatchOptions) -> Result<usize, PatchError> {
    let value: i64 = token
        .parse()
        .map_err(|_| PatchError::InvalidIndex(token.to_string()))?;
    if value < 0 {
        if !options.support_negative_indices {
            return Err(PatchError::InvalidIndex(token.to_string()));
        }
        let adjusted = value + len as i64;
        if adjusted < 0 {
            return Err(PatchError::InvalidIndex(token.to_string()));
        }
        return Ok(adjusted as usize);
    }
    Ok(value as usize)
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
