//! Document matching, update and query-pipeline semantics.
//!
//! Shared by every [`super::DocumentStore`] implementation so that stores only
//! deal with persistence.

use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::error::StackError;

/// Read a dotted path (`settings.client_id`) from a document.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    while let Some(key) = parts.next() {
        if parts.peek().is_none() {
            current.insert(key.to_string(), value);
            return;
        }
        let entry = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
}

/// Remove a dotted path.
pub fn remove_path(doc: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Equality fields of a filter, used to seed an inserted document.
pub fn seed_from_filter(filter: &Value) -> Map<String, Value> {
    let mut seed = Map::new();
    if let Value::Object(conditions) = filter {
        for (path, value) in conditions {
            let is_operator = value
                .as_object()
                .map(|m| m.keys().any(|k| k.starts_with('$')))
                .unwrap_or(false);
            if !is_operator {
                set_path(&mut seed, path, value.clone());
            }
        }
    }
    seed
}

/// Whether `doc` satisfies a `$match`-style filter.
pub fn matches(doc: &Value, filter: &Value) -> Result<bool, StackError> {
    let Value::Object(conditions) = filter else {
        return Err(StackError::Store(format!("filter must be an object, got {}", filter)));
    };

    for (path, condition) in conditions {
        let actual = get_path(doc, path);
        if !matches_condition(actual, condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn matches_condition(actual: Option<&Value>, condition: &Value) -> Result<bool, StackError> {
    if !is_operator_object(condition) {
        return Ok(values_equal(actual, condition));
    }

    let Value::Object(ops) = condition else {
        return Ok(false);
    };
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => values_equal(actual, operand),
            "$ne" => !values_equal(actual, operand),
            "$gt" => compare_present(actual, operand) == Some(Ordering::Greater),
            "$gte" => matches!(
                compare_present(actual, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "$lt" => compare_present(actual, operand) == Some(Ordering::Less),
            "$lte" => matches!(
                compare_present(actual, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            "$in" => operand_list(op, operand)?
                .iter()
                .any(|candidate| values_equal(actual, candidate)),
            "$nin" => !operand_list(op, operand)?
                .iter()
                .any(|candidate| values_equal(actual, candidate)),
            "$exists" => {
                let present = actual.is_some();
                present == crate::definition::is_truthy(operand)
            }
            other => {
                return Err(StackError::Store(format!("unsupported query operator: {}", other)))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operand_list<'a>(op: &str, operand: &'a Value) -> Result<&'a Vec<Value>, StackError> {
    operand
        .as_array()
        .ok_or_else(|| StackError::Store(format!("{} expects an array", op)))
}

/// Equality with array-contains semantics for array fields.
fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| json_eq(item, expected))
        }
        Some(value) => json_eq(value, expected),
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_present(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    let actual = actual?;
    if type_rank(actual) != type_rank(operand) {
        return None;
    }
    Some(compare_values(actual, operand))
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values: by type rank, then by value.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Apply an update in any of its accepted forms.
///
/// A plain object is a `$set`; an object of `$`-keys is an operator
/// document; an array is a pipeline of operator documents.
pub fn apply_update(doc: &mut Map<String, Value>, update: &Value) -> Result<(), StackError> {
    match update {
        Value::Array(stages) => {
            for stage in stages {
                apply_update(doc, stage)?;
            }
            Ok(())
        }
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            for (op, fields) in map {
                apply_operator(doc, op, fields)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (path, value) in map {
                set_path(doc, path, value.clone());
            }
            Ok(())
        }
        other => Err(StackError::Store(format!("unsupported update: {}", other))),
    }
}

fn apply_operator(doc: &mut Map<String, Value>, op: &str, fields: &Value) -> Result<(), StackError> {
    let Value::Object(fields) = fields else {
        return Err(StackError::Store(format!("{} expects an object", op)));
    };

    match op {
        "$set" => {
            for (path, value) in fields {
                set_path(doc, path, value.clone());
            }
        }
        "$unset" => {
            for path in fields.keys() {
                remove_path(doc, path);
            }
        }
        "$inc" => {
            for (path, delta) in fields {
                let current = get_path(&Value::Object(doc.clone()), path).cloned();
                let next = add_numbers(current.as_ref(), delta)
                    .ok_or_else(|| StackError::Store(format!("cannot $inc non-numeric field {}", path)))?;
                set_path(doc, path, next);
            }
        }
        "$push" => {
            for (path, item) in fields {
                let current = get_path(&Value::Object(doc.clone()), path).cloned();
                let mut items = match current {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return Err(StackError::Store(format!("cannot $push to non-array field {}", path)))
                    }
                };
                items.push(item.clone());
                set_path(doc, path, Value::Array(items));
            }
        }
        other => return Err(StackError::Store(format!("unsupported update operator: {}", other))),
    }
    Ok(())
}

fn add_numbers(current: Option<&Value>, delta: &Value) -> Option<Value> {
    let Value::Number(delta_num) = delta else {
        return None;
    };
    let base = match current {
        None | Some(Value::Null) => return Some(delta.clone()),
        Some(Value::Number(n)) => n,
        Some(_) => return None,
    };
    if let (Some(a), Some(b)) = (base.as_i64(), delta_num.as_i64()) {
        return a.checked_add(b).map(Value::from);
    }
    let sum = base.as_f64()? + delta_num.as_f64()?;
    serde_json::Number::from_f64(sum).map(Value::Number)
}

/// Run a query pipeline over a set of documents.
pub fn run_pipeline(mut docs: Vec<Value>, pipeline: &[Value]) -> Result<Vec<Value>, StackError> {
    for stage in pipeline {
        let Value::Object(stage_map) = stage else {
            return Err(StackError::Store(format!("pipeline stage must be an object, got {}", stage)));
        };
        let Some((op, arg)) = stage_map.iter().next().filter(|_| stage_map.len() == 1) else {
            return Err(StackError::Store("pipeline stage must have exactly one operator".to_string()));
        };

        docs = match op.as_str() {
            "$match" => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, arg)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                let keys = sort_keys(arg)?;
                docs.sort_by(|a, b| {
                    for (path, descending) in &keys {
                        let left = get_path(a, path).unwrap_or(&Value::Null);
                        let right = get_path(b, path).unwrap_or(&Value::Null);
                        let ord = compare_values(left, right);
                        let ord = if *descending { ord.reverse() } else { ord };
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
                docs
            }
            "$skip" => docs.into_iter().skip(as_count(op, arg)?).collect(),
            "$limit" => docs.into_iter().take(as_count(op, arg)?).collect(),
            "$project" => docs
                .iter()
                .map(|doc| project(doc, arg))
                .collect::<Result<Vec<_>, _>>()?,
            "$count" => {
                let field = arg
                    .as_str()
                    .ok_or_else(|| StackError::Store("$count expects a field name".to_string()))?;
                let mut out = Map::new();
                out.insert(field.to_string(), Value::from(docs.len()));
                vec![Value::Object(out)]
            }
            other => {
                return Err(StackError::Store(format!("unsupported pipeline stage: {}", other)))
            }
        };
    }
    Ok(docs)
}

fn sort_keys(arg: &Value) -> Result<Vec<(String, bool)>, StackError> {
    let Value::Object(spec) = arg else {
        return Err(StackError::Store("$sort expects an object".to_string()));
    };
    spec.iter()
        .map(|(path, dir)| match dir.as_i64() {
            Some(1) => Ok((path.clone(), false)),
            Some(-1) => Ok((path.clone(), true)),
            _ => Err(StackError::Store(format!("invalid sort direction for {}", path))),
        })
        .collect()
}

fn as_count(op: &str, arg: &Value) -> Result<usize, StackError> {
    arg.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StackError::Store(format!("{} expects a non-negative integer", op)))
}

fn project(doc: &Value, spec: &Value) -> Result<Value, StackError> {
    let Value::Object(spec) = spec else {
        return Err(StackError::Store("$project expects an object".to_string()));
    };
    let include = spec.values().any(crate::definition::is_truthy);

    if include {
        let mut out = Map::new();
        for (path, flag) in spec {
            if crate::definition::is_truthy(flag) {
                if let Some(value) = get_path(doc, path) {
                    set_path(&mut out, path, value.clone());
                }
            }
        }
        Ok(Value::Object(out))
    } else {
        let mut out = doc.as_object().cloned().unwrap_or_default();
        for path in spec.keys() {
            remove_path(&mut out, path);
        }
        Ok(Value::Object(out))
    }
}
