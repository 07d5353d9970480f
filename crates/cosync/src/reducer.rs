//! Pure application of operations to a JSON state tree.
//!
//! The reducer never mutates its input: it clones the tree, walks the
//! operation's path and performs the mutation on the copy. Missing
//! intermediate containers are created as plain objects, so applying
//! `update "a.b" = 5` to `{}` yields `{"a": {"b": 5}}`. Numeric segments
//! index arrays when the container already is one; writing at the array's
//! length appends and writing past it pads with nulls.

use crate::error::{SyncError, SyncResult};
use crate::operation::{OpKind, Operation};
use crate::path::Path;
use serde_json::{Map, Value};

/// Apply one operation to a state tree, returning the new tree.
pub fn apply(state: &Value, op: &Operation) -> SyncResult<Value> {
    if op.path.is_empty() {
        return Err(SyncError::InvalidPath("empty path".to_string()));
    }

    let mut next = state.clone();
    match op.kind {
        OpKind::Insert | OpKind::Update => {
            let value = op.value.clone().unwrap_or(Value::Null);
            set_at_path(&mut next, &op.path, value)?;
        }
        OpKind::Delete => {
            remove_at_path(&mut next, &op.path);
        }
        OpKind::Move => {
            return Err(SyncError::UnsupportedOperation(
                "move is not applied by the reducer".to_string(),
            ));
        }
    }
    Ok(next)
}

/// Set `value` at `path`, creating intermediate objects as needed.
fn set_at_path(root: &mut Value, path: &Path, value: Value) -> SyncResult<()> {
    if root.is_null() {
        *root = Value::Object(Map::new());
    }

    let segments: Vec<&str> = path.segments().collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| SyncError::InvalidPath(path.to_string()))?;

    let mut current = root;
    for segment in parents {
        current = descend_or_create(current, segment, path)?;
    }
    write_slot(current, last, value, path)
}

/// Walk one level down, materializing an empty object when the slot is
/// absent or null.
fn descend_or_create<'a>(
    container: &'a mut Value,
    segment: &str,
    path: &Path,
) -> SyncResult<&'a mut Value> {
    match container {
        Value::Object(map) => {
            let slot = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            if slot.is_object() || slot.is_array() {
                Ok(slot)
            } else {
                Err(SyncError::InvalidPath(format!(
                    "segment '{segment}' of '{path}' is not a container"
                )))
            }
        }
        Value::Array(items) => {
            let idx = parse_index(segment, path)?;
            if idx >= items.len() {
                items.resize(idx + 1, Value::Null);
            }
            let slot = &mut items[idx];
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            if slot.is_object() || slot.is_array() {
                Ok(slot)
            } else {
                Err(SyncError::InvalidPath(format!(
                    "segment '{segment}' of '{path}' is not a container"
                )))
            }
        }
        _ => Err(SyncError::InvalidPath(format!(
            "cannot descend into scalar at '{segment}' of '{path}'"
        ))),
    }
}

/// Write `value` into the terminal slot of a container.
fn write_slot(container: &mut Value, last: &str, value: Value, path: &Path) -> SyncResult<()> {
    match container {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = parse_index(last, path)?;
            if idx < items.len() {
                items[idx] = value;
            } else {
                items.resize(idx, Value::Null);
                items.push(value);
            }
            Ok(())
        }
        _ => Err(SyncError::InvalidPath(format!(
            "cannot write '{last}' of '{path}' into a scalar"
        ))),
    }
}

/// Remove the terminal path segment. Removing something that does not
/// exist is a quiet no-op.
fn remove_at_path(root: &mut Value, path: &Path) {
    let segments: Vec<&str> = path.segments().collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = root;
    for segment in parents {
        let next = match current {
            Value::Object(map) => map.get_mut(*segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get_mut(idx)),
            _ => None,
        };
        match next {
            Some(slot) => current = slot,
            None => return,
        }
    }

    match current {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Ok(idx) = last.parse::<usize>() {
                if idx < items.len() {
                    items.remove(idx);
                }
            }
        }
        _ => {}
    }
}

fn parse_index(segment: &str, path: &Path) -> SyncResult<usize> {
    segment.parse::<usize>().map_err(|_| {
        SyncError::InvalidPath(format!(
            "segment '{segment}' of '{path}' does not index an array"
        ))
    })
}
