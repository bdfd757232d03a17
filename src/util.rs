//! Path-addressed helpers over `serde_json` values.

use serde_json::Value;

use crate::model::{Path, PathSegment};

/// Reads the value at `path`, if every intermediate container exists.
pub fn get_at<'v>(data: Option<&'v Value>, path: &Path) -> Option<&'v Value> {
    let mut cursor = data?;
    for segment in path.segments() {
        cursor = match (segment, cursor) {
            (PathSegment::Field(name), Value::Object(map)) => map.get(name)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(cursor)
}

/// Writes `value` at `path`, creating intermediate objects and padding
/// arrays with nulls as needed. Returns whether anything changed (deep
/// comparison at the leaf).
///
/// An empty path replaces the whole data value.
pub fn set_at(data: &mut Option<Value>, path: &Path, value: Value) -> bool {
    if path.is_empty() {
        let changed = data.as_ref() != Some(&value);
        *data = Some(value);
        return changed;
    }

    // The root container's shape is dictated by the first segment.
    let root = data.get_or_insert_with(|| empty_container(path.first()));
    align_container(root, path.first());

    let mut cursor = root;
    let last = path.len() - 1;
    for (position, segment) in path.segments().enumerate() {
        let next_shape = path.get(position + 1);
        match segment {
            PathSegment::Field(name) => {
                let map = match cursor {
                    Value::Object(map) => map,
                    _ => return false,
                };
                if position == last {
                    let changed = map.get(name) != Some(&value);
                    map.insert(name.clone(), value);
                    return changed;
                }
                let entry = map
                    .entry(name.clone())
                    .or_insert_with(|| empty_container(next_shape));
                align_container(entry, next_shape);
                cursor = entry;
            }
            PathSegment::Index(index) => {
                let items = match cursor {
                    Value::Array(items) => items,
                    _ => return false,
                };
                if items.len() <= *index {
                    items.resize(*index + 1, Value::Null);
                }
                if position == last {
                    let changed = items[*index] != value;
                    items[*index] = value;
                    return changed;
                }
                let entry = &mut items[*index];
                align_container(entry, next_shape);
                cursor = entry;
            }
        }
    }
    false
}

/// Removes the value at `path`. Object members are deleted outright;
/// array elements are nulled in place to preserve sibling positions.
/// Returns whether anything changed.
pub fn remove_at(data: &mut Option<Value>, path: &Path) -> bool {
    if path.is_empty() {
        let changed = data.is_some();
        *data = None;
        return changed;
    }
    let Some(root) = data.as_mut() else {
        return false;
    };

    let mut cursor = root;
    let last = path.len() - 1;
    for (position, segment) in path.segments().enumerate() {
        match segment {
            PathSegment::Field(name) => {
                let map = match cursor {
                    Value::Object(map) => map,
                    _ => return false,
                };
                if position == last {
                    return map.remove(name).is_some();
                }
                cursor = match map.get_mut(name) {
                    Some(next) => next,
                    None => return false,
                };
            }
            PathSegment::Index(index) => {
                let items = match cursor {
                    Value::Array(items) => items,
                    _ => return false,
                };
                if position == last {
                    if let Some(slot) = items.get_mut(*index) {
                        let changed = !slot.is_null();
                        *slot = Value::Null;
                        return changed;
                    }
                    return false;
                }
                cursor = match items.get_mut(*index) {
                    Some(next) => next,
                    None => return false,
                };
            }
        }
    }
    false
}

fn empty_container(shape: Option<&PathSegment>) -> Value {
    match shape {
        Some(PathSegment::Index(_)) => Value::Array(Vec::new()),
        _ => Value::Object(serde_json::Map::new()),
    }
}

/// Replaces `slot` with an empty container of the right shape when the
/// existing value cannot host the next path segment.
fn align_container(slot: &mut Value, shape: Option<&PathSegment>) {
    let compatible = match shape {
        Some(PathSegment::Field(_)) | None => matches!(slot, Value::Object(_)),
        Some(PathSegment::Index(_)) => matches!(slot, Value::Array(_)),
    };
    if !compatible {
        *slot = empty_container(shape);
    }
}
