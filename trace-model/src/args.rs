//! Tagged union for event argument bags.
//!
//! Raw trace args arrive as arbitrary JSON. Inside the model they need two
//! things JSON values cannot give us: deterministic iteration order and
//! first-class references to object snapshots (an args field can point at
//! a snapshot lifted out of it). `ArgValue` is that union; dictionaries are
//! ordered maps and snapshot references store arena ids rather than owning
//! the snapshot.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::object::SnapshotId;

pub type ArgDict = BTreeMap<String, ArgValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ArgValue>),
    Dict(ArgDict),
    /// Reference into the owning process's snapshot arena.
    Snapshot(SnapshotId),
}

impl ArgValue {
    pub fn as_dict(&self) -> Option<&ArgDict> {
        match self {
            ArgValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut ArgDict> {
        match self {
            ArgValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&Value> for ArgValue {
    fn from(value: &Value) -> ArgValue {
        match value {
            Value::Null => ArgValue::Null,
            Value::Bool(b) => ArgValue::Bool(*b),
            Value::Number(n) => ArgValue::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => ArgValue::String(s.clone()),
            Value::Array(items) => ArgValue::Array(items.iter().map(ArgValue::from).collect()),
            Value::Object(map) => ArgValue::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), ArgValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Deep-copy a raw JSON args object into an ordered dict. Non-object
/// payloads (including the stripped-args sentinel) yield an empty dict.
pub fn dict_from_json(value: Option<&Value>) -> ArgDict {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), ArgValue::from(v)))
            .collect(),
        _ => ArgDict::new(),
    }
}

/// Merge `incoming` into `target`, last write winning. Returns the keys
/// that were already present with a different value, so the caller can
/// warn about the collision.
pub fn merge_dicts(target: &mut ArgDict, incoming: ArgDict) -> Vec<String> {
    let mut conflicts = Vec::new();
    for (key, value) in incoming {
        match target.get(&key) {
            Some(existing) if *existing != value => conflicts.push(key.clone()),
            _ => {}
        }
        target.insert(key, value);
    }
    conflicts
}

/// Merge for async begin/end args: plain concatenation except that a
/// `params` dict present on both sides is merged key-wise instead of
/// being replaced wholesale.
pub fn merge_async_dicts(target: &mut ArgDict, mut incoming: ArgDict) {
    match incoming.remove("params") {
        Some(ArgValue::Dict(new_params)) => {
            let merged = match target.remove("params") {
                Some(ArgValue::Dict(mut existing)) => {
                    for (k, v) in new_params {
                        existing.insert(k, v);
                    }
                    existing
                }
                _ => new_params,
            };
            target.insert("params".to_string(), ArgValue::Dict(merged));
        }
        Some(other) => {
            target.insert("params".to_string(), other);
        }
        None => {}
    }
    for (key, value) in incoming {
        target.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    fn json_round_trip_preserves_shape() {
        let dict = dict_from_json(Some(&json!({
            "n": 1.5,
            "s": "x",
            "b": true,
            "list": [1, "two"],
            "nested": {"k": null}
        })));
        assert_eq!(dict["n"], ArgValue::Number(1.5));
        assert_eq!(dict["s"], ArgValue::String("x".into()));
        assert_eq!(dict["b"], ArgValue::Bool(true));
        assert_eq!(
            dict["list"],
            ArgValue::Array(vec![ArgValue::Number(1.0), ArgValue::String("two".into())])
        );
        let nested = dict["nested"].as_dict().unwrap();
        assert_eq!(nested["k"], ArgValue::Null);
    }

    #[rstest]
    fn non_object_args_become_empty() {
        assert!(dict_from_json(Some(&json!("__stripped__"))).is_empty());
        assert!(dict_from_json(None).is_empty());
    }

    #[rstest]
    fn merge_reports_conflicting_keys() {
        let mut target = dict_from_json(Some(&json!({"a": 1, "b": 2})));
        let incoming = dict_from_json(Some(&json!({"b": 3, "c": 4})));
        let conflicts = merge_dicts(&mut target, incoming);
        assert_eq!(conflicts, vec!["b".to_string()]);
        assert_eq!(target["b"], ArgValue::Number(3.0));
        assert_eq!(target["c"], ArgValue::Number(4.0));
    }

    #[rstest]
    fn merge_same_value_is_not_a_conflict() {
        let mut target = dict_from_json(Some(&json!({"a": 1})));
        let conflicts = merge_dicts(&mut target, dict_from_json(Some(&json!({"a": 1}))));
        assert!(conflicts.is_empty());
    }

    #[rstest]
    fn async_merge_combines_params() {
        let mut target = dict_from_json(Some(&json!({"params": {"x": 1}, "k": "begin"})));
        let incoming = dict_from_json(Some(&json!({"params": {"y": 2}, "k": "end"})));
        merge_async_dicts(&mut target, incoming);
        let params = target["params"].as_dict().unwrap();
        assert_eq!(params["x"], ArgValue::Number(1.0));
        assert_eq!(params["y"], ArgValue::Number(2.0));
        assert_eq!(target["k"], ArgValue::String("end".into()));
    }
}
