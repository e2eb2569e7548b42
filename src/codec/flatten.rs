use std::collections::HashMap;

use serde_json::{json, Map as JsonMap, Number, Value as Json};
use time::format_description::well_known::Rfc3339;

use super::{
    Reducers, SENTINEL_NAN, SENTINEL_NEG_INFINITY, SENTINEL_NEG_ZERO, SENTINEL_POS_INFINITY,
    TAG_BIGINT, TAG_DATE, TAG_MAP, TAG_REGEXP, TAG_SET,
};
use crate::error::EncodeError;
use crate::value::Value;

/// Serialize a value graph into its node-array form (or a bare sentinel
/// scalar when the root itself is a sentinel primitive).
pub fn flatten(root: &Value, reducers: &Reducers) -> Result<Json, EncodeError> {
    if let Some(code) = sentinel_code(root) {
        return Ok(Json::from(code));
    }
    let mut flattener = Flattener {
        reducers,
        nodes: Vec::new(),
        seen: HashMap::new(),
    };
    flattener.index_of(root)?;
    Ok(Json::Array(flattener.nodes))
}

struct Flattener<'a> {
    reducers: &'a Reducers,
    nodes: Vec<Json>,
    // identity key of a shared referent -> its node index
    seen: HashMap<usize, usize>,
}

impl<'a> Flattener<'a> {
    /// The node index for `value`, emitting nodes as needed. Sentinel
    /// primitives resolve to their negative code point instead.
    fn index_of(&mut self, value: &Value) -> Result<i64, EncodeError> {
        if let Some(code) = sentinel_code(value) {
            return Ok(code);
        }
        if let Some(key) = identity_key(value) {
            if let Some(&index) = self.seen.get(&key) {
                return Ok(index as i64);
            }
        }

        // a sequence whose body was already taken has nothing left to
        // encode; fail before the reducers report it as merely unsupported
        match value {
            Value::Sequence(s) if s.is_consumed() => return Err(EncodeError::SourceConsumed),
            Value::Stream(s) if s.is_consumed() => return Err(EncodeError::SourceConsumed),
            _ => {}
        }

        // Reserve the node before descending so cyclic references resolve
        // to this index instead of recursing forever.
        let index = self.nodes.len();
        self.nodes.push(Json::Null);
        if let Some(key) = identity_key(value) {
            self.seen.insert(key, index);
        }

        if let Some((name, payload)) = self.reduce(value) {
            let payload_index = self.index_of(&payload)?;
            self.nodes[index] = json!([name, payload_index]);
            return Ok(index as i64);
        }

        let node = match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => json!(i),
            Value::Float(f) => Number::from_f64(*f)
                .map(Json::Number)
                .ok_or(EncodeError::Unsupported("non-finite float"))?,
            Value::String(s) => Json::String(s.clone()),
            Value::BigInt(i) => {
                let digits = self.index_of(&Value::String(i.to_string()))?;
                json!([TAG_BIGINT, digits])
            }
            Value::Date(d) => {
                let iso = d
                    .format(&Rfc3339)
                    .map_err(|cause| EncodeError::Time(cause.to_string()))?;
                let iso = self.index_of(&Value::String(iso))?;
                json!([TAG_DATE, iso])
            }
            Value::Regex(r) => {
                let source = self.index_of(&Value::String(r.source.clone()))?;
                let flags = self.index_of(&Value::String(r.flags.clone()))?;
                json!([TAG_REGEXP, source, flags])
            }
            Value::Array(array) => {
                let mut items = Vec::with_capacity(array.len());
                for child in array.to_vec() {
                    items.push(Json::from(self.index_of(&child)?));
                }
                Json::Array(items)
            }
            Value::Object(object) => {
                let mut map = JsonMap::new();
                for (key, child) in object.entries() {
                    map.insert(key, Json::from(self.index_of(&child)?));
                }
                Json::Object(map)
            }
            Value::Map(m) => {
                let mut items = vec![json!(TAG_MAP)];
                for (key, child) in m.entries() {
                    items.push(Json::from(self.index_of(&key)?));
                    items.push(Json::from(self.index_of(&child)?));
                }
                Json::Array(items)
            }
            Value::Set(s) => {
                let mut items = vec![json!(TAG_SET)];
                for child in s.to_vec() {
                    items.push(Json::from(self.index_of(&child)?));
                }
                Json::Array(items)
            }
            Value::Opaque(_)
            | Value::Promise(_)
            | Value::Sequence(_)
            | Value::Stream(_) => return Err(EncodeError::Unsupported(value.kind())),
        };
        self.nodes[index] = node;
        Ok(index as i64)
    }

    fn reduce(&self, value: &Value) -> Option<(String, Value)> {
        for (name, reducer) in self.reducers.iter() {
            if let Some(payload) = reducer(value) {
                return Some((name.to_string(), payload));
            }
        }
        None
    }
}

fn sentinel_code(value: &Value) -> Option<i64> {
    match value {
        Value::Float(f) if f.is_nan() => Some(SENTINEL_NAN),
        Value::Float(f) if *f == f64::INFINITY => Some(SENTINEL_POS_INFINITY),
        Value::Float(f) if *f == f64::NEG_INFINITY => Some(SENTINEL_NEG_INFINITY),
        Value::Float(f) if *f == 0.0 && f.is_sign_negative() => Some(SENTINEL_NEG_ZERO),
        _ => None,
    }
}

fn identity_key(value: &Value) -> Option<usize> {
    match value {
        Value::Array(a) => Some(a.key()),
        Value::Object(o) => Some(o.key()),
        Value::Map(m) => Some(m.key()),
        Value::Set(s) => Some(s.key()),
        Value::Opaque(o) => Some(o.key()),
        Value::Promise(p) => Some(p.key()),
        Value::Sequence(s) => Some(s.key()),
        Value::Stream(s) => Some(s.key()),
        _ => None,
    }
}
