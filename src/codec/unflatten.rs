use std::collections::{HashMap, HashSet};

use num_bigint::BigInt;
use serde_json::Value as Json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{
    Revivers, SENTINEL_NAN, SENTINEL_NEG_INFINITY, SENTINEL_NEG_ZERO, SENTINEL_POS_INFINITY,
    TAG_BIGINT, TAG_DATE, TAG_MAP, TAG_REGEXP, TAG_SET,
};
use crate::error::DecodeError;
use crate::value::{Array, Map, Object, Regex, Set, Value};

/// Reconstruct a value graph from its node-array form (or a bare sentinel
/// scalar).
pub fn unflatten(doc: &Json, revivers: &Revivers) -> Result<Value, DecodeError> {
    match doc {
        Json::Number(n) => match n.as_i64() {
            Some(code) if code < 0 => sentinel_value(code),
            _ => Err(DecodeError::BadNode(
                "top-level scalar must be a sentinel code".to_string(),
            )),
        },
        Json::Array(nodes) if !nodes.is_empty() => {
            let mut unflattener = Unflattener {
                nodes,
                revivers,
                done: HashMap::new(),
                in_progress: HashSet::new(),
            };
            unflattener.resolve(0)
        }
        _ => Err(DecodeError::BadNode(
            "top-level form must be a node array or sentinel scalar".to_string(),
        )),
    }
}

struct Unflattener<'a> {
    nodes: &'a [Json],
    revivers: &'a Revivers,
    done: HashMap<usize, Value>,
    in_progress: HashSet<usize>,
}

impl<'a> Unflattener<'a> {
    fn resolve(&mut self, index: i64) -> Result<Value, DecodeError> {
        if index < 0 {
            return sentinel_value(index);
        }
        let index = index as usize;
        if let Some(value) = self.done.get(&index) {
            return Ok(value.clone());
        }
        let node = self
            .nodes
            .get(index)
            .ok_or_else(|| DecodeError::BadNode(format!("node index {index} out of bounds")))?;
        if !self.in_progress.insert(index) {
            return Err(DecodeError::BadNode(format!(
                "cycle through non-container node {index}"
            )));
        }

        let value = match node {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().ok_or_else(|| {
                    DecodeError::BadNode(format!("unrepresentable number at node {index}"))
                })?),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Object(map) => {
                let object = Object::new();
                self.done.insert(index, Value::Object(object.clone()));
                for (key, child) in map {
                    object.insert(key.clone(), self.resolve(child_index(child)?)?);
                }
                self.in_progress.remove(&index);
                return Ok(Value::Object(object));
            }
            Json::Array(items) => match items.first() {
                Some(Json::String(tag)) => self.resolve_tagged(index, tag, &items[1..])?,
                _ => {
                    let array = Array::new();
                    self.done.insert(index, Value::Array(array.clone()));
                    for child in items {
                        array.push(self.resolve(child_index(child)?)?);
                    }
                    self.in_progress.remove(&index);
                    return Ok(Value::Array(array));
                }
            },
        };
        self.in_progress.remove(&index);
        self.done.insert(index, value.clone());
        Ok(value)
    }

    fn resolve_tagged(
        &mut self,
        index: usize,
        tag: &str,
        children: &'a [Json],
    ) -> Result<Value, DecodeError> {
        match tag {
            TAG_DATE => {
                let iso = self.resolve_string(tag, single(tag, children)?)?;
                let date = OffsetDateTime::parse(&iso, &Rfc3339)
                    .map_err(|cause| DecodeError::BadNode(format!("invalid date: {cause}")))?;
                Ok(Value::Date(date))
            }
            TAG_BIGINT => {
                let digits = self.resolve_string(tag, single(tag, children)?)?;
                let int = digits
                    .parse::<BigInt>()
                    .map_err(|cause| DecodeError::BadNode(format!("invalid bigint: {cause}")))?;
                Ok(Value::BigInt(int))
            }
            TAG_REGEXP => {
                if children.len() != 2 {
                    return Err(DecodeError::BadNode(format!(
                        "RegExp node {index} must carry source and flags"
                    )));
                }
                let source = self.resolve_string(tag, child_index(&children[0])?)?;
                let flags = self.resolve_string(tag, child_index(&children[1])?)?;
                Ok(Value::Regex(Regex { source, flags }))
            }
            TAG_MAP => {
                if children.len() % 2 != 0 {
                    return Err(DecodeError::BadNode(format!(
                        "Map node {index} has a dangling key"
                    )));
                }
                let map = Map::new();
                self.done.insert(index, Value::Map(map.clone()));
                for pair in children.chunks_exact(2) {
                    let key = self.resolve(child_index(&pair[0])?)?;
                    let value = self.resolve(child_index(&pair[1])?)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            TAG_SET => {
                let set = Set::new();
                self.done.insert(index, Value::Set(set.clone()));
                for child in children {
                    set.insert(self.resolve(child_index(child)?)?);
                }
                Ok(Value::Set(set))
            }
            _ => {
                let payload = self.resolve(single(tag, children)?)?;
                let reviver = self
                    .revivers
                    .get(tag)
                    .ok_or_else(|| DecodeError::UnknownTag(tag.to_string()))?;
                reviver(payload)
            }
        }
    }

    fn resolve_string(&mut self, tag: &str, index: i64) -> Result<String, DecodeError> {
        match self.resolve(index)? {
            Value::String(s) => Ok(s),
            other => Err(DecodeError::BadNode(format!(
                "{tag} payload must be a string, found {}",
                other.kind()
            ))),
        }
    }
}

fn single(tag: &str, children: &[Json]) -> Result<i64, DecodeError> {
    match children {
        [child] => child_index(child),
        _ => Err(DecodeError::BadNode(format!(
            "{tag} node must carry exactly one payload"
        ))),
    }
}

fn child_index(child: &Json) -> Result<i64, DecodeError> {
    child
        .as_i64()
        .ok_or_else(|| DecodeError::BadNode(format!("expected a node index, found {child}")))
}

fn sentinel_value(code: i64) -> Result<Value, DecodeError> {
    match code {
        SENTINEL_NAN => Ok(Value::Float(f64::NAN)),
        SENTINEL_POS_INFINITY => Ok(Value::Float(f64::INFINITY)),
        SENTINEL_NEG_INFINITY => Ok(Value::Float(f64::NEG_INFINITY)),
        SENTINEL_NEG_ZERO => Ok(Value::Float(-0.0)),
        _ => Err(DecodeError::BadNode(format!("unknown sentinel code {code}"))),
    }
}
