//! Layered YAML configuration merging
//!
//! Later layers win. Nested mappings merge recursively; any other value
//! (scalar, sequence, null) replaces the earlier one outright.

use serde_yaml::{Mapping, Value};

use crate::error::{K3sError, K3sResult};

/// Deep-merge `overlay` into a copy of `base`.
pub fn merge(base: &Mapping, overlay: &Mapping) -> Mapping {
    let mut merged = base.clone();
    merge_into(&mut merged, overlay);
    merged
}

/// Deep-merge every layer in order, starting from an empty mapping.
pub fn merge_all<'a, I>(layers: I) -> Mapping
where
    I: IntoIterator<Item = &'a Mapping>,
{
    let mut merged = Mapping::new();
    for layer in layers {
        merge_into(&mut merged, layer);
    }
    merged
}

fn merge_into(target: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        match (target.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_into(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Parse a YAML document that must be a mapping.
///
/// Blank input and an explicit null both yield an empty mapping. Anything
/// other than a mapping is a parse error rather than a silent default.
pub fn parse_mapping(what: &str, text: &str) -> K3sResult<Mapping> {
    if text.trim().is_empty() {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_str::<Value>(text).map_err(|e| K3sError::parse(what, e))? {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(map) => Ok(map),
        other => Err(K3sError::parse(
            what,
            format!("expected a mapping, found {}", kind(&other)),
        )),
    }
}

/// Parse each document and merge them in order.
pub fn merge_documents(what: &str, documents: &[&str]) -> K3sResult<Mapping> {
    let mut merged = Mapping::new();
    for document in documents {
        merge_into(&mut merged, &parse_mapping(what, document)?);
    }
    Ok(merged)
}

/// Serialize a mapping for writing to the node. Empty maps render as "".
pub fn to_yaml(map: &Mapping) -> K3sResult<String> {
    if map.is_empty() {
        return Ok(String::new());
    }
    Ok(serde_yaml::to_string(map)?)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
