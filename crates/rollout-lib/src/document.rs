//! Kind-agnostic access to workload documents
//!
//! Workloads (Deployment, StatefulSet, ...) are handled as generic JSON
//! trees so that any kind with a pod template can be managed. Navigation is
//! checked: a missing path is `Ok(None)`, a path that runs through a node of
//! the wrong type is a [`ShapeError`]. Nothing in here panics on malformed
//! input.

use crate::error::ShapeError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Resource field a container quantity is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSlot {
    Requests,
    Limits,
}

impl ResourceSlot {
    fn key(self) -> &'static str {
        match self {
            ResourceSlot::Requests => "requests",
            ResourceSlot::Limits => "limits",
        }
    }
}

/// Read-only view of one container of a pod template.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerView {
    pub name: String,
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn shape(path: &[&str], depth: usize, expected: &'static str, found: &Value) -> ShapeError {
    ShapeError {
        path: path[..depth].join("."),
        expected,
        found: type_name(found),
    }
}

/// Walk `path` from `doc`. Map nodes are indexed by key, list nodes by a
/// decimal index.
pub fn get_path<'a>(doc: &'a Value, path: &[&str]) -> Result<Option<&'a Value>, ShapeError> {
    let mut current = doc;
    for (depth, segment) in path.iter().enumerate() {
        current = match current {
            Value::Object(map) => match map.get(*segment) {
                Some(next) => next,
                None => return Ok(None),
            },
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| shape(path, depth + 1, "list index", current))?;
                match items.get(index) {
                    Some(next) => next,
                    None => return Ok(None),
                }
            }
            // An explicit null behaves like an absent field.
            Value::Null => return Ok(None),
            other => return Err(shape(path, depth, "map or list", other)),
        };
    }
    Ok(Some(current))
}

pub fn get_str<'a>(doc: &'a Value, path: &[&str]) -> Result<Option<&'a str>, ShapeError> {
    match get_path(doc, path)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(shape(path, path.len(), "string", other)),
    }
}

pub fn get_i64(doc: &Value, path: &[&str]) -> Result<Option<i64>, ShapeError> {
    match get_path(doc, path)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| shape(path, path.len(), "integer", &Value::Number(n.clone()))),
        Some(other) => Err(shape(path, path.len(), "integer", other)),
    }
}

/// A map of string values; absent maps read as empty.
pub fn get_string_map(doc: &Value, path: &[&str]) -> Result<BTreeMap<String, String>, ShapeError> {
    match get_path(doc, path)? {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                other => Err(shape(path, path.len(), "string value", other)),
            })
            .collect(),
        Some(other) => Err(shape(path, path.len(), "map", other)),
    }
}

/// Return the map at `path`, creating empty maps along the way.
pub fn ensure_map<'a>(
    doc: &'a mut Value,
    path: &[&str],
) -> Result<&'a mut Map<String, Value>, ShapeError> {
    let mut current = doc;
    for (depth, segment) in path.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let found = type_name(current);
        let map = current.as_object_mut().ok_or(ShapeError {
            path: path[..depth].join("."),
            expected: "map",
            found,
        })?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    let found = type_name(current);
    current.as_object_mut().ok_or(ShapeError {
        path: path.join("."),
        expected: "map",
        found,
    })
}

const CONTAINERS_PATH: [&str; 4] = ["spec", "template", "spec", "containers"];

/// Containers of the workload's pod template, in declaration order.
pub fn get_containers(doc: &Value) -> Result<Vec<ContainerView>, ShapeError> {
    let items = match get_path(doc, &CONTAINERS_PATH)? {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => return Err(shape(&CONTAINERS_PATH, CONTAINERS_PATH.len(), "list", other)),
    };

    items
        .iter()
        .map(|container| {
            let name = get_str(container, &["name"])?.unwrap_or_default().to_string();
            Ok(ContainerView {
                name,
                requests: quantity_map(container, &["resources", "requests"])?,
                limits: quantity_map(container, &["resources", "limits"])?,
            })
        })
        .collect()
}

/// Quantities may be serialized as strings or bare numbers.
fn quantity_map(container: &Value, path: &[&str]) -> Result<BTreeMap<String, String>, ShapeError> {
    match get_path(container, path)? {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                Value::Number(n) => Ok((k.clone(), n.to_string())),
                other => Err(shape(path, path.len(), "quantity", other)),
            })
            .collect(),
        Some(other) => Err(shape(path, path.len(), "map", other)),
    }
}

/// Set `resources.<slot>.<resource>` of the named container.
///
/// Returns `Ok(false)` when no container carries that name.
pub fn set_container_resource(
    doc: &mut Value,
    container_name: &str,
    slot: ResourceSlot,
    resource: &str,
    quantity: &str,
) -> Result<bool, ShapeError> {
    let containers = match ensure_list(doc, &CONTAINERS_PATH)? {
        Some(items) => items,
        None => return Ok(false),
    };

    for container in containers.iter_mut() {
        if get_str(container, &["name"])? != Some(container_name) {
            continue;
        }
        let resources = ensure_map(container, &["resources", slot.key()])?;
        resources.insert(resource.to_string(), Value::String(quantity.to_string()));
        return Ok(true);
    }
    Ok(false)
}

fn ensure_list<'a>(doc: &'a mut Value, path: &[&str]) -> Result<Option<&'a mut Vec<Value>>, ShapeError> {
    let (last, parents) = match path.split_last() {
        Some(split) => split,
        None => return Ok(None),
    };
    if get_path(doc, path)?.is_none() {
        return Ok(None);
    }
    let parent = ensure_map(doc, parents)?;
    match parent.get_mut(*last) {
        Some(Value::Array(items)) => Ok(Some(items)),
        None | Some(Value::Null) => Ok(None),
        Some(other) => Err(ShapeError {
            path: path.join("."),
            expected: "list",
            found: type_name(other),
        }),
    }
}

/// Capability interface over a workload document.
///
/// Keeps the kind-specific layout (where containers, replicas and the pod
/// template live) out of the decision engine.
pub trait PodTemplateWorkload {
    fn containers(&self) -> Result<Vec<ContainerView>, ShapeError>;
    fn replicas(&self) -> Result<Option<i64>, ShapeError>;
    fn set_replicas(&mut self, replicas: i64) -> Result<(), ShapeError>;
    fn pod_template_annotations(&self) -> Result<BTreeMap<String, String>, ShapeError>;
    fn selector_labels(&self) -> Result<BTreeMap<String, String>, ShapeError>;
}

/// A workload fetched from the store, kept as its raw document.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    doc: Value,
}

impl Workload {
    pub fn new(doc: Value) -> Self {
        Self { doc }
    }

    pub fn document(&self) -> &Value {
        &self.doc
    }

    pub fn into_document(self) -> Value {
        self.doc
    }

    pub fn name(&self) -> Result<&str, ShapeError> {
        self.required_str(&["metadata", "name"])
    }

    pub fn namespace(&self) -> Result<&str, ShapeError> {
        Ok(get_str(&self.doc, &["metadata", "namespace"])?.unwrap_or("default"))
    }

    pub fn api_version(&self) -> Result<&str, ShapeError> {
        self.required_str(&["apiVersion"])
    }

    pub fn kind(&self) -> Result<&str, ShapeError> {
        self.required_str(&["kind"])
    }

    fn required_str(&self, path: &[&str]) -> Result<&str, ShapeError> {
        get_str(&self.doc, path)?.ok_or(ShapeError {
            path: path.join("."),
            expected: "string",
            found: "nothing",
        })
    }
}

impl PodTemplateWorkload for Workload {
    fn containers(&self) -> Result<Vec<ContainerView>, ShapeError> {
        get_containers(&self.doc)
    }

    fn replicas(&self) -> Result<Option<i64>, ShapeError> {
        get_i64(&self.doc, &["spec", "replicas"])
    }

    fn set_replicas(&mut self, replicas: i64) -> Result<(), ShapeError> {
        ensure_map(&mut self.doc, &["spec"])?.insert("replicas".into(), Value::from(replicas));
        Ok(())
    }

    fn pod_template_annotations(&self) -> Result<BTreeMap<String, String>, ShapeError> {
        get_string_map(&self.doc, &["spec", "template", "metadata", "annotations"])
    }

    fn selector_labels(&self) -> Result<BTreeMap<String, String>, ShapeError> {
        get_string_map(&self.doc, &["spec", "selector", "matchLabels"])
    }
}
