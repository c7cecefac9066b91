//! Resource documents and identities
//!
//! A `ResourceDocument` is an owned, untyped object tree (`serde_json::Value`)
//! for one managed object. The engine never mutates a caller's document: the
//! namespace and resource-version helpers return modified copies.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors building resource documents
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource document must be a mapping, got {0}")]
    NotAnObject(&'static str),

    #[error("invalid label selector '{0}'")]
    InvalidSelector(String),
}

/// Group/version/kind of a resource
///
/// An empty group denotes the core API group (`apiVersion: v1`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeId {
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Split an `apiVersion` string ("apps/v1", "v1") and pair it with a kind
    #[must_use]
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    #[must_use]
    pub fn namespace() -> Self {
        Self::new("", "v1", "Namespace")
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// A type without a kind or version cannot be addressed
    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() || self.version.is_empty()
    }

    /// Same group and kind, ignoring the served version
    pub fn same_kind(&self, other: &TypeId) -> bool {
        self.group == other.group && self.kind == other.kind
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Identity of one object: type, optional namespace, name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub type_id: TypeId,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn new(type_id: TypeId, namespace: Option<&str>, name: &str) -> Self {
        Self {
            type_id,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.type_id.kind, ns, self.name),
            None => write!(f, "{} {}", self.type_id.kind, self.name),
        }
    }
}

/// One managed object as an untyped tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ResourceDocument(Map<String, Value>);

impl TryFrom<Value> for ResourceDocument {
    type Error = ResourceError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ResourceError::NotAnObject(value_kind(&other))),
        }
    }
}

impl From<ResourceDocument> for Value {
    fn from(doc: ResourceDocument) -> Self {
        Value::Object(doc.0)
    }
}

impl ResourceDocument {
    /// Minimal document with type and name
    #[must_use]
    pub fn new(type_id: &TypeId, name: &str) -> Self {
        let mut doc = Self(Map::new());
        doc.set_type(type_id);
        doc.metadata_mut()
            .insert("name".to_string(), Value::String(name.to_string()));
        doc
    }

    pub fn from_value(value: Value) -> Result<Self, ResourceError> {
        Self::try_from(value)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Type read from `apiVersion`/`kind`; empty when either is missing
    pub fn type_id(&self) -> TypeId {
        let api_version = self.0.get("apiVersion").and_then(Value::as_str);
        let kind = self.0.get("kind").and_then(Value::as_str);
        match (api_version, kind) {
            (Some(api_version), Some(kind)) => TypeId::from_api_version(api_version, kind),
            _ => TypeId::default(),
        }
    }

    pub fn set_type(&mut self, type_id: &TypeId) {
        self.0
            .insert("apiVersion".to_string(), Value::String(type_id.api_version()));
        self.0
            .insert("kind".to_string(), Value::String(type_id.kind.clone()));
    }

    /// Fill in `apiVersion`/`kind` if the server omitted them (list items)
    pub fn ensure_type(&mut self, type_id: &TypeId) {
        if self.type_id().is_empty() {
            self.set_type(type_id);
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name").filter(|n| !n.is_empty())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace").filter(|n| !n.is_empty())
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata_str("resourceVersion")
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata()
            .and_then(|m| m.get("labels"))
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Identity of this object, `None` without a name
    pub fn key(&self) -> Option<ObjectKey> {
        self.name()
            .map(|name| ObjectKey::new(self.type_id(), self.namespace(), name))
    }

    /// Human readable id for messages ("Kind ns/name")
    pub fn id(&self) -> String {
        match self.key() {
            Some(key) => key.to_string(),
            None => format!("{} (unnamed)", self.type_id().kind),
        }
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    /// Copy of this document placed in `namespace`
    #[must_use]
    pub fn with_namespace(&self, namespace: &str) -> Self {
        let mut copy = self.clone();
        copy.set_namespace(namespace);
        copy
    }

    pub fn set_resource_version(&mut self, version: Option<&str>) {
        match version {
            Some(v) => {
                self.metadata_mut()
                    .insert("resourceVersion".to_string(), Value::String(v.to_string()));
            }
            None => {
                if let Some(Value::Object(meta)) = self.0.get_mut("metadata") {
                    meta.remove("resourceVersion");
                }
            }
        }
    }

    /// Copy with the concurrency fence stripped, i.e. content only
    #[must_use]
    pub fn without_resource_version(&self) -> Self {
        let mut copy = self.clone();
        copy.set_resource_version(None);
        copy
    }

    fn metadata(&self) -> Option<&Map<String, Value>> {
        self.0.get("metadata").and_then(Value::as_object)
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.get(field))
            .and_then(Value::as_str)
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("metadata was just normalized to an object"),
        }
    }
}

/// Short name of a JSON value's shape
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Equality-based label selector ("app=web,tier!=cache")
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    value: String,
    equals: bool,
}

impl LabelSelector {
    /// Selector that matches everything
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring every given label
    #[must_use]
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            requirements: labels
                .iter()
                .map(|(k, v)| Requirement {
                    key: k.clone(),
                    value: v.clone(),
                    equals: true,
                })
                .collect(),
        }
    }

    /// Parse `key=value`, `key==value` and `key!=value` terms joined by commas
    pub fn parse(selector: &str) -> Result<Self, ResourceError> {
        let mut requirements = Vec::new();
        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value, equals) = if let Some((k, v)) = term.split_once("!=") {
                (k, v, false)
            } else if let Some((k, v)) = term.split_once("==") {
                (k, v, true)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, v, true)
            } else {
                return Err(ResourceError::InvalidSelector(selector.to_string()));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ResourceError::InvalidSelector(selector.to_string()));
            }
            requirements.push(Requirement {
                key: key.to_string(),
                value: value.trim().to_string(),
                equals,
            });
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| {
            let actual = labels.get(&r.key);
            if r.equals {
                actual == Some(&r.value)
            } else {
                actual != Some(&r.value)
            }
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|r| {
                let op = if r.equals { "=" } else { "!=" };
                format!("{}{}{}", r.key, op, r.value)
            })
            .collect();
        write!(f, "{}", terms.join(","))
    }
}
