//! Resource - Representing resources, attribute values and their state

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::schema::ResourceSchema;

/// Unique identifier for a resource as the host addresses it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource type (e.g., "dcs_instance", "elb_certificate")
    pub resource_type: String,
    /// Resource name (the host's local name for this instance)
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Attribute map, ordered so that serialized state is deterministic
pub type Attributes = BTreeMap<String, Value>;

/// Attribute value of a resource
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    /// Unordered collection; equality ignores element order
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Nested block with its own field layout
    Block(BTreeMap<String, Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => set_eq(a, b),
            (Value::Map(a), Value::Map(b)) | (Value::Block(a), Value::Block(b)) => a == b,
            _ => false,
        }
    }
}

fn set_eq(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    a.iter().all(|item| {
        match b
            .iter()
            .enumerate()
            .position(|(i, candidate)| !used[i] && candidate == item)
        {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

impl Value {
    /// Build a set, dropping duplicate elements
    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        let mut out: Vec<Value> = Vec::new();
        for item in items {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        Value::Set(out)
    }

    /// Build a list of strings
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::String(s.into())).collect())
    }

    /// Build a map of string values
    pub fn string_map<I, K, V>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Value::Map(
            items
                .into_iter()
                .map(|(k, v)| (k.into(), Value::String(v.into())))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Items of a list or set
    pub fn as_items(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Entries of a map or block
    pub fn as_entries(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) | Value::Block(m) => Some(m),
            _ => None,
        }
    }

    /// True for null, empty strings and empty collections
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::List(items) | Value::Set(items) => items.is_empty(),
            Value::Map(m) | Value::Block(m) => m.is_empty(),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Set(_) => "Set",
            Value::Map(_) => "Map",
            Value::Block(_) => "Block",
        }
    }

    /// Convert to JSON; sets are emitted sorted so output is deterministic
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Set(items) => {
                let mut encoded: Vec<serde_json::Value> = items.iter().map(Value::to_json).collect();
                encoded.sort_by_key(|v| v.to_string());
                serde_json::Value::Array(encoded)
            }
            Value::Map(m) | Value::Block(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Convert from JSON without type information (arrays become lists,
    /// objects become maps). Use `FieldType::decode` when a schema is known.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(|v| Value::from_json(&v))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

/// Current state fetched from actual infrastructure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct State {
    pub id: ResourceId,
    /// Cloud-assigned identifier (opaque, possibly a URN)
    pub identifier: Option<String>,
    pub attributes: Attributes,
    /// Whether this state exists
    pub exists: bool,
}

impl State {
    pub fn not_found(id: ResourceId) -> Self {
        Self {
            id,
            identifier: None,
            attributes: Attributes::new(),
            exists: false,
        }
    }

    pub fn existing(id: ResourceId, attributes: Attributes) -> Self {
        Self {
            id,
            identifier: None,
            attributes,
            exists: true,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }
}

/// A live resource instance handed to resource handlers.
///
/// `attributes` holds the desired (or freshly observed) values and `prior`
/// the previously applied snapshot; the difference between the two drives
/// update decomposition.
#[derive(Debug, Clone)]
pub struct ResourceData {
    address: ResourceId,
    identifier: Option<String>,
    attributes: Attributes,
    prior: Attributes,
    schema: Arc<ResourceSchema>,
}

impl ResourceData {
    pub fn new(address: ResourceId, schema: Arc<ResourceSchema>) -> Self {
        Self {
            address,
            identifier: None,
            attributes: Attributes::new(),
            prior: Attributes::new(),
            schema,
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_prior(mut self, prior: Attributes) -> Self {
        self.prior = prior;
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn address(&self) -> &ResourceId {
        &self.address
    }

    pub fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    pub fn id(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Identifier, or an empty string for resources not yet created
    pub fn id_or_empty(&self) -> &str {
        self.identifier.as_deref().unwrap_or_default()
    }

    pub fn set_id(&mut self, identifier: impl Into<String>) {
        let identifier = identifier.into();
        self.attributes
            .insert("id".to_string(), Value::String(identifier.clone()));
        self.identifier = Some(identifier);
    }

    pub fn clear_id(&mut self) {
        self.identifier = None;
        self.attributes.remove("id");
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn prior_attributes(&self) -> &Attributes {
        &self.prior
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    pub fn prior(&self, name: &str) -> Option<&Value> {
        self.prior.get(name).filter(|v| !v.is_null())
    }

    /// String attribute; empty strings are treated as unset
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_float)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// String items of a list or set attribute
    pub fn get_strings(&self, name: &str) -> Vec<String> {
        self.get(name)
            .and_then(Value::as_items)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// String entries of a map attribute
    pub fn get_string_map(&self, name: &str) -> BTreeMap<String, String> {
        string_map(self.get(name))
    }

    pub fn prior_string_map(&self, name: &str) -> BTreeMap<String, String> {
        string_map(self.prior(name))
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Whether a field differs between the prior snapshot and the
    /// desired values, honoring the field's diff-suppress function
    pub fn has_change(&self, name: &str) -> bool {
        let old = self.prior.get(name).unwrap_or(&Value::Null);
        let new = self.attributes.get(name).unwrap_or(&Value::Null);
        !self.schema.values_equivalent(name, old, new)
    }

    pub fn has_changes(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.has_change(n))
    }

    /// (old, new) pair for a field
    pub fn change(&self, name: &str) -> (Option<&Value>, Option<&Value>) {
        (self.prior(name), self.get(name))
    }

    /// Replace the desired values with freshly observed ones, keeping the
    /// previous values as the new prior snapshot
    pub fn commit_observed(&mut self, observed: Attributes) {
        self.prior = std::mem::replace(&mut self.attributes, observed);
    }

    pub fn into_state(self) -> State {
        let mut state = State::existing(self.address, self.attributes);
        state.identifier = self.identifier;
        state
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_entries)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, FieldType};

    #[test]
    fn set_equality_ignores_order() {
        let a = Value::set(vec![Value::from("a"), Value::from("b")]);
        let b = Value::set(vec![Value::from("b"), Value::from("a")]);
        assert_eq!(a, b);
        assert_ne!(a, Value::strings(["b", "a"]));
    }

    #[test]
    fn set_constructor_drops_duplicates() {
        let s = Value::set(vec![Value::from("a"), Value::from("a")]);
        assert_eq!(s.as_items().map(|i| i.len()), Some(1));
    }

    #[test]
    fn set_json_is_sorted() {
        let s = Value::set(vec![Value::from("z"), Value::from("a")]);
        assert_eq!(s.to_json(), serde_json::json!(["a", "z"]));
    }

    #[test]
    fn from_json_distinguishes_int_and_float() {
        assert_eq!(Value::from_json(&serde_json::json!(4)), Value::Int(4));
        assert!(matches!(
            Value::from_json(&serde_json::json!(0.5)),
            Value::Float(_)
        ));
    }

    #[test]
    fn resource_data_change_detection() {
        let schema = Arc::new(
            ResourceSchema::new("cache")
                .field(FieldDescriptor::new("name", FieldType::String).required())
                .field(FieldDescriptor::new("capacity", FieldType::Int).optional()),
        );
        let mut prior = Attributes::new();
        prior.insert("name".into(), Value::from("a"));
        prior.insert("capacity".into(), Value::Int(2));
        let mut desired = prior.clone();
        desired.insert("capacity".into(), Value::Int(4));

        let data = ResourceData::new(ResourceId::new("cache", "main"), schema)
            .with_prior(prior)
            .with_attributes(desired);

        assert!(data.has_change("capacity"));
        assert!(!data.has_change("name"));
        assert!(data.has_changes(&["name", "capacity"]));
        assert_eq!(
            data.change("capacity"),
            (Some(&Value::Int(2)), Some(&Value::Int(4)))
        );
    }

    #[test]
    fn set_id_mirrors_into_attributes() {
        let schema = Arc::new(ResourceSchema::new("cache"));
        let mut data = ResourceData::new(ResourceId::new("cache", "main"), schema);
        data.set_id("i-123");
        assert_eq!(data.id(), Some("i-123"));
        assert_eq!(data.get_str("id"), Some("i-123"));
        data.clear_id();
        assert_eq!(data.id(), None);
    }
}
