//! Schema - Field descriptors for resource types
//!
//! Every resource type declares a schema mapping field names to descriptors.
//! The engine uses descriptors, never the values themselves, to decide how a
//! field takes part in validation, planning and update decomposition.

use std::collections::BTreeMap;
use std::fmt;

use crate::resource::{Attributes, Value};

/// Local pre-flight check for a configured value
pub type ValidateFn = fn(&Value) -> Result<(), String>;
/// Declares two byte-different values semantically equal
pub type DiffSuppressFn = fn(&Value, &Value) -> bool;
/// Normalizes a configured value before it is stored
pub type StateFn = fn(&Value) -> Value;

/// Attribute type
#[derive(Debug, Clone)]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// String restricted to a list of allowed values
    Enum(Vec<String>),
    /// Custom type (with validation function)
    Custom {
        name: String,
        base: Box<FieldType>,
        validate: ValidateFn,
    },
    List(Box<FieldType>),
    Set(Box<FieldType>),
    Map(Box<FieldType>),
    /// Nested block
    Block(Vec<FieldDescriptor>),
}

impl FieldType {
    pub fn list_of(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    pub fn set_of(inner: FieldType) -> Self {
        FieldType::Set(Box::new(inner))
    }

    pub fn map_of(inner: FieldType) -> Self {
        FieldType::Map(Box::new(inner))
    }

    /// Check if a value conforms to this type. Null is accepted everywhere;
    /// presence is checked by the schema.
    pub fn validate(&self, value: &Value) -> Result<(), TypeError> {
        match (self, value) {
            (_, Value::Null) => Ok(()),
            (FieldType::String, Value::String(_)) => Ok(()),
            (FieldType::Int, Value::Int(_)) => Ok(()),
            (FieldType::Float, Value::Float(_) | Value::Int(_)) => Ok(()),
            (FieldType::Bool, Value::Bool(_)) => Ok(()),

            (FieldType::Enum(variants), Value::String(s)) => {
                if variants.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(TypeError::InvalidEnumVariant {
                        value: s.clone(),
                        expected: variants.clone(),
                    })
                }
            }

            (FieldType::Custom { validate, base, .. }, v) => {
                base.validate(v)?;
                validate(v).map_err(|message| TypeError::ValidationFailed { message })
            }

            (FieldType::List(inner), Value::List(items))
            | (FieldType::Set(inner), Value::Set(items) | Value::List(items)) => {
                for (i, item) in items.iter().enumerate() {
                    inner.validate(item).map_err(|e| TypeError::ListItemError {
                        index: i,
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            (FieldType::Map(inner), Value::Map(map)) => {
                for (k, v) in map {
                    inner.validate(v).map_err(|e| TypeError::MapValueError {
                        key: k.clone(),
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            (FieldType::Block(fields), Value::Block(map) | Value::Map(map)) => {
                let errors = validate_fields(fields.iter(), map);
                match errors.into_iter().next() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }

            _ => Err(TypeError::TypeMismatch {
                expected: self.type_name(),
                got: value.type_name().to_string(),
            }),
        }
    }

    /// Decode a JSON value into a typed `Value`, producing sets and blocks
    /// where the schema says so
    pub fn decode(&self, json: &serde_json::Value) -> Value {
        match (self, json) {
            (_, serde_json::Value::Null) => Value::Null,
            (FieldType::Int, serde_json::Value::String(s)) => s
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::String(s.clone())),
            (FieldType::Bool, serde_json::Value::String(s)) => match s.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(s.clone()),
            },
            (FieldType::Float, serde_json::Value::Number(n)) => {
                Value::Float(n.as_f64().unwrap_or_default())
            }
            (FieldType::Custom { base, .. }, v) => base.decode(v),
            (FieldType::List(inner), serde_json::Value::Array(items)) => {
                Value::List(items.iter().map(|i| inner.decode(i)).collect())
            }
            (FieldType::Set(inner), serde_json::Value::Array(items)) => {
                Value::set(items.iter().map(|i| inner.decode(i)))
            }
            (FieldType::Map(inner), serde_json::Value::Object(map)) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), inner.decode(v)))
                    .collect(),
            ),
            (FieldType::Block(fields), serde_json::Value::Object(map)) => Value::Block(
                map.iter()
                    .map(|(k, v)| {
                        let decoded = fields
                            .iter()
                            .find(|f| &f.name == k)
                            .map(|f| f.field_type.decode(v))
                            .unwrap_or_else(|| Value::from_json(v));
                        (k.clone(), decoded)
                    })
                    .collect(),
            ),
            (_, v) => Value::from_json(v),
        }
    }

    fn type_name(&self) -> String {
        match self {
            FieldType::String => "String".to_string(),
            FieldType::Int => "Int".to_string(),
            FieldType::Float => "Float".to_string(),
            FieldType::Bool => "Bool".to_string(),
            FieldType::Enum(variants) => format!("Enum({})", variants.join(" | ")),
            FieldType::Custom { name, .. } => name.clone(),
            FieldType::List(inner) => format!("List<{}>", inner.type_name()),
            FieldType::Set(inner) => format!("Set<{}>", inner.type_name()),
            FieldType::Map(inner) => format!("Map<{}>", inner.type_name()),
            FieldType::Block(_) => "Block".to_string(),
        }
    }

    /// JSON description of the type for the host's schema listing
    fn describe(&self) -> serde_json::Value {
        match self {
            FieldType::Block(fields) => {
                let nested: serde_json::Map<String, serde_json::Value> = fields
                    .iter()
                    .map(|f| (f.name.clone(), f.describe()))
                    .collect();
                serde_json::json!({ "block": nested })
            }
            FieldType::List(inner) => serde_json::json!({ "list": inner.describe() }),
            FieldType::Set(inner) => serde_json::json!({ "set": inner.describe() }),
            FieldType::Map(inner) => serde_json::json!({ "map": inner.describe() }),
            FieldType::Custom { base, .. } => base.describe(),
            FieldType::Enum(_) => serde_json::json!("string"),
            other => serde_json::json!(other.type_name().to_lowercase()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Type error
#[derive(Debug, Clone, thiserror::Error)]
pub enum TypeError {
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Invalid enum variant '{value}', expected one of: {}", expected.join(", "))]
    InvalidEnumVariant {
        value: String,
        expected: Vec<String>,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Required attribute '{name}' is missing")]
    MissingRequired { name: String },

    #[error("Attribute '{name}' is computed and cannot be set")]
    ComputedNotSettable { name: String },

    #[error("Unknown attribute '{name}'")]
    UnknownAttribute { name: String },

    #[error("Attribute '{name}': {inner}")]
    AttributeError { name: String, inner: Box<TypeError> },

    #[error("List item at index {index}: {inner}")]
    ListItemError { index: usize, inner: Box<TypeError> },

    #[error("Map value for key '{key}': {inner}")]
    MapValueError { key: String, inner: Box<TypeError> },
}

/// Who supplies a field's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    /// Server-owned; never accepted as input
    Computed,
    /// User may set it; otherwise the server decides
    OptionalComputed,
}

impl Presence {
    pub fn accepts_input(self) -> bool {
        !matches!(self, Presence::Computed)
    }

    pub fn is_computed(self) -> bool {
        matches!(self, Presence::Computed | Presence::OptionalComputed)
    }
}

/// Field descriptor
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub presence: Presence,
    /// Any change requires destroy-and-recreate
    pub force_new: bool,
    /// Never logged or echoed in diagnostics
    pub sensitive: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
    pub validate: Option<ValidateFn>,
    pub diff_suppress: Option<DiffSuppressFn>,
    pub state_func: Option<StateFn>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            presence: Presence::Optional,
            force_new: false,
            sensitive: false,
            default: None,
            description: None,
            validate: None,
            diff_suppress: None,
            state_func: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.presence = Presence::Required;
        self
    }

    pub fn optional(mut self) -> Self {
        self.presence = Presence::Optional;
        self
    }

    pub fn computed(mut self) -> Self {
        self.presence = Presence::Computed;
        self
    }

    pub fn optional_computed(mut self) -> Self {
        self.presence = Presence::OptionalComputed;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn validate_with(mut self, f: ValidateFn) -> Self {
        self.validate = Some(f);
        self
    }

    pub fn suppress_diff_with(mut self, f: DiffSuppressFn) -> Self {
        self.diff_suppress = Some(f);
        self
    }

    pub fn normalize_with(mut self, f: StateFn) -> Self {
        self.state_func = Some(f);
        self
    }

    fn describe(&self) -> serde_json::Value {
        let mut out = serde_json::json!({
            "type": self.field_type.describe(),
            "required": self.presence == Presence::Required,
            "optional": matches!(self.presence, Presence::Optional | Presence::OptionalComputed),
            "computed": self.presence.is_computed(),
            "force_new": self.force_new,
            "sensitive": self.sensitive,
        });
        if let Some(desc) = &self.description {
            out["description"] = serde_json::Value::String(desc.clone());
        }
        out
    }
}

fn validate_fields<'a>(
    fields: impl Iterator<Item = &'a FieldDescriptor> + Clone,
    attributes: &BTreeMap<String, Value>,
) -> Vec<TypeError> {
    let mut errors = Vec::new();

    for field in fields.clone() {
        let value = attributes.get(&field.name).filter(|v| !v.is_null());
        match (field.presence, value) {
            (Presence::Required, None) if field.default.is_none() => {
                errors.push(TypeError::MissingRequired {
                    name: field.name.clone(),
                });
            }
            (Presence::Computed, Some(_)) => {
                errors.push(TypeError::ComputedNotSettable {
                    name: field.name.clone(),
                });
            }
            (_, Some(v)) => {
                if let Err(e) = field.field_type.validate(v) {
                    errors.push(TypeError::AttributeError {
                        name: field.name.clone(),
                        inner: Box::new(e),
                    });
                } else if let Some(check) = field.validate
                    && let Err(message) = check(v)
                {
                    errors.push(TypeError::AttributeError {
                        name: field.name.clone(),
                        inner: Box::new(TypeError::ValidationFailed { message }),
                    });
                }
            }
            _ => {}
        }
    }

    for name in attributes.keys() {
        if !fields.clone().any(|f| &f.name == name) {
            errors.push(TypeError::UnknownAttribute { name: name.clone() });
        }
    }

    errors
}

/// Resource schema
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    pub resource_type: String,
    /// Schema version, bumped when the state layout changes
    pub version: u64,
    pub fields: BTreeMap<String, FieldDescriptor>,
    pub description: Option<String>,
}

impl ResourceSchema {
    /// New schema; every resource carries a computed `id`
    pub fn new(resource_type: impl Into<String>) -> Self {
        let schema = Self {
            resource_type: resource_type.into(),
            version: 0,
            fields: BTreeMap::new(),
            description: None,
        };
        schema.field(FieldDescriptor::new("id", FieldType::String).computed())
    }

    pub fn field(mut self, descriptor: FieldDescriptor) -> Self {
        self.fields.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Adds the standard `tags` map
    pub fn with_tags(self) -> Self {
        self.field(
            FieldDescriptor::new("tags", FieldType::map_of(FieldType::String))
                .optional()
                .with_description("Key/value tags attached to the resource"),
        )
    }

    /// Adds the standard `timeouts` block (`create`, `read`, `update`, `delete`)
    pub fn with_timeouts(self) -> Self {
        let op = |name: &str| {
            FieldDescriptor::new(name, FieldType::String)
                .optional()
                .validate_with(|v| match v.as_str() {
                    Some(s) => crate::timeouts::parse_duration(s)
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    None => Err("expected duration string".to_string()),
                })
        };
        self.field(FieldDescriptor::new(
            "timeouts",
            FieldType::Block(vec![op("create"), op("read"), op("update"), op("delete")]),
        ))
    }

    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    /// Validate configured attributes
    pub fn validate(&self, attributes: &Attributes) -> Result<(), Vec<TypeError>> {
        let errors = validate_fields(self.fields.values(), attributes);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Whether two values of a field are semantically equal
    pub fn values_equivalent(&self, name: &str, old: &Value, new: &Value) -> bool {
        if old == new || (old.is_empty() && new.is_empty()) {
            return true;
        }
        match self.fields.get(name).and_then(|f| f.diff_suppress) {
            Some(suppress) => suppress(old, new),
            None => false,
        }
    }

    /// Names of fields that force replacement
    pub fn force_new_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .values()
            .filter(|f| f.force_new)
            .map(|f| f.name.as_str())
    }

    /// Decode a JSON object into typed attributes
    pub fn decode(&self, json: &serde_json::Value) -> Attributes {
        let Some(object) = json.as_object() else {
            return Attributes::new();
        };
        object
            .iter()
            .map(|(k, v)| {
                let value = match self.fields.get(k) {
                    Some(f) => f.field_type.decode(v),
                    None => Value::from_json(v),
                };
                (k.clone(), value)
            })
            .collect()
    }

    /// Encode attributes as a JSON object
    pub fn encode(attributes: &Attributes) -> serde_json::Value {
        serde_json::Value::Object(
            attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// JSON rendering with sensitive fields masked, for logs and diagnostics
    pub fn redact(&self, attributes: &Attributes) -> serde_json::Value {
        serde_json::Value::Object(
            attributes
                .iter()
                .map(|(k, v)| {
                    let sensitive = self.fields.get(k).is_some_and(|f| f.sensitive);
                    let shown = if sensitive && !v.is_null() {
                        serde_json::Value::String("(sensitive)".to_string())
                    } else {
                        v.to_json()
                    };
                    (k.clone(), shown)
                })
                .collect(),
        )
    }

    /// JSON description of every field for the host's schema listing
    pub fn describe(&self) -> serde_json::Value {
        let attributes: serde_json::Map<String, serde_json::Value> = self
            .fields
            .values()
            .map(|f| (f.name.clone(), f.describe()))
            .collect();
        serde_json::json!({
            "version": self.version,
            "description": self.description,
            "attributes": attributes,
        })
    }
}

/// Helper functions for common types
pub mod types {
    use super::*;

    /// Positive integer type
    pub fn positive_int() -> FieldType {
        FieldType::Custom {
            name: "PositiveInt".to_string(),
            base: Box::new(FieldType::Int),
            validate: |value| {
                if let Value::Int(n) = value {
                    if *n > 0 {
                        Ok(())
                    } else {
                        Err("Value must be positive".to_string())
                    }
                } else {
                    Err("Expected integer".to_string())
                }
            },
        }
    }

    /// TCP/UDP port type (1-65535)
    pub fn port() -> FieldType {
        FieldType::Custom {
            name: "Port".to_string(),
            base: Box::new(FieldType::Int),
            validate: |value| match value {
                Value::Int(n) if (1..=65535).contains(n) => Ok(()),
                Value::Int(n) => Err(format!("Port {} out of range 1-65535", n)),
                _ => Err("Expected integer".to_string()),
            },
        }
    }

    /// IPv4 address or CIDR block (e.g., "10.0.0.1" or "10.0.0.0/16")
    pub fn ip_or_cidr() -> FieldType {
        FieldType::Custom {
            name: "IpOrCidr".to_string(),
            base: Box::new(FieldType::String),
            validate: |value| {
                if let Value::String(s) = value {
                    if s.contains('/') {
                        validate_cidr(s)
                    } else {
                        validate_ipv4(s)
                    }
                } else {
                    Err("Expected string".to_string())
                }
            },
        }
    }

    pub fn string_enum(values: &[&str]) -> FieldType {
        FieldType::Enum(values.iter().map(|v| v.to_string()).collect())
    }
}

/// Diff-suppress functions shared by resources
pub mod suppress {
    use crate::resource::Value;

    /// Equal after trimming surrounding whitespace (PEM bodies, scripts)
    pub fn trimmed_equal(old: &Value, new: &Value) -> bool {
        match (old.as_str(), new.as_str()) {
            (Some(a), Some(b)) => a.trim() == b.trim(),
            _ => false,
        }
    }

    /// Equal ignoring ASCII case (protocol names, enum echoes)
    pub fn case_insensitive(old: &Value, new: &Value) -> bool {
        match (old.as_str(), new.as_str()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

/// State functions shared by resources
pub mod normalize {
    use crate::resource::Value;

    pub fn trim(value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(s.trim().to_string()),
            other => other.clone(),
        }
    }

    pub fn uppercase(value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(s.to_ascii_uppercase()),
            other => other.clone(),
        }
    }
}

/// Validate IPv4 address format
pub fn validate_ipv4(ip: &str) -> Result<(), String> {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return Err(format!("Invalid IP address '{}': expected 4 octets", ip));
    }
    for octet in &octets {
        if octet.parse::<u8>().is_err() {
            return Err(format!(
                "Invalid octet '{}' in IP address: must be 0-255",
                octet
            ));
        }
    }
    Ok(())
}

/// Validate CIDR block format (e.g., "10.0.0.0/16")
pub fn validate_cidr(cidr: &str) -> Result<(), String> {
    let Some((ip, prefix)) = cidr.split_once('/') else {
        return Err(format!("Invalid CIDR format '{}': expected IP/prefix", cidr));
    };

    validate_ipv4(ip)?;

    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        Ok(p) => Err(format!("Invalid prefix length '{}': must be 0-32", p)),
        Err(_) => Err(format!(
            "Invalid prefix length '{}': must be a number",
            prefix
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_schema() -> ResourceSchema {
        ResourceSchema::new("cache")
            .field(FieldDescriptor::new("name", FieldType::String).required())
            .field(FieldDescriptor::new("capacity", types::positive_int()).optional())
            .field(FieldDescriptor::new("status", FieldType::String).computed())
            .field(
                FieldDescriptor::new("engine", types::string_enum(&["Redis", "Memcached"]))
                    .required()
                    .force_new(),
            )
            .field(
                FieldDescriptor::new("password", FieldType::String)
                    .optional()
                    .sensitive(),
            )
            .with_tags()
            .with_timeouts()
    }

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn validate_string_type() {
        let t = FieldType::String;
        assert!(t.validate(&Value::from("hello")).is_ok());
        assert!(t.validate(&Value::Int(42)).is_err());
    }

    #[test]
    fn validate_positive_int() {
        let t = types::positive_int();
        assert!(t.validate(&Value::Int(1)).is_ok());
        assert!(t.validate(&Value::Int(0)).is_err());
        assert!(t.validate(&Value::Int(-1)).is_err());
    }

    #[test]
    fn validate_resource_schema() {
        let schema = cache_schema();
        let config = attrs(&[
            ("name", Value::from("c1")),
            ("capacity", Value::Int(2)),
            ("engine", Value::from("Redis")),
            ("tags", Value::string_map([("env", "prod")])),
        ]);
        assert!(schema.validate(&config).is_ok());
    }

    #[test]
    fn missing_required_attribute() {
        let schema = cache_schema();
        let errors = schema
            .validate(&attrs(&[("engine", Value::from("Redis"))]))
            .unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, TypeError::MissingRequired { name } if name == "name"))
        );
    }

    #[test]
    fn computed_field_rejected_as_input() {
        let schema = cache_schema();
        let errors = schema
            .validate(&attrs(&[
                ("name", Value::from("c1")),
                ("engine", Value::from("Redis")),
                ("status", Value::from("RUNNING")),
            ]))
            .unwrap_err();
        assert!(matches!(errors[0], TypeError::ComputedNotSettable { .. }));
    }

    #[test]
    fn unknown_attribute_rejected() {
        let schema = cache_schema();
        let errors = schema
            .validate(&attrs(&[
                ("name", Value::from("c1")),
                ("engine", Value::from("Redis")),
                ("colour", Value::from("blue")),
            ]))
            .unwrap_err();
        assert!(matches!(errors[0], TypeError::UnknownAttribute { .. }));
    }

    #[test]
    fn timeouts_block_validates_durations() {
        let schema = cache_schema();
        let mut block = BTreeMap::new();
        block.insert("create".to_string(), Value::from("soon"));
        let errors = schema
            .validate(&attrs(&[
                ("name", Value::from("c1")),
                ("engine", Value::from("Redis")),
                ("timeouts", Value::Block(block)),
            ]))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn diff_suppress_declares_equivalence() {
        let schema = ResourceSchema::new("cert").field(
            FieldDescriptor::new("certificate", FieldType::String)
                .required()
                .suppress_diff_with(suppress::trimmed_equal),
        );
        assert!(schema.values_equivalent(
            "certificate",
            &Value::from("PEM\n"),
            &Value::from("PEM")
        ));
        assert!(!schema.values_equivalent("certificate", &Value::from("A"), &Value::from("B")));
    }

    #[test]
    fn null_and_empty_are_equivalent() {
        let schema = cache_schema();
        assert!(schema.values_equivalent("tags", &Value::Null, &Value::Map(BTreeMap::new())));
    }

    #[test]
    fn decode_builds_sets_and_blocks() {
        let schema = ResourceSchema::new("x")
            .field(FieldDescriptor::new("ids", FieldType::set_of(FieldType::String)))
            .with_timeouts();
        let decoded = schema.decode(&serde_json::json!({
            "ids": ["b", "a"],
            "timeouts": {"create": "20m"}
        }));
        assert!(matches!(decoded["ids"], Value::Set(_)));
        assert!(matches!(decoded["timeouts"], Value::Block(_)));
    }

    #[test]
    fn redact_masks_sensitive_fields() {
        let schema = cache_schema();
        let redacted = schema.redact(&attrs(&[
            ("name", Value::from("c1")),
            ("password", Value::from("hunter2")),
        ]));
        assert_eq!(redacted["password"], "(sensitive)");
        assert_eq!(redacted["name"], "c1");
    }

    #[test]
    fn validate_cidr_format() {
        assert!(validate_cidr("10.0.0.0/16").is_ok());
        assert!(validate_cidr("0.0.0.0/0").is_ok());
        assert!(validate_cidr("10.0.0.0").is_err());
        assert!(validate_cidr("10.0.0.0/33").is_err());
        assert!(validate_cidr("10.0.0.256/16").is_err());
        assert!(validate_cidr("10.0.0/16").is_err());
    }

    #[test]
    fn ip_or_cidr_accepts_both() {
        let t = types::ip_or_cidr();
        assert!(t.validate(&Value::from("192.168.1.10")).is_ok());
        assert!(t.validate(&Value::from("192.168.1.0/24")).is_ok());
        assert!(t.validate(&Value::from("192.168.1")).is_err());
    }
}
