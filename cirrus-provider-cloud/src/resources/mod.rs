//! Resource definitions
//!
//! Each module publishes one [`ResourceDefinition`]: the schema, the
//! per-operation timeouts, the import format and the handler wiring the
//! engine's building blocks to the service API.

pub mod dcs_instance;
pub mod drs_job;
pub mod elb_certificate;
pub mod elb_listener;
pub mod er_association;
pub mod lb_l7rule;

pub(crate) mod lb;

use cirrus_core::classify::ServiceRules;
use cirrus_core::error::{ApiError, ProviderError, ProviderResult, Verdict};
use cirrus_core::provider::ResourceDefinition;
use cirrus_core::resource::{ResourceData, Value};
use cirrus_core::schema::{FieldDescriptor, FieldType};
use cirrus_core::waiter::Observation;

/// Returns all resource types supported by this provider
pub fn definitions() -> Vec<ResourceDefinition> {
    vec![
        dcs_instance::definition(),
        drs_job::definition(),
        elb_certificate::definition(),
        elb_listener::definition(),
        er_association::definition(),
        lb_l7rule::definition(),
    ]
}

/// Optional per-resource region override
pub(crate) fn region_field() -> FieldDescriptor {
    FieldDescriptor::new("region", FieldType::String)
        .optional_computed()
        .force_new()
        .with_description("Region of the resource; defaults to the provider region")
}

/// Turn a GET into a waiter observation. `status_of` picks the status out of
/// the body; a 404 (or an absent code) is an absent observation.
pub(crate) fn observe<F>(
    rules: &ServiceRules,
    result: Result<serde_json::Value, ApiError>,
    status_of: F,
) -> ProviderResult<Observation<serde_json::Value>>
where
    F: FnOnce(&serde_json::Value) -> String,
{
    match result {
        Ok(body) => {
            let status = status_of(&body);
            Ok(Observation::found(body, status))
        }
        Err(e) => match rules.classify(&e) {
            Verdict::Absent => Ok(Observation::Absent),
            verdict => Err(ProviderError::from_verdict(&verdict, e)),
        },
    }
}

/// Classify a failed call with a service's table
pub(crate) fn api_error(rules: &ServiceRules, err: ApiError) -> ProviderError {
    ProviderError::from_verdict(&rules.classify(&err), err)
}

pub(crate) fn str_at(body: &serde_json::Value, pointer: &str) -> String {
    body.pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Copy a JSON member into a string attribute, skipping missing members
pub(crate) fn set_str(
    data: &mut ResourceData,
    name: &str,
    body: &serde_json::Value,
    pointer: &str,
) {
    if let Some(s) = body.pointer(pointer).and_then(|v| v.as_str()) {
        data.set(name, s);
    }
}

pub(crate) fn strings_at(body: &serde_json::Value, pointer: &str) -> Vec<String> {
    body.pointer(pointer)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Attribute as JSON, for request bodies
pub(crate) fn json_of(data: &ResourceData, name: &str) -> serde_json::Value {
    data.get(name).map(Value::to_json).unwrap_or(serde_json::Value::Null)
}

/// Drop nulls and empty strings from a request body
pub(crate) fn compact(body: serde_json::Value) -> serde_json::Value {
    match body {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null() && v.as_str() != Some(""))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_definition_has_a_unique_name_and_id() {
        let defs = definitions();
        let mut names: Vec<&str> = defs.iter().map(|d| d.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), defs.len());
        assert!(defs.iter().all(|d| d.schema.get("id").is_some()));
    }

    #[test]
    fn observations_from_responses() {
        let rules = ServiceRules::new("x").with_absent_codes(&["X.404"]);
        let found = observe(&rules, Ok(json!({"status": "RUNNING"})), |b| str_at(b, "/status")).unwrap();
        assert!(matches!(found, Observation::Found { ref status, .. } if status == "RUNNING"));

        let gone = observe(&rules, Err(ApiError::http(400, r#"{"error_code":"X.404"}"#)), |_| String::new()).unwrap();
        assert_eq!(gone, Observation::Absent);

        let busy = observe(&rules, Err(ApiError::http(429, "")), |_| String::new()).unwrap_err();
        assert_eq!(busy.kind, cirrus_core::error::ErrorKind::Retryable);
    }

    #[test]
    fn compact_drops_empty_members() {
        assert_eq!(
            compact(json!({"a": null, "b": "", "c": "x", "d": 0})),
            json!({"c": "x", "d": 0})
        );
    }
}
