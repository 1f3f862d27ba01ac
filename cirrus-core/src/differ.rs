//! Differ - Compare prior state with proposed configuration
//!
//! Produces the planned state the host shows the user: configured values
//! normalized through each field's state function, server-owned values carried
//! over from the prior state, and the list of fields whose change forces
//! replacement.

use crate::resource::{Attributes, Value};
use crate::schema::{Presence, ResourceSchema};

/// Result of a diff operation
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// No prior state -> needs creation
    Create,
    /// Fields differ -> update in place, or replace when `requires_replace`
    /// is non-empty
    Update {
        changed: Vec<String>,
        requires_replace: Vec<String>,
    },
    /// Semantically identical -> no action needed
    NoChange,
    /// No proposed configuration -> needs deletion
    Delete,
}

impl Diff {
    /// Returns whether this Diff involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Diff::NoChange)
    }

    pub fn requires_replace(&self) -> &[String] {
        match self {
            Diff::Update {
                requires_replace, ..
            } => requires_replace,
            _ => &[],
        }
    }
}

/// Planned state and the change that produces it
#[derive(Debug, Clone, PartialEq)]
pub struct PlanResult {
    pub planned_state: Option<Attributes>,
    pub diff: Diff,
}

/// Compute the planned state for one resource
pub fn diff(
    schema: &ResourceSchema,
    prior: Option<&Attributes>,
    proposed: Option<&Attributes>,
) -> PlanResult {
    let Some(proposed) = proposed else {
        return PlanResult {
            planned_state: None,
            diff: if prior.is_some() {
                Diff::Delete
            } else {
                Diff::NoChange
            },
        };
    };

    let planned = planned_attributes(schema, prior, proposed);

    let Some(prior) = prior else {
        return PlanResult {
            planned_state: Some(planned),
            diff: Diff::Create,
        };
    };

    let mut changed = Vec::new();
    let mut requires_replace = Vec::new();
    for field in schema.fields.values() {
        let old = prior.get(&field.name).unwrap_or(&Value::Null);
        let new = planned.get(&field.name).unwrap_or(&Value::Null);
        if schema.values_equivalent(&field.name, old, new) {
            continue;
        }
        changed.push(field.name.clone());
        if field.force_new {
            requires_replace.push(field.name.clone());
        }
    }

    let diff = if changed.is_empty() {
        Diff::NoChange
    } else {
        Diff::Update {
            changed,
            requires_replace,
        }
    };

    PlanResult {
        planned_state: Some(planned),
        diff,
    }
}

fn planned_attributes(
    schema: &ResourceSchema,
    prior: Option<&Attributes>,
    proposed: &Attributes,
) -> Attributes {
    let mut planned = Attributes::new();

    for field in schema.fields.values() {
        let prior_value = prior
            .and_then(|p| p.get(&field.name))
            .filter(|v| !v.is_null());

        let mut value = proposed
            .get(&field.name)
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| field.default.clone());

        if let (Some(v), Some(normalize)) = (value.as_ref(), field.state_func) {
            value = Some(normalize(v));
        }

        let value = match field.presence {
            Presence::Computed => prior_value.cloned(),
            Presence::OptionalComputed if value.is_none() => prior_value.cloned(),
            _ => match (value, prior_value) {
                // Keep the stored spelling when the change is suppressed
                (Some(v), Some(p)) if schema.values_equivalent(&field.name, p, &v) => {
                    Some(p.clone())
                }
                (v, _) => v,
            },
        };

        if let Some(v) = value {
            planned.insert(field.name.clone(), v);
        }
    }

    planned
}
