//! Import ID decoding
//!
//! External IDs follow the grammar `part ('/' part){0..2}`. Each resource
//! declares which fields the parts map to; the subsequent Read fills in
//! everything else.

use crate::resource::{ResourceData, Value};

/// Maximum number of `/`-separated parts in an import ID
pub const MAX_PARTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    #[error("invalid import ID '{id}', expected format {expected}")]
    Malformed { id: String, expected: String },

    #[error("import is not supported for {0}")]
    Unsupported(String),
}

/// Accepted layouts for one resource's import ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFormat {
    layouts: Vec<Vec<String>>,
}

impl ImportFormat {
    /// Layout where every part names the field it is written to.
    /// The field `id` becomes the resource identifier.
    pub fn new(fields: &[&str]) -> Self {
        Self {
            layouts: vec![layout(fields)],
        }
    }

    /// Plain `<id>`
    pub fn id_only() -> Self {
        Self::new(&["id"])
    }

    /// Accept an alternative layout (with a different part count)
    pub fn or(mut self, fields: &[&str]) -> Self {
        self.layouts.push(layout(fields));
        self
    }

    /// Human-readable template, e.g. `<instance_id>/<route_table_id>/<id>`
    pub fn template(&self) -> String {
        self.layouts
            .iter()
            .map(|fields| {
                fields
                    .iter()
                    .map(|f| format!("<{}>", f))
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .collect::<Vec<_>>()
            .join(" or ")
    }

    /// Split `external_id` into `(field, value)` pairs
    pub fn parse(&self, external_id: &str) -> Result<Vec<(String, String)>, ImportError> {
        let malformed = || ImportError::Malformed {
            id: external_id.to_string(),
            expected: self.template(),
        };

        let parts: Vec<&str> = external_id.split('/').collect();
        if parts.len() > MAX_PARTS || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(malformed());
        }

        let fields = self
            .layouts
            .iter()
            .find(|l| l.len() == parts.len())
            .ok_or_else(malformed)?;

        Ok(fields
            .iter()
            .cloned()
            .zip(parts.into_iter().map(str::to_string))
            .collect())
    }

    /// Hydrate the minimum fields needed before a Read
    pub fn apply(&self, external_id: &str, data: &mut ResourceData) -> Result<(), ImportError> {
        for (field, value) in self.parse(external_id)? {
            if field == "id" {
                data.set_id(value);
            } else {
                data.set(field, Value::String(value));
            }
        }
        Ok(())
    }
}

fn layout(fields: &[&str]) -> Vec<String> {
    debug_assert!(!fields.is_empty() && fields.len() <= MAX_PARTS);
    fields.iter().map(|f| f.to_string()).collect()
}
