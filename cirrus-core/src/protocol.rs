//! Plugin protocol messages
//!
//! One JSON object per line in each direction. Requests carry an `id`, a
//! `method` and method-specific `params`; responses echo the `id` with a
//! `result`, an `error`, or both (a failed apply that still produced state).

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ProviderError};
use crate::resource::{ResourceId, State};
use crate::schema::ResourceSchema;
use crate::timeouts::Operation;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("invalid params for {method}: {source}")]
    InvalidParams {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw request line
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Frame {
    /// Parse one line. Failure here is a protocol violation.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Resource state as exchanged with the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl WireState {
    pub fn from_state(state: &State) -> Self {
        Self {
            identifier: state.identifier.clone(),
            attributes: ResourceSchema::encode(&state.attributes),
        }
    }

    pub fn into_state(self, id: ResourceId, schema: &ResourceSchema) -> State {
        let attributes = schema.decode(&self.attributes);
        let mut state = State::existing(id, attributes);
        state.identifier = self.identifier;
        state
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigParams {
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateResourceParams {
    pub type_name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanParams {
    pub type_name: String,
    #[serde(default)]
    pub prior_state: Option<WireState>,
    #[serde(default)]
    pub proposed: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyParams {
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub prior_state: Option<WireState>,
    #[serde(default)]
    pub planned_state: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadParams {
    pub type_name: String,
    pub name: String,
    pub state: WireState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportParams {
    pub type_name: String,
    #[serde(default = "default_import_name")]
    pub name: String,
    pub id: String,
}

fn default_import_name() -> String {
    "imported".to_string()
}

/// A decoded request
#[derive(Debug, Clone)]
pub enum Call {
    GetSchema,
    ValidateConfig(ConfigParams),
    Configure(ConfigParams),
    ValidateResourceConfig(ValidateResourceParams),
    PlanResourceChange(PlanParams),
    ApplyResourceChange(ApplyParams),
    ReadResource(ReadParams),
    ImportResourceState(ImportParams),
    Stop,
}

impl Call {
    pub fn decode(method: &str, params: serde_json::Value) -> Result<Self, ProtocolError> {
        fn p<T: serde::de::DeserializeOwned>(
            method: &str,
            params: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            let params = if params.is_null() {
                serde_json::Value::Object(Default::default())
            } else {
                params
            };
            serde_json::from_value(params).map_err(|source| ProtocolError::InvalidParams {
                method: method.to_string(),
                source,
            })
        }

        Ok(match method {
            "GetSchema" => Call::GetSchema,
            "ValidateConfig" => Call::ValidateConfig(p(method, params)?),
            "Configure" => Call::Configure(p(method, params)?),
            "ValidateResourceConfig" => Call::ValidateResourceConfig(p(method, params)?),
            "PlanResourceChange" => Call::PlanResourceChange(p(method, params)?),
            "ApplyResourceChange" => Call::ApplyResourceChange(p(method, params)?),
            "ReadResource" => Call::ReadResource(p(method, params)?),
            "ImportResourceState" => Call::ImportResourceState(p(method, params)?),
            "Stop" => Call::Stop,
            other => return Err(ProtocolError::UnknownMethod(other.to_string())),
        })
    }
}

/// Error as reported to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub message: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timeout: bool,
}

impl From<&ProviderError> for Diagnostic {
    fn from(err: &ProviderError) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind,
            resource: err.resource_id.as_ref().map(ToString::to_string),
            operation: err.operation,
            code: err.code.clone(),
            timeout: err.is_timeout(),
        }
    }
}

impl From<&ProtocolError> for Diagnostic {
    fn from(err: &ProtocolError) -> Self {
        Self {
            message: err.to_string(),
            kind: ErrorKind::Validation,
            resource: None,
            operation: None,
            code: None,
            timeout: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Diagnostic>,
}

impl Response {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: Diagnostic) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn with_error(mut self, error: Diagnostic) -> Self {
        self.error = Some(error);
        self
    }
}
