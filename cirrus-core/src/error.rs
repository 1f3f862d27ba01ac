//! Error taxonomy shared by every layer of the engine
//!
//! Transport failures are captured as [`ApiError`], classified into a
//! [`Verdict`] by the [`crate::classify`] tables, and surfaced to the host as
//! a [`ProviderError`] that names the resource, the operation, the cloud-side
//! code and whether a timeout elapsed.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::resource::ResourceId;
use crate::timeouts::Operation;

/// A resource named by a 409 response as still referencing the target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Dependent {
    /// Kind derived from the response key (`listener_ids` -> `listener`)
    pub kind: String,
    pub id: String,
}

impl Dependent {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Outcome of classifying a failed call
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The resource no longer exists
    Absent,
    /// Temporary; retry after the given delay
    Retry(Duration),
    /// Delete refused because other resources reference this one
    DependencyConflict(Vec<Dependent>),
    /// Terminal user error
    ValidationFailed(String),
    /// Terminal unexpected error
    Internal(String),
}

/// Transport-level failure of one API call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("{method} {url} returned HTTP {status}: {body}")]
    Http {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP error without request details (handy for mocks)
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            method: String::new(),
            url: String::new(),
            status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn body_json(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Http { body, .. } => serde_json::from_str(body).ok(),
            _ => None,
        }
    }

    /// Cloud error code from the response body, if any.
    ///
    /// Accepts the flat `{"error_code": ..}` layout as well as the nested
    /// `{"error": {"code": ..}}` one used by newer API generations.
    pub fn error_code(&self) -> Option<String> {
        let body = self.body_json()?;
        let direct = body
            .get("error_code")
            .or_else(|| body.get("errCode"))
            .or_else(|| body.get("code"));
        let nested = body.get("error").and_then(|e| e.get("code"));
        direct
            .or(nested)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Human-readable message from the response body, if any
    pub fn error_message(&self) -> Option<String> {
        let body = self.body_json()?;
        body.get("error_msg")
            .or_else(|| body.get("message"))
            .or_else(|| body.get("error").and_then(|e| e.get("message")))
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

/// Coarse category of a surfaced error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Absent,
    Retryable,
    Conflict,
    Validation,
    Internal,
    Canceled,
    Timeout,
}

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub message: String,
    pub kind: ErrorKind,
    pub resource_id: Option<ResourceId>,
    pub operation: Option<Operation>,
    /// Cloud-side status or error code, when known
    pub code: Option<String>,
    /// Minimum pause before the failed call may be repeated
    pub retry_after: Option<Duration>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}.{}] ", id.resource_type, id.name)?;
        }
        if let Some(op) = self.operation {
            write!(f, "{}: ", op)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(ref code) = self.code {
            write!(f, " (code: {})", code)?;
        }
        if self.kind == ErrorKind::Timeout {
            write!(f, " (timeout elapsed)")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Internal,
            resource_id: None,
            operation: None,
            code: None,
            retry_after: None,
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::Validation)
    }

    pub fn absent(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::Absent)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::Timeout)
    }

    pub fn canceled() -> Self {
        Self::new("operation canceled").with_kind(ErrorKind::Canceled)
    }

    /// Build from a classifier verdict and the call that produced it
    pub fn from_verdict(verdict: &Verdict, err: ApiError) -> Self {
        let code = err
            .error_code()
            .or_else(|| err.status().map(|s| s.to_string()));
        let (kind, message) = match verdict {
            Verdict::Absent => (ErrorKind::Absent, "resource not found".to_string()),
            Verdict::Retry(_) => (ErrorKind::Retryable, err.to_string()),
            Verdict::DependencyConflict(deps) => (
                ErrorKind::Conflict,
                format!(
                    "resource is still referenced by: {}",
                    deps.iter()
                        .map(|d| format!("{} {}", d.kind, d.id))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ),
            Verdict::ValidationFailed(msg) => (ErrorKind::Validation, msg.clone()),
            Verdict::Internal(msg) => (ErrorKind::Internal, msg.clone()),
        };
        let mut out = Self::new(message).with_kind(kind).with_cause(err);
        out.code = code;
        if let Verdict::Retry(delay) = verdict {
            out.retry_after = Some(*delay);
        }
        out
    }

    /// Attach the resource address unless one is already recorded
    pub fn for_resource(mut self, id: ResourceId) -> Self {
        if self.resource_id.is_none() {
            self.resource_id = Some(id);
        }
        self
    }

    /// Attach the operation unless one is already recorded
    pub fn during(mut self, op: Operation) -> Self {
        if self.operation.is_none() {
            self.operation = Some(op);
        }
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, d: Duration) -> Self {
        self.retry_after = Some(d);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Prefix the message with what was being attempted
    pub fn context(mut self, what: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", what, self.message);
        self
    }

    pub fn is_absent(&self) -> bool {
        self.kind == ErrorKind::Absent
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }
}

impl From<ApiError> for ProviderError {
    fn from(err: ApiError) -> Self {
        let verdict = crate::classify::ServiceRules::default().classify(&err);
        ProviderError::from_verdict(&verdict, err)
    }
}

impl From<crate::importer::ImportError> for ProviderError {
    fn from(err: crate::importer::ImportError) -> Self {
        ProviderError::validation(err.to_string()).with_cause(err)
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_resource_operation_code_and_timeout() {
        let err = ProviderError::timeout("waiting for instance i-1 to become RUNNING")
            .with_code("CREATING")
            .during(Operation::Create)
            .for_resource(ResourceId::new("dcs_instance", "cache"));
        assert_eq!(
            err.to_string(),
            "[dcs_instance.cache] create: waiting for instance i-1 to become RUNNING (code: CREATING) (timeout elapsed)"
        );
    }

    #[test]
    fn first_address_and_operation_win() {
        let err = ProviderError::new("boom")
            .during(Operation::Update)
            .during(Operation::Read)
            .for_resource(ResourceId::new("a", "b"))
            .for_resource(ResourceId::new("c", "d"));
        assert_eq!(err.operation, Some(Operation::Update));
        assert_eq!(err.resource_id, Some(ResourceId::new("a", "b")));
    }

    #[test]
    fn error_code_from_flat_and_nested_bodies() {
        let flat = ApiError::http(400, r#"{"error_code":"DCS.4026","error_msg":"busy"}"#);
        assert_eq!(flat.error_code().as_deref(), Some("DCS.4026"));
        assert_eq!(flat.error_message().as_deref(), Some("busy"));

        let nested = ApiError::http(400, r#"{"error":{"code":"ER.0001","message":"bad"}}"#);
        assert_eq!(nested.error_code().as_deref(), Some("ER.0001"));

        let plain = ApiError::http(500, "Internal Server Error");
        assert_eq!(plain.error_code(), None);
    }

    #[test]
    fn api_error_converts_through_default_rules() {
        let err: ProviderError = ApiError::http(404, "{}").into();
        assert!(err.is_absent());
        assert_eq!(err.code.as_deref(), Some("404"));
    }

    #[test]
    fn retry_verdict_keeps_its_delay() {
        let err = ProviderError::from_verdict(
            &Verdict::Retry(Duration::from_secs(60)),
            ApiError::http(429, "{}"),
        );
        assert_eq!(err.kind, ErrorKind::Retryable);
        assert_eq!(err.retry_after, Some(Duration::from_secs(60)));

        let terminal = ProviderError::from_verdict(
            &Verdict::ValidationFailed("bad flavor".into()),
            ApiError::http(400, "{}"),
        );
        assert_eq!(terminal.retry_after, None);
    }
}
