//! Provider configuration block
//!
//! Deserialized from the host's `provider` block. Options left out of the
//! block fall back to `CIRRUS_*` environment variables.

use std::collections::BTreeMap;

use cirrus_core::schema::{FieldDescriptor, FieldType, ResourceSchema};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CLOUD: &str = "myhuaweicloud.com";
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid provider configuration: {0}")]
    Parse(String),

    #[error("missing credentials: set access_key/secret_key or auth_token")]
    MissingCredentials,

    #[error("conflicting credentials: access_key/secret_key and auth_token are mutually exclusive")]
    ConflictingCredentials,

    #[error("{0} is set but {1} is missing")]
    IncompleteKeyPair(&'static str, &'static str),

    #[error("region is required")]
    MissingRegion,

    #[error("invalid endpoint for '{service}': {reason}")]
    InvalidEndpoint { service: String, reason: String },
}

/// How requests are authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    AccessKey { access_key: String, secret_key: String },
    Token(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub domain_name: Option<String>,
    /// Service key -> endpoint URL overrides
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub insecure: bool,
    /// Endpoint domain suffix
    #[serde(default)]
    pub cloud: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Project name -> project ID, consulted before asking IAM
    #[serde(default)]
    pub projects: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// Parse the host block, filling gaps from the process environment
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        Self::from_value_with_env(value, |name| std::env::var(name).ok())
    }

    pub fn from_value_with_env<E>(value: &serde_json::Value, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut config: ProviderConfig = if value.is_null() {
            ProviderConfig::default()
        } else {
            serde_json::from_value(strip_nulls(value)).map_err(|e| ConfigError::Parse(e.to_string()))?
        };

        let fallback = |slot: &mut Option<String>, name: &str| {
            if slot.as_deref().is_none_or(str::is_empty) {
                *slot = env(name).filter(|v| !v.is_empty());
            }
        };
        fallback(&mut config.access_key, "CIRRUS_ACCESS_KEY");
        fallback(&mut config.secret_key, "CIRRUS_SECRET_KEY");
        fallback(&mut config.auth_token, "CIRRUS_AUTH_TOKEN");
        fallback(&mut config.region, "CIRRUS_REGION");
        fallback(&mut config.project_id, "CIRRUS_PROJECT_ID");

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credentials()?;
        self.region()?;
        for (service, endpoint) in &self.endpoints {
            let parsed = url::Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
                service: service.clone(),
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidEndpoint {
                    service: service.clone(),
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
        }
        Ok(())
    }

    /// Exactly one of the AK/SK pair and the token
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        let has_pair = present(&self.access_key) || present(&self.secret_key);

        match (has_pair, self.auth_token.as_ref().filter(|t| !t.is_empty())) {
            (true, Some(_)) => Err(ConfigError::ConflictingCredentials),
            (false, Some(token)) => Ok(Credentials::Token(token.clone())),
            (false, None) => Err(ConfigError::MissingCredentials),
            (true, None) => match (&self.access_key, &self.secret_key) {
                (Some(ak), Some(sk)) if !ak.is_empty() && !sk.is_empty() => Ok(Credentials::AccessKey {
                    access_key: ak.clone(),
                    secret_key: sk.clone(),
                }),
                (Some(ak), _) if !ak.is_empty() => Err(ConfigError::IncompleteKeyPair("access_key", "secret_key")),
                _ => Err(ConfigError::IncompleteKeyPair("secret_key", "access_key")),
            },
        }
    }

    pub fn region(&self) -> Result<&str, ConfigError> {
        self.region
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or(ConfigError::MissingRegion)
    }

    pub fn cloud(&self) -> &str {
        self.cloud.as_deref().filter(|c| !c.is_empty()).unwrap_or(DEFAULT_CLOUD)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    /// Schema of the block as published through GetSchema
    pub fn schema() -> ResourceSchema {
        let string = |name: &str| FieldDescriptor::new(name, FieldType::String).optional();
        ResourceSchema::new("provider")
            .field(string("access_key").sensitive())
            .field(string("secret_key").sensitive())
            .field(string("auth_token").sensitive())
            .field(string("region").with_description("Region all resources are created in unless overridden"))
            .field(string("project_name"))
            .field(string("project_id"))
            .field(string("domain_name"))
            .field(
                FieldDescriptor::new("endpoints", FieldType::map_of(FieldType::String))
                    .optional()
                    .with_description("Per-service endpoint overrides"),
            )
            .field(FieldDescriptor::new("insecure", FieldType::Bool).optional().with_default(false))
            .field(string("cloud").with_default(DEFAULT_CLOUD))
            .field(
                FieldDescriptor::new("max_retries", FieldType::Int)
                    .optional()
                    .with_default(DEFAULT_MAX_RETRIES as i64),
            )
            .field(FieldDescriptor::new("projects", FieldType::map_of(FieldType::String)).optional())
    }
}

/// Hosts send unset options as explicit nulls
fn strip_nulls(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
