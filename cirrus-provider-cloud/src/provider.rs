//! Cloud provider implementation
//!
//! Wires the configuration block, the authenticator and the transport into a
//! [`ClientRegistry`] that every resource operation reaches through its
//! context.

use std::sync::Arc;

use async_trait::async_trait;
use cirrus_core::error::{ProviderError, ProviderResult};
use cirrus_core::provider::{Meta, Provider, ResourceDefinition};
use cirrus_core::schema::ResourceSchema;

use crate::auth;
use crate::config::ProviderConfig;
use crate::registry::ClientRegistry;
use crate::resources;
use crate::transport::{HttpTransport, Transport};

/// Provider for the cloud's REST services
#[derive(Default)]
pub struct CloudProvider {
    /// Fixed transport; built from the configuration when `None`
    transport: Option<Arc<dyn Transport>>,
}

impl CloudProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send every request through `transport` instead of HTTPS
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    fn parse(config: &serde_json::Value) -> ProviderResult<ProviderConfig> {
        let config = ProviderConfig::from_value(config).map_err(|e| ProviderError::validation(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ProviderError::validation(e.to_string()))?;
        Ok(config)
    }
}

#[async_trait]
impl Provider for CloudProvider {
    fn name(&self) -> &'static str {
        "cloud"
    }

    fn config_schema(&self) -> ResourceSchema {
        ProviderConfig::schema()
    }

    fn resources(&self) -> Vec<ResourceDefinition> {
        resources::definitions()
    }

    fn validate_config(&self, config: &serde_json::Value) -> ProviderResult<()> {
        Self::parse(config).map(|_| ())
    }

    async fn configure(&self, config: &serde_json::Value) -> ProviderResult<Meta> {
        let config = Self::parse(config)?;
        let credentials = config
            .credentials()
            .map_err(|e| ProviderError::validation(e.to_string()))?;

        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => {
                let http = HttpTransport::new(config.insecure, config.max_retries())
                    .map_err(|e| ProviderError::new(e.to_string()).context("building HTTP client"))?;
                Arc::new(http) as Arc<dyn Transport>
            }
        };
        let authenticator: Arc<dyn auth::Authenticator> = Arc::from(auth::from_credentials(credentials));

        let registry = ClientRegistry::new(config, transport, authenticator)?;
        tracing::info!(region = registry.region(), "cloud provider configured");
        Ok(Arc::new(registry))
    }
}
