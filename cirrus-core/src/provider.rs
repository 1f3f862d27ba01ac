//! Provider - Traits abstracting resource operations
//!
//! A Provider publishes a set of resource definitions for one cloud and knows
//! how to turn its configuration block into a service locator. Each resource
//! implements the CRUDI contract through a [`ResourceHandler`].

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::OperationContext;
use crate::error::ProviderResult;
use crate::importer::ImportFormat;
use crate::resource::ResourceData;
use crate::schema::ResourceSchema;
use crate::timeouts::Timeouts;

/// Return type for boxed async callbacks
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Configured provider state handed to every operation through the context
pub type Meta = Arc<dyn Any + Send + Sync>;

/// Per-resource CRUDI handlers
///
/// Handlers read desired values from `data`, and write observed values and the
/// cloud identifier back into it. A handler signals that the resource is gone
/// by returning an `Absent` error; the engine turns that into "drop from state".
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Issue the create call. Record the identifier with `data.set_id` as soon
    /// as the cloud returns it, before waiting for convergence.
    async fn create(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()>;

    /// Populate every attribute the server owns
    async fn read(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()>;

    /// Push the difference between `data.prior_attributes()` and the desired values
    async fn update(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()>;

    async fn delete(&self, ctx: &OperationContext, data: &ResourceData) -> ProviderResult<()>;

    /// Extra hydration after the import ID has been decoded
    async fn import(
        &self,
        _ctx: &OperationContext,
        _data: &mut ResourceData,
    ) -> ProviderResult<()> {
        Ok(())
    }
}

/// A named, versioned resource type
#[derive(Clone)]
pub struct ResourceDefinition {
    pub schema: Arc<ResourceSchema>,
    pub timeouts: Timeouts,
    pub importer: Option<ImportFormat>,
    pub handler: Arc<dyn ResourceHandler>,
}

impl std::fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name())
            .field("version", &self.schema.version)
            .field("timeouts", &self.timeouts)
            .field("importer", &self.importer)
            .finish()
    }
}

impl ResourceDefinition {
    pub fn new(schema: ResourceSchema, handler: impl ResourceHandler + 'static) -> Self {
        Self {
            schema: Arc::new(schema),
            timeouts: Timeouts::default(),
            importer: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_importer(mut self, importer: ImportFormat) -> Self {
        self.importer = Some(importer);
        self
    }

    /// Name under which the host addresses this resource
    pub fn name(&self) -> &str {
        &self.schema.resource_type
    }
}

/// Main Provider trait
///
/// Each cloud provider implements this trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name of this Provider (e.g., "cloud")
    fn name(&self) -> &'static str;

    /// Schema of the provider configuration block
    fn config_schema(&self) -> ResourceSchema;

    /// Every resource type this Provider can handle
    fn resources(&self) -> Vec<ResourceDefinition>;

    /// Check a configuration block without contacting the cloud
    fn validate_config(&self, config: &serde_json::Value) -> ProviderResult<()>;

    /// Build the service locator shared by every operation
    async fn configure(&self, config: &serde_json::Value) -> ProviderResult<Meta>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelSignal;
    use crate::resource::ResourceId;
    use crate::schema::{FieldDescriptor, FieldType};
    use crate::timeouts::Operation;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ResourceHandler for Echo {
        async fn create(
            &self,
            _ctx: &OperationContext,
            data: &mut ResourceData,
        ) -> ProviderResult<()> {
            data.set_id("echo-1");
            Ok(())
        }

        async fn read(
            &self,
            _ctx: &OperationContext,
            data: &mut ResourceData,
        ) -> ProviderResult<()> {
            data.set("status", "ACTIVE");
            Ok(())
        }

        async fn update(
            &self,
            _ctx: &OperationContext,
            _data: &mut ResourceData,
        ) -> ProviderResult<()> {
            Ok(())
        }

        async fn delete(
            &self,
            _ctx: &OperationContext,
            _data: &ResourceData,
        ) -> ProviderResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_writes_identifier_and_observed_values() {
        let def = ResourceDefinition::new(
            ResourceSchema::new("echo")
                .field(FieldDescriptor::new("status", FieldType::String).computed()),
            Echo,
        )
        .with_importer(ImportFormat::id_only());
        assert_eq!(def.name(), "echo");

        let ctx = OperationContext::new(Operation::Create, Duration::from_secs(5), CancelSignal::never());
        let mut data = ResourceData::new(ResourceId::new("echo", "a"), def.schema.clone());
        def.handler.create(&ctx, &mut data).await.unwrap();
        def.handler.read(&ctx, &mut data).await.unwrap();
        def.handler.import(&ctx, &mut data).await.unwrap();
        assert_eq!(data.id(), Some("echo-1"));
        assert_eq!(data.get_str("status"), Some("ACTIVE"));
    }
}
