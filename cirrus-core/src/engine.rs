//! Engine - Routes host requests to resource handlers
//!
//! Builds the operation context (deadline from the resource's timeouts,
//! cancellation from the host, service locator from `configure`) and enforces
//! the guarantees shared by every resource: the identifier is kept when a
//! create fails half-way, a vanished resource is dropped from state, an
//! update with nothing to push makes no calls.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::context::{CancelSignal, OperationContext};
use crate::differ::{self, PlanResult};
use crate::error::{ProviderError, ProviderResult};
use crate::importer::ImportError;
use crate::provider::{Meta, Provider, ResourceDefinition};
use crate::resource::{Attributes, ResourceData, ResourceId, State, Value};
use crate::schema::Presence;
use crate::timeouts::Operation;

/// Result of an apply step. A failed step may still carry state, e.g. the
/// identifier of a resource whose create did not converge.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub state: Option<State>,
    pub error: Option<ProviderError>,
}

impl ApplyOutcome {
    fn ok(state: Option<State>) -> Self {
        Self { state, error: None }
    }

    fn failed(state: Option<State>, error: ProviderError) -> Self {
        Self {
            state,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Engine {
    provider: Arc<dyn Provider>,
    resources: BTreeMap<String, ResourceDefinition>,
    meta: RwLock<Option<Meta>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("provider", &self.provider.name())
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl Engine {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        let resources = provider
            .resources()
            .into_iter()
            .map(|def| (def.name().to_string(), def))
            .collect();
        Self {
            provider,
            resources,
            meta: RwLock::new(None),
        }
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn definition(&self, resource_type: &str) -> ProviderResult<&ResourceDefinition> {
        self.resources.get(resource_type).ok_or_else(|| {
            ProviderError::validation(format!("unknown resource type '{}'", resource_type))
        })
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Field descriptors of the provider block and every resource
    pub fn schema(&self) -> serde_json::Value {
        let resources: serde_json::Map<String, serde_json::Value> = self
            .resources
            .iter()
            .map(|(name, def)| (name.clone(), def.schema.describe()))
            .collect();
        serde_json::json!({
            "provider": self.provider.config_schema().describe(),
            "resources": resources,
        })
    }

    pub fn validate_config(&self, config: &serde_json::Value) -> ProviderResult<()> {
        self.provider.validate_config(config)
    }

    pub async fn configure(&self, config: &serde_json::Value) -> ProviderResult<()> {
        self.provider.validate_config(config)?;
        let meta = self.provider.configure(config).await?;
        *self.meta.write().unwrap_or_else(|e| e.into_inner()) = Some(meta);
        tracing::info!(provider = self.provider.name(), "provider configured");
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.meta
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Diagnostics for a resource configuration; empty when valid
    pub fn validate_resource(
        &self,
        resource_type: &str,
        config: &Attributes,
    ) -> ProviderResult<Vec<String>> {
        let def = self.definition(resource_type)?;
        Ok(match def.schema.validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.iter().map(ToString::to_string).collect(),
        })
    }

    pub fn plan(
        &self,
        resource_type: &str,
        prior: Option<&Attributes>,
        proposed: Option<&Attributes>,
    ) -> ProviderResult<PlanResult> {
        let def = self.definition(resource_type)?;
        Ok(differ::diff(&def.schema, prior, proposed))
    }

    fn context(
        &self,
        op: Operation,
        def: &ResourceDefinition,
        address: &ResourceId,
        attributes: &Attributes,
        cancel: CancelSignal,
    ) -> OperationContext {
        let budget = def.timeouts.resolve(op, attributes);
        let ctx = OperationContext::new(op, budget, cancel).with_address(address.clone());
        let meta = self.meta.read().unwrap_or_else(|e| e.into_inner()).clone();
        match meta {
            Some(meta) => ctx.with_meta(meta),
            None => ctx,
        }
    }

    /// Route an apply step to create, update or delete
    pub async fn apply(
        &self,
        address: &ResourceId,
        prior: Option<&State>,
        planned: Option<&Attributes>,
        cancel: CancelSignal,
    ) -> ApplyOutcome {
        match (prior.filter(|s| s.exists), planned) {
            (None, Some(desired)) => self.create(address, desired, cancel).await,
            (Some(prior), Some(desired)) => self.update(address, prior, desired, cancel).await,
            (Some(prior), None) => match self.delete(address, prior, cancel).await {
                Ok(()) => ApplyOutcome::ok(None),
                Err(e) => ApplyOutcome::failed(Some(prior.clone()), e),
            },
            (None, None) => ApplyOutcome::ok(None),
        }
    }

    pub async fn create(
        &self,
        address: &ResourceId,
        desired: &Attributes,
        cancel: CancelSignal,
    ) -> ApplyOutcome {
        let op = Operation::Create;
        let def = match self.definition(&address.resource_type) {
            Ok(def) => def,
            Err(e) => return ApplyOutcome::failed(None, e.during(op).for_resource(address.clone())),
        };
        let ctx = self.context(op, def, address, desired, cancel);
        let mut data = ResourceData::new(address.clone(), def.schema.clone()).with_attributes(desired.clone());

        tracing::info!(resource = %address, "creating");
        tracing::debug!(resource = %address, attributes = %def.schema.redact(desired), "desired state");

        let result = match def.handler.create(&ctx, &mut data).await {
            Ok(()) => def.handler.read(&ctx, &mut data).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(resource = %address, id = data.id_or_empty(), "created");
                ApplyOutcome::ok(Some(data.into_state()))
            }
            Err(e) => {
                let e = e.during(op).for_resource(address.clone());
                // Keep the identifier so a later delete can reclaim the resource
                let partial = data.id().is_some().then(|| data.into_state());
                if let Some(state) = &partial {
                    tracing::warn!(resource = %address, id = ?state.identifier, error = %e, "create failed after the resource was allocated");
                }
                ApplyOutcome::failed(partial, e)
            }
        }
    }

    pub async fn read(
        &self,
        address: &ResourceId,
        prior: &State,
        cancel: CancelSignal,
    ) -> ProviderResult<Option<State>> {
        let op = Operation::Read;
        let def = self.definition(&address.resource_type)?;
        let identifier = identifier_of(prior).map_err(|e| e.during(op).for_resource(address.clone()))?;
        let ctx = self.context(op, def, address, &prior.attributes, cancel);
        let mut data = ResourceData::new(address.clone(), def.schema.clone())
            .with_attributes(prior.attributes.clone())
            .with_prior(prior.attributes.clone())
            .with_identifier(identifier);

        match def.handler.read(&ctx, &mut data).await {
            Ok(()) => Ok(Some(data.into_state())),
            Err(e) if e.is_absent() => {
                tracing::info!(resource = %address, "resource no longer exists, dropping from state");
                Ok(None)
            }
            Err(e) => Err(e.during(op).for_resource(address.clone())),
        }
    }

    pub async fn update(
        &self,
        address: &ResourceId,
        prior: &State,
        desired: &Attributes,
        cancel: CancelSignal,
    ) -> ApplyOutcome {
        let op = Operation::Update;
        let fail = |e: ProviderError| ApplyOutcome::failed(Some(prior.clone()), e.during(op).for_resource(address.clone()));

        let def = match self.definition(&address.resource_type) {
            Ok(def) => def,
            Err(e) => return fail(e),
        };
        let identifier = match identifier_of(prior) {
            Ok(id) => id,
            Err(e) => return fail(e),
        };

        let mut attributes = desired.clone();
        // Server-owned values are never pushed
        for field in def.schema.fields.values() {
            let unset = attributes.get(&field.name).is_none_or(Value::is_null);
            match field.presence {
                Presence::Computed => {
                    match prior.attributes.get(&field.name) {
                        Some(v) => attributes.insert(field.name.clone(), v.clone()),
                        None => attributes.remove(&field.name),
                    };
                }
                Presence::OptionalComputed if unset => {
                    if let Some(v) = prior.attributes.get(&field.name) {
                        attributes.insert(field.name.clone(), v.clone());
                    }
                }
                _ => {}
            }
        }

        let ctx = self.context(op, def, address, &attributes, cancel);
        let mut data = ResourceData::new(address.clone(), def.schema.clone())
            .with_prior(prior.attributes.clone())
            .with_attributes(attributes)
            .with_identifier(identifier);

        let changed: Vec<&str> = def
            .schema
            .fields
            .values()
            .filter(|f| !f.presence.is_computed() || f.presence == Presence::OptionalComputed)
            .filter(|f| f.name != "timeouts")
            .filter(|f| data.has_change(&f.name))
            .map(|f| f.name.as_str())
            .collect();

        if changed.is_empty() {
            tracing::debug!(resource = %address, "nothing to update");
            return ApplyOutcome::ok(Some(data.into_state()));
        }

        let replace: Vec<&str> = changed
            .iter()
            .copied()
            .filter(|name| def.schema.get(name).is_some_and(|f| f.force_new))
            .collect();
        if !replace.is_empty() {
            return fail(ProviderError::validation(format!(
                "changing {} requires replacing the resource",
                replace.join(", ")
            )));
        }

        tracing::info!(resource = %address, changed = ?changed, "updating");

        let result = match def.handler.update(&ctx, &mut data).await {
            Ok(()) => def.handler.read(&ctx, &mut data).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => ApplyOutcome::ok(Some(data.into_state())),
            Err(e) => fail(e),
        }
    }

    pub async fn delete(
        &self,
        address: &ResourceId,
        prior: &State,
        cancel: CancelSignal,
    ) -> ProviderResult<()> {
        let op = Operation::Delete;
        let def = self.definition(&address.resource_type)?;
        let identifier = identifier_of(prior).map_err(|e| e.during(op).for_resource(address.clone()))?;
        let ctx = self.context(op, def, address, &prior.attributes, cancel);
        let data = ResourceData::new(address.clone(), def.schema.clone())
            .with_attributes(prior.attributes.clone())
            .with_prior(prior.attributes.clone())
            .with_identifier(identifier);

        tracing::info!(resource = %address, id = data.id_or_empty(), "deleting");
        match def.handler.delete(&ctx, &data).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_absent() => {
                tracing::debug!(resource = %address, "already deleted");
                Ok(())
            }
            Err(e) => Err(e.during(op).for_resource(address.clone())),
        }
    }

    /// Decode `external_id`, then read the full state
    pub async fn import(
        &self,
        address: &ResourceId,
        external_id: &str,
        cancel: CancelSignal,
    ) -> ProviderResult<State> {
        let op = Operation::Import;
        let decorate = |e: ProviderError| e.during(op).for_resource(address.clone());

        let def = self.definition(&address.resource_type).map_err(decorate)?;
        let importer = def
            .importer
            .as_ref()
            .ok_or_else(|| ImportError::Unsupported(address.resource_type.clone()))
            .map_err(|e| decorate(e.into()))?;

        let ctx = self.context(op, def, address, &Attributes::new(), cancel);
        let mut data = ResourceData::new(address.clone(), def.schema.clone());
        importer
            .apply(external_id, &mut data)
            .map_err(|e| decorate(e.into()))?;
        if data.id().is_none() {
            data.set_id(external_id);
        }

        def.handler.import(&ctx, &mut data).await.map_err(decorate)?;
        match def.handler.read(&ctx, &mut data).await {
            Ok(()) => {
                tracing::info!(resource = %address, id = external_id, "imported");
                Ok(data.into_state())
            }
            Err(e) if e.is_absent() => Err(decorate(
                ProviderError::validation(format!("cannot import non-existent remote object '{}'", external_id))
                    .with_code("404"),
            )),
            Err(e) => Err(decorate(e)),
        }
    }
}

fn identifier_of(state: &State) -> ProviderResult<String> {
    state
        .identifier
        .clone()
        .or_else(|| state.attributes.get("id").and_then(Value::as_str).map(str::to_string))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProviderError::new("resource has no identifier in state"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelHandle;
    use crate::error::ErrorKind;
    use crate::importer::ImportFormat;
    use crate::provider::ResourceHandler;
    use crate::schema::{FieldDescriptor, FieldType, ResourceSchema};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Cloud {
        calls: Mutex<Vec<&'static str>>,
        exists: Mutex<bool>,
        fail_create_wait: bool,
        updates: AtomicUsize,
    }

    #[derive(Clone)]
    struct Handler(Arc<Cloud>);

    #[async_trait]
    impl ResourceHandler for Handler {
        async fn create(
            &self,
            ctx: &OperationContext,
            data: &mut ResourceData,
        ) -> ProviderResult<()> {
            self.0.calls.lock().unwrap().push("create");
            *self.0.exists.lock().unwrap() = true;
            data.set_id("i-1");
            if self.0.fail_create_wait {
                ctx.sleep(Duration::from_secs(3600)).await?;
            }
            Ok(())
        }

        async fn read(
            &self,
            _ctx: &OperationContext,
            data: &mut ResourceData,
        ) -> ProviderResult<()> {
            self.0.calls.lock().unwrap().push("read");
            if !*self.0.exists.lock().unwrap() {
                return Err(ProviderError::absent("not found"));
            }
            data.set("status", "RUNNING");
            Ok(())
        }

        async fn update(
            &self,
            _ctx: &OperationContext,
            _data: &mut ResourceData,
        ) -> ProviderResult<()> {
            self.0.updates.fetch_add(1, Ordering::SeqCst);
            self.0.calls.lock().unwrap().push("update");
            Ok(())
        }

        async fn delete(
            &self,
            _ctx: &OperationContext,
            _data: &ResourceData,
        ) -> ProviderResult<()> {
            self.0.calls.lock().unwrap().push("delete");
            let mut exists = self.0.exists.lock().unwrap();
            if !*exists {
                return Err(ProviderError::absent("not found"));
            }
            *exists = false;
            Ok(())
        }
    }

    struct TestProvider(Arc<Cloud>);

    #[async_trait]
    impl Provider for TestProvider {
        fn name(&self) -> &'static str {
            "test"
        }

        fn config_schema(&self) -> ResourceSchema {
            ResourceSchema::new("provider")
        }

        fn resources(&self) -> Vec<ResourceDefinition> {
            let schema = ResourceSchema::new("cache")
                .field(FieldDescriptor::new("name", FieldType::String).required())
                .field(FieldDescriptor::new("engine", FieldType::String).required().force_new())
                .field(FieldDescriptor::new("status", FieldType::String).computed())
                .with_timeouts();
            vec![ResourceDefinition::new(schema, Handler(self.0.clone())).with_importer(ImportFormat::id_only())]
        }

        fn validate_config(&self, _config: &serde_json::Value) -> ProviderResult<()> {
            Ok(())
        }

        async fn configure(&self, _config: &serde_json::Value) -> ProviderResult<Meta> {
            Ok(Arc::new(()))
        }
    }

    fn engine(cloud: Cloud) -> (Engine, Arc<Cloud>) {
        let cloud = Arc::new(cloud);
        (Engine::new(Arc::new(TestProvider(cloud.clone()))), cloud)
    }

    fn address() -> ResourceId {
        ResourceId::new("cache", "main")
    }

    fn desired(name: &str, engine: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), Value::from(name));
        attrs.insert("engine".into(), Value::from(engine));
        attrs
    }

    #[tokio::test]
    async fn create_then_read_populates_computed_values() {
        let (engine, cloud) = engine(Cloud::default());
        let outcome = engine.create(&address(), &desired("a", "Redis"), CancelSignal::never()).await;
        assert!(outcome.is_ok());
        let state = outcome.state.unwrap();
        assert_eq!(state.identifier.as_deref(), Some("i-1"));
        assert_eq!(state.attributes.get("status"), Some(&Value::from("RUNNING")));
        assert_eq!(*cloud.calls.lock().unwrap(), vec!["create", "read"]);
    }

    #[tokio::test(start_paused = true)]
    async fn create_timeout_keeps_identifier() {
        let (engine, _) = engine(Cloud {
            fail_create_wait: true,
            ..Default::default()
        });
        let handle = CancelHandle::new();
        let canceler = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            handle.cancel();
        };
        let attrs = desired("a", "Redis");
        let address = address();
        let (outcome, _) = tokio::join!(engine.create(&address, &attrs, handle.signal()), canceler);
        let err = outcome.error.unwrap();
        assert!(err.is_canceled());
        assert_eq!(err.operation, Some(Operation::Create));
        assert_eq!(outcome.state.unwrap().identifier.as_deref(), Some("i-1"));
    }

    #[tokio::test]
    async fn update_without_changes_makes_no_calls() {
        let (engine, cloud) = engine(Cloud::default());
        let created = engine
            .create(&address(), &desired("a", "Redis"), CancelSignal::never())
            .await
            .state
            .unwrap();
        cloud.calls.lock().unwrap().clear();

        let outcome = engine
            .update(&address(), &created, &desired("a", "Redis"), CancelSignal::never())
            .await;
        assert!(outcome.is_ok());
        assert!(cloud.calls.lock().unwrap().is_empty());
        assert_eq!(cloud.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_pushes_changes_then_reads() {
        let (engine, cloud) = engine(Cloud::default());
        let created = engine
            .create(&address(), &desired("a", "Redis"), CancelSignal::never())
            .await
            .state
            .unwrap();
        cloud.calls.lock().unwrap().clear();

        let outcome = engine
            .update(&address(), &created, &desired("b", "Redis"), CancelSignal::never())
            .await;
        assert!(outcome.is_ok());
        assert_eq!(*cloud.calls.lock().unwrap(), vec!["update", "read"]);
    }

    #[tokio::test]
    async fn force_new_change_is_not_updated_in_place() {
        let (engine, cloud) = engine(Cloud::default());
        let created = engine
            .create(&address(), &desired("a", "Redis"), CancelSignal::never())
            .await
            .state
            .unwrap();
        let outcome = engine
            .update(&address(), &created, &desired("a", "Memcached"), CancelSignal::never())
            .await;
        let err = outcome.error.unwrap();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("engine"));
        assert_eq!(cloud.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_then_read_is_absent() {
        let (engine, _) = engine(Cloud::default());
        let created = engine
            .create(&address(), &desired("a", "Redis"), CancelSignal::never())
            .await
            .state
            .unwrap();
        engine.delete(&address(), &created, CancelSignal::never()).await.unwrap();
        assert_eq!(engine.read(&address(), &created, CancelSignal::never()).await.unwrap(), None);
        // Deleting twice is not an error
        engine.delete(&address(), &created, CancelSignal::never()).await.unwrap();
    }

    #[tokio::test]
    async fn read_is_stable() {
        let (engine, _) = engine(Cloud::default());
        let created = engine
            .create(&address(), &desired("a", "Redis"), CancelSignal::never())
            .await
            .state
            .unwrap();
        let once = engine.read(&address(), &created, CancelSignal::never()).await.unwrap().unwrap();
        let twice = engine.read(&address(), &once, CancelSignal::never()).await.unwrap().unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn import_reads_full_state() {
        let (engine, cloud) = engine(Cloud::default());
        *cloud.exists.lock().unwrap() = true;
        let state = engine.import(&address(), "i-9", CancelSignal::never()).await.unwrap();
        assert_eq!(state.identifier.as_deref(), Some("i-9"));
        assert_eq!(state.attributes.get("status"), Some(&Value::from("RUNNING")));

        *cloud.exists.lock().unwrap() = false;
        let err = engine.import(&address(), "i-9", CancelSignal::never()).await.unwrap_err();
        assert!(err.message.contains("non-existent"));
    }

    #[tokio::test]
    async fn unknown_resource_type_is_a_validation_error() {
        let (engine, _) = engine(Cloud::default());
        let err = engine.plan("nope", None, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn configure_installs_meta() {
        let (engine, _) = engine(Cloud::default());
        assert!(!engine.is_configured());
        engine.configure(&serde_json::json!({})).await.unwrap();
        assert!(engine.is_configured());
        assert!(engine.schema()["resources"]["cache"]["attributes"]["engine"].is_object());
    }
}
