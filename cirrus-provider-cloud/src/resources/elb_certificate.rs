//! Load balancer certificate
//!
//! The delete API refuses to remove a certificate that a listener still
//! references and answers 409 with the listener IDs. The listeners are
//! detached first, then the delete is issued again.

use std::sync::Arc;

use async_trait::async_trait;
use cirrus_core::context::OperationContext;
use cirrus_core::deleter::{self, DependencyResolver};
use cirrus_core::error::{Dependent, ErrorKind, ProviderError, ProviderResult};
use cirrus_core::importer::ImportFormat;
use cirrus_core::provider::{ResourceDefinition, ResourceHandler};
use cirrus_core::resource::ResourceData;
use cirrus_core::retry::RetryConf;
use cirrus_core::schema::{FieldDescriptor, FieldType, ResourceSchema, suppress, types};
use serde_json::json;

use super::{compact, region_field, set_str, str_at, strings_at};
use crate::client::ServiceClient;
use crate::registry;
use crate::rules;

pub const RESOURCE_TYPE: &str = "elb_certificate";

const UPDATABLE: &[&str] = &["name", "description", "domain", "certificate", "private_key"];

pub fn definition() -> ResourceDefinition {
    ResourceDefinition::new(schema(), ElbCertificate).with_importer(ImportFormat::id_only())
}

pub fn schema() -> ResourceSchema {
    let string = |name: &str| FieldDescriptor::new(name, FieldType::String);

    ResourceSchema::new(RESOURCE_TYPE)
        .with_description("Certificate used by HTTPS listeners")
        .field(region_field())
        .field(string("name").optional_computed())
        .field(string("description").optional())
        .field(
            FieldDescriptor::new("type", types::string_enum(&["server", "client"]))
                .optional()
                .force_new()
                .with_default("server"),
        )
        .field(string("domain").optional())
        .field(
            string("certificate")
                .required()
                .suppress_diff_with(suppress::trimmed_equal)
                .with_description("PEM-encoded certificate body"),
        )
        .field(
            string("private_key")
                .optional()
                .sensitive()
                .suppress_diff_with(suppress::trimmed_equal),
        )
        .field(string("create_time").computed())
        .field(string("update_time").computed())
        .field(string("expire_time").computed())
}

/// Drops a certificate from the listeners that still reference it
pub struct ListenerDetacher {
    client: Arc<ServiceClient>,
}

impl ListenerDetacher {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }
}

/// Body that removes `cert_id` from a listener's SNI list. `None` when the
/// listener no longer references it.
pub fn detach_patch(
    listener: &serde_json::Value,
    cert_id: &str,
) -> ProviderResult<Option<serde_json::Value>> {
    if str_at(listener, "/listener/default_tls_container_ref") == cert_id {
        return Err(ProviderError::new(format!(
            "certificate {} is the default certificate of listener {}",
            cert_id,
            str_at(listener, "/listener/id")
        ))
        .with_kind(ErrorKind::Conflict));
    }
    let refs = strings_at(listener, "/listener/sni_container_refs");
    if !refs.iter().any(|r| r == cert_id) {
        return Ok(None);
    }
    let remaining: Vec<String> = refs.into_iter().filter(|r| r != cert_id).collect();
    Ok(Some(json!({"listener": {"sni_container_refs": remaining}})))
}

#[async_trait]
impl DependencyResolver for ListenerDetacher {
    async fn detach(
        &self,
        ctx: &OperationContext,
        dependent: &Dependent,
        resource_id: &str,
    ) -> ProviderResult<()> {
        if dependent.kind != "listener" {
            return Err(ProviderError::new(format!(
                "cannot detach certificate from {} {}",
                dependent.kind, dependent.id
            ))
            .with_kind(ErrorKind::Conflict));
        }

        let path = format!("elb/listeners/{}", dependent.id);
        let retry = RetryConf::new(rules::elb());
        let listener = retry.call(ctx, || self.client.get(&path)).await?;
        let Some(patch) = detach_patch(&listener, resource_id)? else {
            tracing::debug!(listener = %dependent.id, "listener no longer references the certificate");
            return Ok(());
        };

        tracing::info!(listener = %dependent.id, certificate = resource_id, "detaching certificate from listener");
        retry
            .call(ctx, || self.client.patch(&path, patch.clone()))
            .await?;
        Ok(())
    }
}

pub struct ElbCertificate;

fn path(id: &str) -> String {
    format!("elb/certificates/{}", id)
}

#[async_trait]
impl ResourceHandler for ElbCertificate {
    async fn create(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let client = registry::client(ctx, "elb", data.get_str("region")).await?;
        let body = compact(json!({
            "name": data.get_str("name"),
            "description": data.get_str("description"),
            "type": data.get_str("type"),
            "domain": data.get_str("domain"),
            "certificate": data.get_str("certificate").map(str::trim),
            "private_key": data.get_str("private_key").map(str::trim),
        }));
        let response = RetryConf::new(rules::elb())
            .call(ctx, || client.post("elb/certificates", body.clone()))
            .await?;
        let id = str_at(&response, "/id");
        if id.is_empty() {
            return Err(ProviderError::new("create response carried no certificate id"));
        }
        data.set_id(id);
        Ok(())
    }

    async fn read(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let client = registry::client(ctx, "elb", data.get_str("region")).await?;
        let path = path(data.id_or_empty());
        let body = RetryConf::new(rules::elb())
            .call(ctx, || client.get(&path))
            .await?;

        for field in [
            "name",
            "description",
            "type",
            "domain",
            "certificate",
            "create_time",
            "update_time",
            "expire_time",
        ] {
            set_str(data, field, &body, &format!("/{}", field));
        }
        Ok(())
    }

    async fn update(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let client = registry::client(ctx, "elb", data.get_str("region")).await?;
        let mut body = serde_json::Map::new();
        for field in UPDATABLE {
            if data.has_change(field) {
                body.insert(
                    field.to_string(),
                    json!(data.get_str(field).map(str::trim).unwrap_or_default()),
                );
            }
        }
        if body.is_empty() {
            return Ok(());
        }
        let path = path(data.id_or_empty());
        let body = serde_json::Value::Object(body);
        RetryConf::new(rules::elb())
            .call(ctx, || client.put(&path, body.clone()))
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OperationContext, data: &ResourceData) -> ProviderResult<()> {
        let client = registry::client(ctx, "elb", data.get_str("region")).await?;
        let id = data.id_or_empty();
        let path = path(id);
        let resolver = ListenerDetacher::new(client.clone());
        let (client, path) = (&client, path.as_str());

        deleter::delete_with_dependents(ctx, rules::elb(), id, &resolver, || async move {
            client.delete(path).await.map(|_| ())
        })
        .await?;
        Ok(())
    }
}
